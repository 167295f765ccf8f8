//! Connection fan-out.
//!
//! The hub tracks two kinds of listeners:
//! - Session subscribers, which receive every broadcast for a session
//! - Shell attachments, at most one connection per shell
//!
//! Both maps sit behind one lock. Broadcasts snapshot the subscriber list,
//! send without holding the lock, then prune failed connections.

mod protocol;

pub use protocol::{
    connection_pair, Attachment, ClientMessage, Connection, ConnectionId, RemoteEnd,
    ServerMessage,
};

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ControlError, Result};

#[derive(Debug, Default)]
struct HubState {
    sessions: HashMap<String, Vec<Connection>>,
    shells: HashMap<String, Connection>,
}

/// Tracks live connections per session and per shell.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    state: Mutex<HubState>,
}

impl ConnectionHub {
    /// Empty hub with no subscribers or shell attachments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to a session's broadcast list.
    pub async fn subscribe(&self, session_id: &str, connection: Connection) {
        let id = connection.id();
        let mut state = self.state.lock().await;
        let subscribers = state.sessions.entry(session_id.to_string()).or_default();
        if subscribers.iter().all(|c| c.id() != id) {
            subscribers.push(connection);
        }
        debug!(session_id, connection_id = id, "Subscriber added");
    }

    /// Removes a connection from a session. Returns false if it was not
    /// subscribed.
    pub async fn unsubscribe(&self, session_id: &str, connection_id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(subscribers) = state.sessions.get_mut(session_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|c| c.id() != connection_id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            state.sessions.remove(session_id);
        }
        if removed {
            info!(session_id, connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Drops every subscriber of a session.
    pub async fn remove_session(&self, session_id: &str) -> usize {
        let mut state = self.state.lock().await;
        state.sessions.remove(session_id).map_or(0, |subs| subs.len())
    }

    /// Number of live subscribers of a session.
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let state = self.state.lock().await;
        state.sessions.get(session_id).map_or(0, Vec::len)
    }

    /// Sends `message` to every subscriber of `session_id`.
    ///
    /// Sends never wait: a connection that is closed or whose buffer is full
    /// counts as failed and is pruned. Returns how many subscribers received
    /// the message.
    pub async fn broadcast(&self, session_id: &str, message: ServerMessage) -> usize {
        let subscribers = {
            let state = self.state.lock().await;
            match state.sessions.get(session_id) {
                Some(subscribers) => subscribers.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for connection in &subscribers {
            if connection.try_send(message.clone()) {
                delivered += 1;
            } else {
                failed.push(connection.id());
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            if let Some(subscribers) = state.sessions.get_mut(session_id) {
                subscribers.retain(|c| !failed.contains(&c.id()));
                if subscribers.is_empty() {
                    state.sessions.remove(session_id);
                }
            }
            debug!(
                session_id,
                pruned = failed.len(),
                "Pruned closed or stalled connections"
            );
        }
        delivered
    }

    /// Binds the exclusive connection of a shell.
    pub async fn bind_shell(&self, shell_id: &str, connection: Connection) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.shells.get(shell_id) {
            if !existing.is_closed() {
                return Err(ControlError::already_attached(shell_id));
            }
        }
        debug!(shell_id, connection_id = connection.id(), "Shell bound");
        state.shells.insert(shell_id.to_string(), connection);
        Ok(())
    }

    /// Releases the connection of a shell, returning it if one was bound.
    pub async fn unbind_shell(&self, shell_id: &str) -> Option<Connection> {
        let mut state = self.state.lock().await;
        let removed = state.shells.remove(shell_id);
        if removed.is_some() {
            debug!(shell_id, "Shell unbound");
        }
        removed
    }

    /// Returns true if a connection is bound to the shell.
    pub async fn is_shell_bound(&self, shell_id: &str) -> bool {
        self.state.lock().await.shells.contains_key(shell_id)
    }

    /// Sends to the connection bound to a shell. False if none is bound or
    /// the send failed.
    pub async fn send_to_shell(&self, shell_id: &str, message: ServerMessage) -> bool {
        let connection = {
            let state = self.state.lock().await;
            match state.shells.get(shell_id) {
                Some(connection) => connection.clone(),
                None => return false,
            }
        };
        connection.send(message).await
    }
}
