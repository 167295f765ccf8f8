//! Typed messages exchanged with remote connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::runtime::StreamKind;

/// Per-connection buffer, in messages.
const CONNECTION_BUFFER_SIZE: usize = 256;

/// Identifier of a live connection, unique within the process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages sent from the control plane to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once a connection subscribes
    ConnectionEstablished {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// An agent task began
    TaskStarted {
        session_id: String,
        task: String,
        timestamp: DateTime<Utc>,
    },
    /// Incremental assistant text
    TextDelta {
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// The agent invoked a tool
    ToolCall {
        tool_name: String,
        arguments: Value,
        timestamp: DateTime<Utc>,
    },
    /// The last tool call returned
    ToolComplete {
        timestamp: DateTime<Utc>,
    },
    /// An agent task finished
    TaskCompleted {
        session_id: String,
        task: String,
        timestamp: DateTime<Utc>,
    },
    /// A chunk of output from a streamed command
    CommandOutput { stream: StreamKind, data: String },
    /// A streamed command ended
    CommandFinished { exit_code: Option<i64> },
    /// Raw terminal output for an attached shell
    Output { data: String },
    /// The shell behind an attachment has gone away
    Exit { shell_id: String },
    /// Something failed on the control plane side
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Greeting for a new subscriber of `session_id`.
    pub fn connection_established(session_id: &str) -> Self {
        Self::ConnectionEstablished {
            session_id: session_id.to_string(),
            message: format!("Connected to session {session_id}"),
            timestamp: Utc::now(),
        }
    }

    /// Error message stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::TaskStarted { .. } => "task_started",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolComplete { .. } => "tool_complete",
            Self::TaskCompleted { .. } => "task_completed",
            Self::CommandOutput { .. } => "command_output",
            Self::CommandFinished { .. } => "command_finished",
            Self::Output { .. } => "output",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
        }
    }
}

/// Messages received from a connection attached to a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes to write to the terminal
    Input { data: String },
    /// New window size
    Resize { rows: u16, cols: u16 },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parses a JSON text frame. Anything unparseable is `Unknown`.
    pub fn from_json(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(Self::Unknown)
    }
}

/// Outbound half of a connection, as held by the hub.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl Connection {
    /// Creates an outbound-only connection and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Delivers a message; false once the remote end is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Delivers a message without waiting for buffer space.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Returns true if the remote end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Server side of a bidirectional connection, consumed when attaching a
/// shell.
#[derive(Debug)]
pub struct Attachment {
    pub connection: Connection,
    pub inbound: mpsc::Receiver<ClientMessage>,
}

/// Remote side of a bidirectional connection.
///
/// Transport adapters pump frames between this and the network; tests drive
/// it directly.
#[derive(Debug)]
pub struct RemoteEnd {
    pub id: ConnectionId,
    pub messages: mpsc::Receiver<ServerMessage>,
    pub input: mpsc::Sender<ClientMessage>,
}

impl RemoteEnd {
    /// Next message from the control plane, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.messages.recv().await
    }

    /// Sends a client message; false once the server side is gone.
    pub async fn send(&self, message: ClientMessage) -> bool {
        self.input.send(message).await.is_ok()
    }
}

/// Creates both ends of a bidirectional connection.
pub fn connection_pair() -> (Attachment, RemoteEnd) {
    let (connection, messages) = Connection::channel();
    let (input, inbound) = mpsc::channel(CONNECTION_BUFFER_SIZE);
    let id = connection.id();
    (
        Attachment {
            connection,
            inbound,
        },
        RemoteEnd {
            id,
            messages,
            input,
        },
    )
}
