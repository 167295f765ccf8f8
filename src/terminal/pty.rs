//! Pseudo-terminal plumbing for interactive shells.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use rustix::process::{kill_process_group, test_kill_process_group, Pid, Signal};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::runtime::ShellLaunch;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A launch command running on the slave side of a pseudo-terminal.
///
/// The child is a session leader, so its pid is also its process group id.
pub(crate) struct Pty {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    writer: SharedWriter,
    pid: Option<u32>,
}

impl Pty {
    /// Opens a terminal of the given size and spawns `launch` on it.
    ///
    /// Returns the terminal and a blocking reader over its master side.
    pub(crate) fn spawn(
        launch: &ShellLaunch,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, Box<dyn Read + Send>)> {
        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(|e| ControlError::io(format!("Failed to open pty: {e}")))?;

        let mut builder = CommandBuilder::new(&launch.program);
        builder.args(&launch.args);
        if let Some(cwd) = &launch.cwd {
            builder.cwd(cwd);
        }
        builder.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| ControlError::start(format!("Failed to spawn `{launch}`: {e}")))?;
        // Only the child may hold the slave, otherwise reads never see EOF
        drop(pair.slave);

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                return Err(ControlError::io(format!("Failed to open pty handles: {e}")));
            }
        };

        let pid = child.process_id();
        debug!(?pid, "Spawned `{}` on pty", launch);
        Ok((
            Self {
                master: Mutex::new(Some(pair.master)),
                child: Mutex::new(Some(child)),
                writer: Arc::new(Mutex::new(writer)),
                pid,
            },
            reader,
        ))
    }

    /// Pid (and process group id) of the spawned launch command.
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Applies a window size change to the terminal.
    pub(crate) fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let master = master
            .as_ref()
            .ok_or_else(|| ControlError::io("terminal already closed"))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| ControlError::io(format!("Failed to resize pty: {e}")))
    }

    /// Writes bytes to the master side.
    pub(crate) async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await
        .map_err(|e| ControlError::io(format!("pty writer task failed: {e}")))?
        .map_err(|e| ControlError::io(format!("Failed to write to pty: {e}")))
    }

    /// Returns true once the launch command has exited (reaping it).
    fn child_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Two-phase shutdown: SIGTERM the process group, wait up to `grace` for
    /// it to drain, then SIGKILL. Releases the child and the master side.
    pub(crate) async fn terminate(&self, grace: Duration) {
        let pgid = self.pid.and_then(|pid| i32::try_from(pid).ok());

        match pgid {
            Some(pgid) => {
                signal_group(pgid, Signal::TERM);
                let deadline = Instant::now() + grace;
                let mut drained = false;
                while Instant::now() < deadline {
                    if self.child_exited() && !process_group_alive(pgid) {
                        drained = true;
                        break;
                    }
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                }
                if !drained {
                    debug!(pgid, "Process group survived SIGTERM, sending SIGKILL");
                    signal_group(pgid, Signal::KILL);
                }
            }
            None => {
                let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(child) = child.as_mut() {
                    let _ = child.kill();
                }
            }
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
        }

        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Returns true if any process is still a member of group `pgid`.
pub(crate) fn process_group_alive(pgid: i32) -> bool {
    Pid::from_raw(pgid).is_some_and(|pid| test_kill_process_group(pid).is_ok())
}

fn signal_group(pgid: i32, signal: Signal) {
    let Some(pid) = Pid::from_raw(pgid) else {
        return;
    };
    match kill_process_group(pid, signal) {
        Ok(()) => {}
        Err(rustix::io::Errno::SRCH) => debug!(pgid, "Process group already gone"),
        Err(e) => warn!(pgid, "Failed to signal process group: {}", e),
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Pumps master output into `tx` until EOF, a read error, or the receiver
/// going away. Runs on a blocking thread.
pub(crate) fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            // EIO once the slave side is closed
            Err(e) => {
                debug!("pty read ended: {}", e);
                break;
            }
        }
    }
}

/// Incremental UTF-8 decoder that carries incomplete sequences over to the
/// next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes whatever is left, lossily.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
