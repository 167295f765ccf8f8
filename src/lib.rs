//! Control plane for containerized agent development sandboxes.
//!
//! A session pairs a host workspace with a long-lived sandbox. On top of
//! sessions the crate provides:
//! - one-shot command execution with streamed output ([`exec`])
//! - a registry of detached background processes ([`process`])
//! - interactive terminals relayed over typed connections ([`terminal`])
//! - fan-out of session events to subscribers ([`hub`])
//! - the file, search and shell tools an agent calls ([`tools`])
//!
//! [`control::ControlPlane`] wires everything together.

pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod hub;
pub mod logging;
pub mod process;
pub mod runtime;
pub mod session;
pub mod terminal;
pub mod tools;

pub use control::ControlPlane;
pub use error::{ControlError, Result};
