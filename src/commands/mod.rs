//! CLI command implementations.
//!
//! Each submodule keeps formatting pure and separate from the calls into the
//! control plane, so output can be tested without a runtime.

pub mod exec;
pub mod health;
pub mod process;
pub mod session;
