//! The isolated worker driver: a fork-based child process that applies
//! OS-level isolation, hosts an [`crate::vm::Interpreter`], and serves
//! requests over a framed pipe protocol with callback reentrancy.

pub(crate) mod ipc;
pub(crate) mod isolation;
mod process;

pub use process::IsolatedWorker;
