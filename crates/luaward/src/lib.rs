//! luaward: embeds a Lua 5.4 interpreter under multi-layered isolation —
//! a bounded allocator, an instruction-count watchdog, a reduced library
//! surface, and an OS-level sandboxed worker process — for hosts that
//! need to run untrusted scripts.

pub mod limiter;
pub mod sandbox;
pub mod types;
pub mod vm;
pub mod worker;

pub use types::{Callbacks, Command, HostOptions, ScriptError, ScriptValue, WorkerError, WorkerResult};
pub use vm::{CallbackBridge, Interpreter, Sandbox};
pub use worker::IsolatedWorker;
