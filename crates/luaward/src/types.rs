//! Foundational public types for the luaward library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`ScriptValue`] — the marshalled value domain crossing the host/script
//!   and worker/parent boundaries
//! - [`HostOptions`] — configuration for a single isolated worker
//! - [`Callbacks`] — the host-side callback registry installed into a worker
//! - [`ScriptError`] / [`WorkerError`] — structured error variants
//! - [`Command`] / [`WorkerResult`] — the wire messages exchanged over IPC

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value that can cross the host/script boundary or the worker/parent
/// IPC boundary. Tables are copied, not proxied: cyclic tables cannot be
/// represented and are rejected during marshalling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// 8-bit clean byte string; Lua strings are not required to be UTF-8.
    Str(Vec<u8>),
    /// A table whose keys were a contiguous run of positive integers
    /// starting at 1.
    Array(Vec<ScriptValue>),
    /// A table with at least one non-sequence key; keys are stringified.
    Map(Vec<(String, ScriptValue)>),
}

impl ScriptValue {
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Int(i) => write!(f, "{i}"),
            ScriptValue::Float(n) => write!(f, "{n}"),
            ScriptValue::Str(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            ScriptValue::Array(items) => write!(f, "[{} items]", items.len()),
            ScriptValue::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
        }
    }
}

/// Errors raised by the embedded interpreter during `execute`/`call`.
/// All of these leave the interpreter alive and reusable for the next
/// operation — only an OS-level kill (rlimit, seccomp denial) poisons it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    /// A Lua syntax or runtime error; the message is the interpreter's
    /// own error text, forwarded verbatim so callers can match on the
    /// stable substrings documented in the crate's error contract
    /// (`not enough memory`, `Instruction limit exceeded`, `not a function`,
    /// `nil value`).
    #[error("{0}")]
    Runtime(String),

    /// `call` was invoked against a global that is not callable.
    #[error("'{0}' is not a function")]
    NotAFunction(String),

    /// A host value could not be marshalled into the script domain, or a
    /// script table could not be marshalled back (cycle, or depth cap
    /// exceeded).
    #[error("marshalling error: {0}")]
    Marshal(String),
}

/// Errors surfaced by the isolated worker handle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A recoverable script-level error; the worker remains usable.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The worker reported a fatal failure (sandbox lockdown, interpreter
    /// construction, an unhandled panic in its command loop) and has
    /// exited. The handle must be closed.
    #[error("worker failed critically: {0}")]
    Critical(String),

    /// The worker process is gone (it died, or was already closed) and
    /// no further operations can be issued.
    #[error("worker is no longer running")]
    Dead,

    /// Failure constructing or using the IPC transport itself (pipe
    /// creation, framing, `fork`, `waitpid`).
    #[error("ipc failure: {0}")]
    Io(String),
}

/// Host-side callback registry. Frozen after construction and handed to
/// the worker at spawn time; callback closures run on the parent process,
/// never inside the sandboxed child.
#[derive(Clone, Default)]
pub struct Callbacks {
    inner: HashMap<String, Arc<dyn Fn(&[ScriptValue]) -> ScriptValue + Send + Sync>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host function under `name`, reachable from scripts as
    /// a global that invokes the callback bridge.
    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[ScriptValue]) -> ScriptValue + Send + Sync + 'static,
    {
        self.inner.insert(name.into(), Arc::new(f));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn call(&self, name: &str, args: &[ScriptValue]) -> Option<ScriptValue> {
        self.inner.get(name).map(|f| f(args))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("names", &self.names())
            .finish()
    }
}

/// Configuration governing a single isolated worker's limiter, sandbox,
/// callback table, and OS-level isolation.
#[derive(Clone, Debug, Default)]
pub struct HostOptions {
    /// Cap on the interpreter's tracked net allocation, in bytes.
    pub memory_limit: Option<usize>,

    /// Cap on the number of Lua VM instructions a single `execute`/`call`
    /// may run before it is aborted.
    pub instruction_limit: Option<u64>,

    /// Host functions reachable from scripts as globals.
    pub callbacks: Callbacks,

    /// If set, the worker drops to this gid during isolation setup.
    /// Applied before `uid` (see [`crate::worker::isolation`]).
    pub gid: Option<u32>,

    /// If set, the worker drops to this uid during isolation setup.
    pub uid: Option<u32>,

    /// Enables network namespace detachment and the seccomp-bpf lockdown.
    /// Unlike `uid`/`gid`/`cpu_limit`, lockdown failure under this flag is
    /// fatal: the worker reports CRITICAL and exits rather than running
    /// unconfined.
    pub full_isolation: bool,

    /// Hard CPU-time limit for the worker process, in seconds. Exceeding
    /// it delivers SIGXCPU/SIGKILL from the kernel; this crate has no
    /// in-band cancellation beyond the instruction limit.
    pub cpu_limit: Option<u64>,
}

/// Commands sent from the parent to the worker over the command pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Execute(String),
    Call(String, Vec<ScriptValue>),
    FunctionExists(String),
    CallbackResult(ScriptValue),
    Stop,
}

/// Results sent from the worker to the parent over the result pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResult {
    Success(Option<ScriptValue>),
    Error(String),
    Critical(String),
    Callback(String, Vec<ScriptValue>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_value_display_formats() {
        assert_eq!(ScriptValue::Nil.to_string(), "nil");
        assert_eq!(ScriptValue::Bool(true).to_string(), "true");
        assert_eq!(ScriptValue::Int(42).to_string(), "42");
        assert_eq!(ScriptValue::Str(b"hi".to_vec()).to_string(), "hi");
    }

    #[test]
    fn callbacks_register_and_call() {
        let cbs = Callbacks::new().register("double", |args| match args.first() {
            Some(ScriptValue::Int(n)) => ScriptValue::Int(n * 2),
            _ => ScriptValue::Nil,
        });
        assert!(cbs.contains("double"));
        assert_eq!(cbs.names(), vec!["double".to_string()]);
        assert_eq!(
            cbs.call("double", &[ScriptValue::Int(21)]),
            Some(ScriptValue::Int(42))
        );
        assert_eq!(cbs.call("missing", &[]), None);
    }

    #[test]
    fn host_options_default_has_no_limits() {
        let opts = HostOptions::default();
        assert!(opts.memory_limit.is_none());
        assert!(opts.instruction_limit.is_none());
        assert!(!opts.full_isolation);
    }

    #[test]
    fn script_error_messages_contain_stable_substrings() {
        let err = ScriptError::NotAFunction("frobnicate".to_string());
        assert!(err.to_string().contains("not a function"));

        let err = ScriptError::Runtime("not enough memory".to_string());
        assert!(err.to_string().contains("not enough memory"));
    }

    #[test]
    fn command_and_result_round_trip_through_bincode() {
        let cmd = Command::Call("f".to_string(), vec![ScriptValue::Int(1)]);
        let bytes = bincode::serialize(&cmd).expect("serialize command");
        let decoded: Command = bincode::deserialize(&bytes).expect("deserialize command");
        match decoded {
            Command::Call(name, args) => {
                assert_eq!(name, "f");
                assert_eq!(args, vec![ScriptValue::Int(1)]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        let res = WorkerResult::Callback("cb".to_string(), vec![ScriptValue::Bool(true)]);
        let bytes = bincode::serialize(&res).expect("serialize result");
        let decoded: WorkerResult = bincode::deserialize(&bytes).expect("deserialize result");
        match decoded {
            WorkerResult::Callback(name, args) => {
                assert_eq!(name, "cb");
                assert_eq!(args, vec![ScriptValue::Bool(true)]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
