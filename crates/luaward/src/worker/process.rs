//! Fork-based worker process: spawns a child, applies OS isolation in
//! it, runs an [`Interpreter`] there, and exposes an [`IsolatedWorker`]
//! handle in the parent that drives it over the framed pipe channel in
//! `super::ipc`.

use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, ForkResult, Pid};
use tracing::{error, info, warn};

use crate::types::{Callbacks, Command, HostOptions, ScriptError, ScriptValue, WorkerError, WorkerResult};
use crate::vm::{CallbackBridge, Interpreter};
use crate::worker::ipc;
use crate::worker::isolation;

/// Parent-side handle to an isolated worker process. Each public
/// operation takes `&mut self`, so concurrent calls from safe Rust are a
/// compile error rather than a pipe-interleaving race.
pub struct IsolatedWorker {
    cmd_write: OwnedFd,
    result_read: OwnedFd,
    child_pid: Pid,
    callbacks: Callbacks,
    dead: bool,
    /// Set once the child has been `waitpid`'d, by `close` or by `Drop`,
    /// so the other of the two never repeats the reap against an
    /// already-gone process.
    reaped: bool,
}

impl IsolatedWorker {
    /// Forks a worker process configured by `options`. Returns
    /// immediately once the child has been started; the child applies
    /// isolation and builds its interpreter concurrently, so the first
    /// `execute`/`call` simply blocks on the result pipe until it is
    /// ready.
    pub fn spawn(options: HostOptions) -> Result<Self, WorkerError> {
        let (cmd_read, cmd_write) = pipe().map_err(|e| WorkerError::Io(e.to_string()))?;
        let (result_read, result_write) = pipe().map_err(|e| WorkerError::Io(e.to_string()))?;
        let callbacks = options.callbacks.clone();

        // Safety: this process has not spawned other threads at this
        // point in construction. Callers must not call `spawn` from a
        // process that already has multiple threads running, since a
        // lock held by another thread at fork time would deadlock in
        // the single-threaded child that inherits its copy.
        match unsafe { fork() }.map_err(|e| WorkerError::Io(format!("fork failed: {e}")))? {
            ForkResult::Child => {
                drop(cmd_write);
                drop(result_read);
                run_child(options, cmd_read, result_write);
                unreachable!("run_child always exits the process");
            }
            ForkResult::Parent { child } => {
                drop(cmd_read);
                drop(result_write);
                Ok(Self {
                    cmd_write,
                    result_read,
                    child_pid: child,
                    callbacks,
                    dead: false,
                    reaped: false,
                })
            }
        }
    }

    /// Loads and runs `source` as a chunk, discarding return values.
    pub fn execute(&mut self, source: &str) -> Result<(), WorkerError> {
        self.send_command(Command::Execute(source.to_string()))?;
        self.wait_for_result()?;
        Ok(())
    }

    /// Calls the global function `name` with `args`.
    pub fn call(&mut self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, WorkerError> {
        self.send_command(Command::Call(name.to_string(), args.to_vec()))?;
        Ok(self.wait_for_result()?.unwrap_or(ScriptValue::Nil))
    }

    /// True iff `name` resolves to a callable global in the worker.
    pub fn function_exists(&mut self, name: &str) -> Result<bool, WorkerError> {
        self.send_command(Command::FunctionExists(name.to_string()))?;
        match self.wait_for_result()? {
            Some(ScriptValue::Bool(b)) => Ok(b),
            _ => Ok(false),
        }
    }

    /// Sends STOP and joins the child. Always reaps the process, even if
    /// the STOP write failed, so a dead worker does not become a zombie.
    /// Marks itself reaped first so the `Drop` impl that still runs when
    /// `self` goes out of scope does not repeat the `waitpid` against an
    /// already-gone process.
    pub fn close(mut self) -> Result<(), WorkerError> {
        if !self.dead {
            let _ = ipc::send(&self.cmd_write, &Command::Stop);
        }
        self.reaped = true;
        waitpid(self.child_pid, None).map_err(|e| WorkerError::Io(e.to_string()))?;
        Ok(())
    }

    fn send_command(&mut self, cmd: Command) -> Result<(), WorkerError> {
        if self.dead {
            return Err(WorkerError::Dead);
        }
        ipc::send(&self.cmd_write, &cmd).map_err(|e| {
            self.dead = true;
            e
        })
    }

    /// Drains result messages, servicing any CALLBACK round-trips
    /// inline, until the final SUCCESS/ERROR/CRITICAL for the command
    /// that is currently in flight.
    fn wait_for_result(&mut self) -> Result<Option<ScriptValue>, WorkerError> {
        loop {
            let result: WorkerResult = match ipc::recv(&self.result_read) {
                Ok(r) => r,
                Err(e) => {
                    self.dead = true;
                    return Err(e);
                }
            };
            match result {
                WorkerResult::Success(v) => return Ok(v),
                WorkerResult::Error(msg) => {
                    return Err(WorkerError::Script(ScriptError::Runtime(msg)))
                }
                WorkerResult::Critical(msg) => {
                    self.dead = true;
                    return Err(WorkerError::Critical(msg));
                }
                WorkerResult::Callback(name, args) => {
                    let response = self.run_callback(&name, &args);
                    if let Err(e) = ipc::send(&self.cmd_write, &Command::CallbackResult(response))
                    {
                        self.dead = true;
                        return Err(e);
                    }
                }
            }
        }
    }

    fn run_callback(&self, name: &str, args: &[ScriptValue]) -> ScriptValue {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.callbacks.call(name, args)));
        match outcome {
            Ok(Some(value)) => value,
            Ok(None) => ScriptValue::Str(format!("Callback '{name}' not found").into_bytes()),
            Err(_) => ScriptValue::Str(format!("Error in callback {name}: panicked").into_bytes()),
        }
    }
}

impl Drop for IsolatedWorker {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if !self.dead {
            let _ = ipc::send(&self.cmd_write, &Command::Stop);
        }
        let _ = waitpid(self.child_pid, None);
    }
}

/// Forwards a script-initiated callback call to the parent over the
/// result pipe and blocks on the command pipe for the reply. Runs
/// entirely inside the worker child, on the same thread that is driving
/// the interpreter.
struct PipeCallbackBridge {
    cmd_read: Rc<OwnedFd>,
    result_write: Rc<OwnedFd>,
    stop_requested: Arc<AtomicBool>,
}

impl CallbackBridge for PipeCallbackBridge {
    fn invoke(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        if ipc::send(
            self.result_write.as_ref(),
            &WorkerResult::Callback(name.to_string(), args.to_vec()),
        )
        .is_err()
        {
            self.stop_requested.store(true, Ordering::Relaxed);
            return Err("lost connection to parent during callback".to_string());
        }

        loop {
            match ipc::recv::<Command>(self.cmd_read.as_ref()) {
                Ok(Command::CallbackResult(value)) => return Ok(value),
                Ok(Command::Stop) => {
                    warn!("worker stopped during callback wait");
                    self.stop_requested.store(true, Ordering::Relaxed);
                    return Err("worker stopped during callback".to_string());
                }
                Ok(other) => {
                    warn!(?other, "unexpected command received while awaiting callback result");
                }
                Err(e) => {
                    error!(error = %e, "error reading command during callback wait");
                    self.stop_requested.store(true, Ordering::Relaxed);
                    return Err(e.to_string());
                }
            }
        }
    }
}

/// Entry point run inside the forked child. Never returns: every path
/// ends in `std::process::exit`.
fn run_child(options: HostOptions, cmd_read: OwnedFd, result_write: OwnedFd) -> ! {
    info!("worker started");

    if let Err(e) = isolation::apply(&options) {
        error!(error = %e, "isolation setup failed");
        let _ = ipc::send(&result_write, &WorkerResult::Critical(format!("Init failed: {e}")));
        std::process::exit(1);
    }

    let cmd_read = Rc::new(cmd_read);
    let result_write = Rc::new(result_write);
    let stop_requested = Arc::new(AtomicBool::new(false));
    let bridge: Rc<dyn CallbackBridge> = Rc::new(PipeCallbackBridge {
        cmd_read: cmd_read.clone(),
        result_write: result_write.clone(),
        stop_requested: stop_requested.clone(),
    });

    let callback_names = options.callbacks.names();
    let interpreter = match Interpreter::new(
        options.memory_limit,
        options.instruction_limit,
        &callback_names,
        bridge,
    ) {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "interpreter construction failed");
            let _ = ipc::send(
                result_write.as_ref(),
                &WorkerResult::Critical(format!("Init failed: {e}")),
            );
            std::process::exit(1);
        }
    };

    info!("entering command loop");
    loop {
        let cmd: Command = match ipc::recv(cmd_read.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "critical error reading next command");
                let _ = ipc::send(result_write.as_ref(), &WorkerResult::Critical(e.to_string()));
                std::process::exit(1);
            }
        };

        let should_break = dispatch(&cmd, &interpreter, result_write.as_ref());
        if should_break || stop_requested.load(Ordering::Relaxed) {
            break;
        }
    }

    std::process::exit(0);
}

/// Runs one command against `interpreter`, posting its result. Returns
/// `true` if the command loop should exit (STOP, or an unrecoverable
/// panic).
fn dispatch(cmd: &Command, interpreter: &Interpreter, result_write: &OwnedFd) -> bool {
    match cmd {
        Command::Stop => {
            info!("received STOP command");
            true
        }
        Command::Execute(source) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| interpreter.execute(source)));
            post_script_result(outcome, result_write, |()| None)
        }
        Command::Call(name, args) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| interpreter.call(name, args)));
            post_script_result(outcome, result_write, Some)
        }
        Command::FunctionExists(name) => {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| interpreter.function_exists(name)));
            post_script_result(outcome, result_write, |b| Some(ScriptValue::Bool(b)))
        }
        Command::CallbackResult(_) => {
            warn!("received unexpected CALLBACK_RESULT in main command loop");
            false
        }
    }
}

fn post_script_result<T>(
    outcome: std::thread::Result<Result<T, ScriptError>>,
    result_write: &OwnedFd,
    to_value: impl FnOnce(T) -> Option<ScriptValue>,
) -> bool {
    match outcome {
        Ok(Ok(value)) => {
            let _ = ipc::send(result_write, &WorkerResult::Success(to_value(value)));
            false
        }
        Ok(Err(e)) => {
            warn!(error = %e, "script error");
            let _ = ipc::send(result_write, &WorkerResult::Error(e.to_string()));
            false
        }
        Err(_) => {
            error!("panic while dispatching command");
            let _ = ipc::send(
                result_write,
                &WorkerResult::Critical("panic while running script".to_string()),
            );
            true
        }
    }
}
