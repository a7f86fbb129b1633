//! End-to-end tests driving a real forked worker process over the pipe
//! protocol. These exercise the scenarios the in-process `Sandbox` tests
//! cannot: process isolation, fork, and cross-process callback
//! reentrancy.

use luaward::{Callbacks, HostOptions, IsolatedWorker, ScriptValue};

fn spawn(options: HostOptions) -> IsolatedWorker {
    IsolatedWorker::spawn(options).expect("worker should spawn")
}

#[test]
fn basic_arithmetic_across_process_boundary() {
    let mut worker = spawn(HostOptions::default());
    worker.execute("x = 100; y = 200").unwrap();
    worker.execute("assert(x + y == 300)").unwrap();
    worker.close().unwrap();
}

#[test]
fn function_call_round_trip() {
    let mut worker = spawn(HostOptions::default());
    worker
        .execute("function mul(a, b) return a * b end")
        .unwrap();
    let result = worker
        .call("mul", &[ScriptValue::Int(6), ScriptValue::Int(7)])
        .unwrap();
    assert_eq!(result, ScriptValue::Int(42));
    worker.close().unwrap();
}

#[test]
fn function_exists_round_trip() {
    let mut worker = spawn(HostOptions::default());
    worker.execute("function f() end").unwrap();
    assert!(worker.function_exists("f").unwrap());
    assert!(!worker.function_exists("nope").unwrap());
    worker.close().unwrap();
}

#[test]
fn callback_reentrancy_round_trip() {
    let callbacks = Callbacks::new().register("reverse", |args| match args.first() {
        Some(ScriptValue::Str(s)) => {
            let mut r = s.clone();
            r.reverse();
            ScriptValue::Str(r)
        }
        _ => ScriptValue::Nil,
    });
    let options = HostOptions {
        callbacks,
        ..Default::default()
    };
    let mut worker = spawn(options);
    worker.execute(r#"r = reverse("LuaWard")"#).unwrap();
    worker.execute("function get_r() return r end").unwrap();
    let result = worker.call("get_r", &[]).unwrap();
    assert_eq!(result, ScriptValue::Str(b"draWauL".to_vec()));
    worker.close().unwrap();
}

#[test]
fn memory_cap_is_enforced_in_worker() {
    let options = HostOptions {
        memory_limit: Some(256 * 1024),
        ..Default::default()
    };
    let mut worker = spawn(options);
    let err = worker
        .execute("t={} for i=1,1000000 do t[i]='leak '..i end")
        .unwrap_err();
    assert!(err.to_string().contains("not enough memory"));
    worker.execute("return 'alive'").unwrap();
    worker.close().unwrap();
}

#[test]
fn instruction_cap_is_enforced_in_worker() {
    let options = HostOptions {
        instruction_limit: Some(2_000),
        ..Default::default()
    };
    let mut worker = spawn(options);
    let err = worker.execute("while true do end").unwrap_err();
    assert!(err.to_string().contains("Instruction limit exceeded"));
    worker.close().unwrap();
}

#[test]
fn sandbox_denies_os_and_io_in_worker() {
    let mut worker = spawn(HostOptions::default());
    let err = worker
        .execute(r#"os.execute("ls")"#)
        .unwrap_err();
    assert!(err.to_string().contains("nil value"));

    let err = worker
        .execute(r#"io.open("/etc/passwd", "r")"#)
        .unwrap_err();
    assert!(err.to_string().contains("nil value"));
    worker.close().unwrap();
}

#[test]
fn close_reaps_the_child_process() {
    let worker = spawn(HostOptions::default());
    worker.close().expect("close should join the child cleanly");
}
