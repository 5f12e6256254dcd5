//! Concurrency and termination tests for jsbridge-core.
//!
//! Engines are independent: each runs on its own thread, so work in one
//! engine neither blocks nor is terminated by work in another.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use jsbridge_common::EngineConfig;
use jsbridge_core::{BridgeError, Engine, Environment};

const SLEEP: Duration = Duration::from_millis(100);

fn new_engine() -> Engine {
    Engine::new(&EngineConfig::default()).unwrap()
}

fn wait_until_running(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !engine.is_running() {
        assert!(Instant::now() < deadline, "engine never started running");
        thread::sleep(Duration::from_millis(1));
    }
}

fn install_sleep(env: &Environment) {
    env.add_func("sleep", |args| {
        let ms = args.first().and_then(serde_json::Value::as_u64).unwrap_or(0);
        thread::sleep(Duration::from_millis(ms));
        None
    })
    .unwrap();
}

// ============================================================================
// Test: Termination
// ============================================================================

#[test]
fn test_terminate_infinite_loop() {
    let engine = new_engine();
    let env = Environment::in_engine(&engine).unwrap();

    let runner = env.clone();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let result = runner.evaluate("while (true) {}", "loop.js");
        tx.send(()).unwrap();
        result
    });

    wait_until_running(&engine);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    env.terminate();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(BridgeError::Terminated)));

    // The environment stays usable after termination.
    assert_eq!(env.evaluate("1 + 2", "").unwrap(), json!(3));
}

#[test]
fn test_terminate_only_specific_engine() {
    let first_engine = new_engine();
    let second_engine = new_engine();
    let first = Environment::in_engine(&first_engine).unwrap();
    let second = Environment::in_engine(&second_engine).unwrap();

    let (first_tx, first_rx) = mpsc::channel();
    let (second_tx, second_rx) = mpsc::channel();

    let runner = first.clone();
    let first_handle = thread::spawn(move || {
        let result = runner.evaluate("while (true) {}", "first.js");
        first_tx.send(()).unwrap();
        result
    });
    let runner = second.clone();
    let second_handle = thread::spawn(move || {
        let result = runner.evaluate("while (true) {}", "second.js");
        second_tx.send(()).unwrap();
        result
    });

    wait_until_running(&first_engine);
    wait_until_running(&second_engine);

    second.terminate();
    second_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(
        second_handle.join().unwrap(),
        Err(BridgeError::Terminated)
    ));

    // The other engine keeps running.
    assert!(first_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(first_engine.is_running());

    first.terminate();
    assert!(matches!(
        first_handle.join().unwrap(),
        Err(BridgeError::Terminated)
    ));
}

#[test]
fn test_terminate_when_idle_does_not_affect_next_operation() {
    let engine = new_engine();
    let env = Environment::in_engine(&engine).unwrap();

    env.terminate();
    engine.terminate();

    assert_eq!(env.evaluate("'still alive'", "").unwrap(), json!("still alive"));
}

#[test]
fn test_terminate_inside_callback() {
    let engine = new_engine();
    let env = Environment::in_engine(&engine).unwrap();
    let inner = env.clone();
    env.add_func("stop", move |_| {
        inner.terminate();
        None
    })
    .unwrap();

    let result = env.evaluate("stop(); while (true) {}", "");
    assert!(matches!(result, Err(BridgeError::Terminated)));

    assert_eq!(env.evaluate("2 * 21", "").unwrap(), json!(42));
    env.destroy().unwrap();
}

#[test]
fn test_terminate_shared_engine_aborts_running_environment() {
    let engine = new_engine();
    let busy = Environment::in_engine(&engine).unwrap();
    let other = Environment::in_engine(&engine).unwrap();

    let runner = busy.clone();
    let handle = thread::spawn(move || runner.evaluate("for (;;) {}", ""));

    wait_until_running(&engine);
    other.terminate();

    assert!(matches!(handle.join().unwrap(), Err(BridgeError::Terminated)));
    assert_eq!(other.evaluate("1", "").unwrap(), json!(1));
}

// ============================================================================
// Test: Parallelism
// ============================================================================

#[test]
fn test_parallel_engines() {
    const ENGINES: u32 = 8;

    let envs: Vec<Environment> = (0..ENGINES)
        .map(|_| {
            let env = Environment::in_engine(&new_engine()).unwrap();
            install_sleep(&env);
            env
        })
        .collect();

    let start = Instant::now();
    let handles: Vec<_> = envs
        .into_iter()
        .map(|env| {
            thread::spawn(move || {
                env.call("sleep", &[json!(SLEEP.as_millis() as u64)])
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let elapsed = start.elapsed();

    assert!(elapsed >= SLEEP);
    assert!(
        elapsed < SLEEP * ENGINES / 2,
        "engines did not run in parallel: {elapsed:?}"
    );
}

#[test]
fn test_shared_environment_serializes_operations() {
    let env = Environment::in_engine(&new_engine()).unwrap();
    env.evaluate("var hits = 0;", "").unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let env = env.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    env.evaluate("hits += 1;", "").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(env.evaluate("hits", "").unwrap(), json!(200));
}

#[test]
fn test_many_environments_in_one_engine() {
    let engine = new_engine();

    let envs: Vec<Environment> = (0..50)
        .map(|i| {
            let env = Environment::in_engine(&engine).unwrap();
            env.evaluate(&format!("var id = {i};"), "").unwrap();
            env
        })
        .collect();

    for (i, env) in envs.iter().enumerate() {
        assert_eq!(env.evaluate("id", "").unwrap(), json!(i));
    }
    for env in &envs {
        env.destroy().unwrap();
    }
}

#[test]
fn test_values_dropped_on_other_threads() {
    let env = Environment::in_engine(&new_engine()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let env = env.clone();
            thread::spawn(move || {
                let value = env.to_value(&i).unwrap();
                assert_eq!(value.to_json().unwrap(), i.to_string());
                value
            })
        })
        .collect();
    let values: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(env.value_count(), 8);

    thread::spawn(move || drop(values)).join().unwrap();

    assert_eq!(env.value_count(), 0);
    assert_eq!(env.native_value_count(), Some(0));
}

#[test]
fn test_destroyed_engine_rejects_new_environments() {
    let engine = new_engine();
    engine.destroy();

    let err = Environment::in_engine(&engine).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig { .. }));
}
