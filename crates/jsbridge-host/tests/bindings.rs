//! Integration tests for jsbridge-host.
//!
//! These tests install bindings the way the CLI does and drive them from
//! script, across environments and engines.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use jsbridge_common::{EngineConfig, HostConfig};
use jsbridge_core::{Engine, Environment};
use jsbridge_host::{Capabilities, LogLevel, install_all, preload};

fn isolated_env() -> Environment {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    Environment::in_engine(&engine).unwrap()
}

// ============================================================================
// Test: Console
// ============================================================================

#[test]
fn test_console_levels_and_locations() {
    let env = isolated_env();
    let bindings = install_all(&env, &Capabilities::builder().capture_console().build()).unwrap();
    let console = bindings.console.unwrap();

    env.evaluate(
        "function report(x) {\n  console.warn('value', x);\n}\nreport([1, 2]);\nconsole.debug(null);",
        "report.js",
    )
    .unwrap();

    let entries = console.take_entries();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].level, LogLevel::Warn);
    assert_eq!(entries[0].message, "value [1,2]");
    assert_eq!(entries[0].location.funcname, "report");
    assert_eq!(entries[0].location.filename, "report.js");
    assert_eq!(entries[0].location.line, 2);

    assert_eq!(entries[1].level, LogLevel::Debug);
    assert_eq!(entries[1].message, "null");

    assert!(console.entries().is_empty());
}

#[test]
fn test_console_is_per_environment() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let first = Environment::in_engine(&engine).unwrap();
    let second = Environment::in_engine(&engine).unwrap();

    let console = install_all(&first, &Capabilities::all())
        .unwrap()
        .console
        .unwrap();

    first.evaluate("console.log('first')", "").unwrap();
    second.evaluate("console.log('second')", "").unwrap();

    let entries = console.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "first");
}

#[test]
fn test_console_survives_script_errors() {
    let env = isolated_env();
    let console = install_all(&env, &Capabilities::all())
        .unwrap()
        .console
        .unwrap();

    let err = env
        .evaluate("console.log('before'); throw 'badness';", "fail.js")
        .unwrap_err();
    assert!(err.to_string().contains("badness"));

    env.evaluate("console.log('after')", "").unwrap();

    let messages: Vec<String> = console.entries().into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["before", "after"]);
}

// ============================================================================
// Test: Sleep
// ============================================================================

#[test]
fn test_sleep_in_separate_engines_runs_in_parallel() {
    let sleep = Duration::from_millis(100);
    let start = Instant::now();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let env = isolated_env();
                install_all(&env, &Capabilities::builder().enable_sleep().build()).unwrap();
                env.evaluate("sleep(100); 'done'", "").unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), json!("done"));
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= sleep);
    assert!(elapsed < sleep * 4, "sleeps were serialized: {elapsed:?}");
}

#[test]
fn test_terminate_after_sleep_returns() {
    let env = isolated_env();
    install_all(&env, &Capabilities::builder().enable_sleep().build()).unwrap();

    let runner = env.clone();
    let handle = thread::spawn(move || runner.evaluate("while (true) { sleep(5); }", "spin.js"));

    thread::sleep(Duration::from_millis(50));
    while !handle.is_finished() {
        env.terminate();
        thread::sleep(Duration::from_millis(10));
    }

    let err = handle.join().unwrap().unwrap_err();
    assert!(err.is_terminated());
    assert_eq!(env.evaluate("1 + 2", "").unwrap(), json!(3));
}

// ============================================================================
// Test: Configuration
// ============================================================================

#[test]
fn test_bindings_from_host_config() {
    let env = isolated_env();
    let config = HostConfig {
        console: false,
        sleep: false,
        capture_logs: false,
    };

    let bindings = install_all(&env, &Capabilities::from_config(&config)).unwrap();

    assert!(bindings.console.is_none());
    assert!(!bindings.sleep);
    assert_eq!(env.evaluate("typeof sleep", "").unwrap(), json!("undefined"));
}

#[test]
fn test_preload_then_bindings() {
    let env = isolated_env();
    let console = install_all(&env, &Capabilities::all())
        .unwrap()
        .console
        .unwrap();

    preload(
        &env,
        [("prelude.js", "function shout(s) { console.info(s.toUpperCase()); }")],
    )
    .unwrap();
    env.evaluate("shout('hey')", "main.js").unwrap();

    let entries = console.entries();
    assert_eq!(entries[0].level, LogLevel::Info);
    assert_eq!(entries[0].message, "HEY");
    assert_eq!(entries[0].location.funcname, "shout");
    assert_eq!(entries[0].location.filename, "prelude.js");
}
