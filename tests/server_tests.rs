// Server run paths against the stub engine.
//
// Server runs redirect the process's stdout from a worker thread, so all
// scenarios share one test and each waits for its worker to finish before
// the next begins.

mod common;

use common::{ScriptedRun, StubEngine};
use iperf3_ffi::{Error, Server};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_resets(stub: &Arc<StubEngine>, expected: usize) {
    for _ in 0..200 {
        if stub.state.lock().resets >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never reset the test");
}

async fn consecutive_runs_reset_between_clients() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::success(r#"{"run":1}"#));
    stub.script(ScriptedRun::success(r#"{"run":2}"#));
    let server = Server::with_engine(stub.clone()).unwrap();

    let first = server.run().await.unwrap().unwrap();
    assert_eq!(first.payload(), Some(&json!({"run": 1})));
    assert_eq!(stub.state.lock().resets, 1);

    let second = server.run().await.unwrap().unwrap();
    assert_eq!(second.payload(), Some(&json!({"run": 2})));

    let state = stub.state.lock();
    assert_eq!(state.resets, 2);
    assert_eq!(state.run_calls, vec!['s', 's']);
}

async fn engine_failure_still_resets() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::failure(-1, 7));
    let server = Server::with_engine(stub.clone()).unwrap();

    let result = server.run().await.unwrap().unwrap();

    assert_eq!(result.error(), Some("stub error 7"));
    assert_eq!(result.payload(), None);
    assert_eq!(stub.state.lock().resets, 1);
}

async fn console_mode_returns_no_result() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::success(""));
    let server = Server::with_engine(stub.clone()).unwrap();
    server.config().set_json_output(false);

    assert!(server.run().await.unwrap().is_none());
    assert_eq!(stub.state.lock().resets, 1);
}

async fn cancelled_before_run_never_calls_engine() {
    let stub = StubEngine::new();
    let server = Server::with_engine(stub.clone()).unwrap();
    server.cancellation_token().cancel();

    assert!(matches!(server.run().await, Err(Error::Cancelled)));
    assert!(matches!(server.run().await, Err(Error::Cancelled)));
    assert!(stub.state.lock().run_calls.is_empty());
}

async fn cancel_during_run_releases_caller() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::success(r#"{"late":true}"#).with_delay(Duration::from_millis(300)));
    let server = Server::with_engine(stub.clone()).unwrap();

    let cancel_token = server.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
    });

    assert!(matches!(server.run().await, Err(Error::Cancelled)));
    assert_eq!(stub.state.lock().resets, 0);

    // The engine call still completes and resets on its own.
    wait_for_resets(&stub, 1).await;
}

async fn timeout_while_waiting_for_client() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::success(r#"{"late":true}"#).with_delay(Duration::from_millis(300)));
    let server = Server::with_engine(stub.clone())
        .unwrap()
        .with_timeout(Duration::from_millis(50));

    match server.run().await {
        Err(Error::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
        Err(e) => panic!("expected timeout, got {}", e),
        Ok(_) => panic!("expected timeout"),
    }

    wait_for_resets(&stub, 1).await;
}

async fn report_served_after_timeout_reaches_next_run() {
    let stub = StubEngine::new();
    stub.script(ScriptedRun::success(r#"{"late":true}"#).with_delay(Duration::from_millis(300)));
    stub.script(ScriptedRun::success(r#"{"run":2}"#));
    let server = Server::with_engine(stub.clone())
        .unwrap()
        .with_timeout(Duration::from_millis(100));

    assert!(matches!(server.run().await, Err(Error::Timeout(_))));

    // Later calls wait on the same worker rather than serving a new client.
    let late = loop {
        match server.run().await {
            Err(Error::Timeout(_)) => continue,
            other => break other.unwrap().unwrap(),
        }
    };
    assert_eq!(late.payload(), Some(&json!({"late": true})));
    assert_eq!(stub.state.lock().run_calls, vec!['s']);

    let next = server.run().await.unwrap().unwrap();
    assert_eq!(next.payload(), Some(&json!({"run": 2})));
    let state = stub.state.lock();
    assert_eq!(state.run_calls, vec!['s', 's']);
    assert_eq!(state.resets, 2);
}

#[tokio::test]
async fn test_server_run_paths() {
    consecutive_runs_reset_between_clients().await;
    engine_failure_still_resets().await;
    console_mode_returns_no_result().await;
    cancelled_before_run_never_calls_engine().await;
    cancel_during_run_releases_caller().await;
    timeout_while_waiting_for_client().await;
    report_served_after_timeout_reaches_next_run().await;
}
