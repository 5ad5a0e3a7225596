//! Node connection integration tests — full round trips against a mock
//! server speaking the wire protocol.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use common::{wait_until, MockBehavior, MockServer};
use pulse_client::{
    CallStatus, Client, ConnectionSettings, ConnectionStatus, Error, Rowset, ScalarValue,
};

fn settings_for(server: &MockServer) -> ConnectionSettings {
    let mut settings = ConnectionSettings::default();
    settings.host_list = server.addr.to_string();
    settings
}

#[tokio::test]
async fn test_execute_round_trip() {
    let server = MockServer::start(MockBehavior::ok()).await;
    let client = Client::connect(settings_for(&server)).await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);

    let response = client
        .execute::<Rowset, _>("NoOp", &(), 0)
        .await
        .unwrap();
    assert_eq!(response.status, CallStatus::Succeeded);
    let Rowset(rows) = response.result.unwrap();
    assert_eq!(rows[0][0], ScalarValue::Str("NoOp".to_string()));

    client.close(true).await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_procedure_handle_round_trip() {
    let server = MockServer::start(MockBehavior::ok()).await;
    let client = Client::connect(settings_for(&server)).await.unwrap();

    let vote = client.procedure::<Rowset, (i64, &'static str)>("Vote");
    let response = vote.execute((42, "ballot")).await.unwrap();
    assert_eq!(response.procedure, "Vote");

    let missing = vote.try_execute((1, "x")).await;
    assert!(missing.is_some());

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_statistics_track_requests() {
    let server = MockServer::start(MockBehavior::ok()).await;
    let mut settings = settings_for(&server);
    settings.statistics_enabled = true;
    let client = Client::connect(settings).await.unwrap();

    for _ in 0..3 {
        client.execute::<Rowset, _>("NoOp", &(), 0).await.unwrap();
    }

    let procs = client.statistics().procedures().unwrap();
    let noop = &procs["noop"];
    assert_eq!(noop.request_count, 3);
    assert_eq!(noop.response_count, 3);
    assert_eq!(noop.success_count(), 3);
    assert!(noop.bytes_sent > 0);
    assert!(noop.bytes_received > 0);

    // Reset clears per-procedure counters; lifetime keeps the past tally.
    client.statistics().reset(false).unwrap();
    assert_eq!(client.statistics().procedures().unwrap()["noop"].request_count, 0);
    let lifetime = client.statistics().lifetime().unwrap().unwrap();
    assert_eq!(lifetime.request_count, 3);

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_backpressure_blocks_submission_at_capacity() {
    let gate = Arc::new(Semaphore::new(0));
    let server = MockServer::start(MockBehavior::ok().with_gate(Arc::clone(&gate))).await;
    let mut settings = settings_for(&server);
    settings.max_outstanding_txns = 2;
    settings.statistics_enabled = true;
    settings.default_command_timeout_ms = -1;
    let client = Client::connect(settings).await.unwrap();

    let h1 = client
        .begin_execute::<Rowset, _>("Held", &(), Default::default())
        .await
        .unwrap();
    let h2 = client
        .begin_execute::<Rowset, _>("Held", &(), Default::default())
        .await
        .unwrap();

    // Third submission must block until one of the first two completes.
    let third = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .begin_execute::<Rowset, _>("Held", &(), Default::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!third.is_finished(), "third submission should be blocked");

    // Release one response; the freed slot unblocks the third caller.
    gate.add_permits(1);
    let h3 = tokio::time::timeout(Duration::from_secs(5), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    gate.add_permits(2);
    h1.wait().await.unwrap();
    h2.wait().await.unwrap();
    h3.wait().await.unwrap();

    let summary = client.statistics().summary().unwrap().unwrap();
    assert_eq!(summary.request_count, 3);
    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_backpressure_wait_counts_against_timeout() {
    let gate = Arc::new(Semaphore::new(0));
    let server = MockServer::start(MockBehavior::ok().with_gate(Arc::clone(&gate))).await;
    let mut settings = settings_for(&server);
    settings.max_outstanding_txns = 1;
    let client = Client::connect(settings).await.unwrap();

    // Fill the only slot with a call that cannot complete yet.
    let held = client
        .begin_execute::<Rowset, _>(
            "Held",
            &(),
            pulse_client::CallOptions {
                timeout_ms: -1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The second caller's 100 ms deadline starts at submission, not when a
    // slot frees up; by the time capacity appears it has already expired.
    let blocked = {
        let client = client.clone();
        tokio::spawn(async move {
            client.execute::<Rowset, _>("Late", &(), 100).await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    // Release only the held call: its completion frees the slot, and the
    // second caller's expired request is reaped by the sweeper.
    gate.add_permits(1);

    let result = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout(_))));
    held.wait().await.unwrap();

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_timeout_completes_locally_and_discards_late_response() {
    let server = MockServer::start(MockBehavior::ok().with_delay(Duration::from_millis(500))).await;
    let mut settings = settings_for(&server);
    settings.default_command_timeout_ms = 50;
    settings.statistics_enabled = true;
    let client = Client::connect(settings).await.unwrap();

    let started = tokio::time::Instant::now();
    let result = client.execute::<Rowset, _>("Slow", &(), 0).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "timeout should fire well before the delayed response"
    );

    let stats = client.statistics().procedures().unwrap();
    assert_eq!(stats["slow"].timeout_count, 1);

    // The real response arrives later and is silently discarded; the cache
    // returns to baseline and the connection stays usable.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let node = &client.nodes()[0];
    assert_eq!(node.pending_count(), 0);
    assert!(node.is_connected());

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_cancel_race_delivers_each_callback_exactly_once() {
    let server = MockServer::start(MockBehavior::ok()).await;
    let mut settings = settings_for(&server);
    settings.statistics_enabled = true;
    let client = Client::connect(settings).await.unwrap();

    let callbacks = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..100i64 {
        let callbacks = Arc::clone(&callbacks);
        let statuses = Arc::clone(&statuses);
        let handle = client
            .begin_execute::<Rowset, _>(
                "Racy",
                &(i,),
                pulse_client::CallOptions {
                    callback: Some(Box::new(move |response| {
                        callbacks.fetch_add(1, Ordering::SeqCst);
                        statuses.lock().unwrap().push(response.status);
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Immediately race the cancel against the response.
        client.cancel(&handle).await;
        handles.push(handle);
    }

    assert!(
        wait_until(|| callbacks.load(Ordering::SeqCst) == 100, Duration::from_secs(5)).await,
        "every callback must be delivered exactly once"
    );
    let statuses = statuses.lock().unwrap().clone();
    let aborted = statuses.iter().filter(|s| **s == CallStatus::Aborted).count();
    let succeeded = statuses
        .iter()
        .filter(|s| **s == CallStatus::Succeeded)
        .count();
    assert_eq!(aborted + succeeded, 100);

    let summary = client.statistics().summary().unwrap().unwrap();
    assert_eq!(summary.abort_count, aborted as u64);
    assert_eq!(summary.success_count(), succeeded as u64);

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_drain_waits_for_responses_and_callbacks() {
    let gate = Arc::new(Semaphore::new(0));
    let server = MockServer::start(MockBehavior::ok().with_gate(Arc::clone(&gate))).await;
    let mut settings = settings_for(&server);
    settings.default_command_timeout_ms = -1;
    let client = Client::connect(settings).await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let delivered = Arc::clone(&delivered);
        client
            .begin_execute::<Rowset, _>(
                "Held",
                &(),
                pulse_client::CallOptions {
                    callback: Some(Box::new(move |_response| {
                        std::thread::sleep(Duration::from_millis(20));
                        delivered.fetch_add(1, Ordering::SeqCst);
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    gate.add_permits(2);
    client.drain().await.unwrap();
    // Drain returning means the callbacks have finished, not just the
    // responses having arrived.
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(client.nodes()[0].pending_count(), 0);

    client.close(false).await.unwrap();
}

#[tokio::test]
async fn test_close_aborts_residual_pending_calls() {
    let gate = Arc::new(Semaphore::new(0));
    let server = MockServer::start(MockBehavior::ok().with_gate(gate)).await;
    let mut settings = settings_for(&server);
    settings.default_command_timeout_ms = -1;
    let client = Client::connect(settings).await.unwrap();

    let handle = client
        .begin_execute::<Rowset, _>("Held", &(), Default::default())
        .await
        .unwrap();
    client.close(false).await.unwrap();

    assert!(matches!(handle.wait().await, Err(Error::ConnectionClosed(_))));
    assert!(matches!(
        client.execute::<Rowset, _>("NoOp", &(), 0).await,
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_login_rejection_surfaces_auth_failed() {
    let server = MockServer::start(MockBehavior::ok().rejecting_login()).await;
    let client = Client::create(settings_for(&server)).unwrap();
    assert!(matches!(client.open().await, Err(Error::AuthFailed(_))));
    assert_eq!(client.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_server_death_aborts_inflight_and_is_terminal() {
    let gate = Arc::new(Semaphore::new(0));
    let server = MockServer::start(MockBehavior::ok().with_gate(gate)).await;
    let mut settings = settings_for(&server);
    settings.default_command_timeout_ms = -1;
    let client = Client::connect(settings).await.unwrap();

    let handle = client
        .begin_execute::<Rowset, _>("Held", &(), Default::default())
        .await
        .unwrap();
    server.kill();

    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionLost(_))));

    // The first terminal error is retained and re-raised.
    assert!(matches!(
        client.execute::<Rowset, _>("NoOp", &(), 0).await,
        Err(Error::ConnectionLost(_))
    ));
    assert_eq!(client.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_user_state_travels_to_callback_and_response() {
    let server = MockServer::start(MockBehavior::ok()).await;
    let client = Client::connect(settings_for(&server)).await.unwrap();

    let state: pulse_client::UserState = Arc::new("ticket-17".to_string());
    let observed = Arc::new(Mutex::new(None::<String>));
    let observed_in_cb = Arc::clone(&observed);
    let handle = client
        .begin_execute::<Rowset, _>(
            "NoOp",
            &(),
            pulse_client::CallOptions {
                user_state: Some(state),
                callback: Some(Box::new(move |response| {
                    let state = response
                        .user_state
                        .as_ref()
                        .and_then(|s| s.downcast_ref::<String>())
                        .cloned();
                    *observed_in_cb.lock().unwrap() = state;
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let response = handle.wait().await.unwrap();
    assert_eq!(
        response
            .user_state
            .as_ref()
            .and_then(|s| s.downcast_ref::<String>())
            .map(String::as_str),
        Some("ticket-17")
    );
    assert!(
        wait_until(
            || observed.lock().unwrap().as_deref() == Some("ticket-17"),
            Duration::from_secs(2)
        )
        .await
    );

    client.close(false).await.unwrap();
}
