// tests/sessions.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mom_trigger::{
    // ---
    executor_fn,
    DispatchMode,
    ExecutorPtr,
    FunctionResult,
    Listener,
    ListenerBuilder,
    ListenerOptions,
    MemoryBroker,
    MemoryBrokerOptions,
    OutgoingMessage,
    ReportAction,
    TriggerError,
};

use common::{init_logging, queue, recording_reporter, wait_until, QUEUE};

const SETTLE: Duration = Duration::from_secs(10);

fn session_options() -> ListenerOptions {
    // ---
    let mut options = ListenerOptions::default();
    options.session_handler.message_wait_timeout = Duration::from_millis(200);
    options.session_handler.max_concurrent_sessions = 2;
    options.batch.operation_timeout = Duration::from_millis(200);
    options
}

fn session_listener(broker: &MemoryBroker, dispatch: DispatchMode, executor: ExecutorPtr) -> Listener {
    ListenerBuilder::new()
        .function_id("Functions.ProcessSessions")
        .entity(queue())
        .provider(broker.provider())
        .executor(executor)
        .sessions_enabled(true)
        .dispatch(dispatch)
        .options(session_options())
        .build()
        .expect("listener should build")
}

fn send_session(broker: &MemoryBroker, session_id: &str, count: usize) {
    for i in 1..=count {
        broker.send(
            QUEUE,
            OutgoingMessage::new(format!("message{i}")).with_session_id(session_id),
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_messages_processed_in_order_without_interleaving() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::default();
    send_session(&broker, "session-a", 5);
    send_session(&broker, "session-b", 5);

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let executor = executor_fn(move |input, _cancel| {
        let message = input.message();
        sink.lock().unwrap().push((
            input.session_id().unwrap_or_default().to_owned(),
            String::from_utf8_lossy(&message.body).into_owned(),
        ));
        async { Ok(FunctionResult::success()) }
    });
    let listener = session_listener(&broker, DispatchMode::Single, executor);

    // ---
    // Act
    // ---
    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || broker.calls().completes.len() == 10).await);
    listener.stop().await.unwrap();

    // ---
    // Assert
    // ---
    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 10);
    for run in log.chunks(5) {
        let session = &run[0].0;
        assert!(run.iter().all(|(s, _)| s == session), "interleaved: {log:?}");
        let bodies: Vec<&str> = run.iter().map(|(_, body)| body.as_str()).collect();
        assert_eq!(bodies, ["message1", "message2", "message3", "message4", "message5"]);
    }
    assert_ne!(log[0].0, log[5].0);

    let calls = broker.calls();
    assert!(calls.abandons.is_empty());
    assert_eq!(calls.accepted_sessions.len(), calls.closed_sessions.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_lock_renewed_during_long_callback() {
    // ---
    init_logging();

    let broker = MemoryBroker::new(MemoryBrokerOptions {
        session_lock_duration: Duration::from_millis(600),
        ..Default::default()
    });
    send_session(&broker, "session-a", 1);

    let executor = executor_fn(|_input, _cancel| async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(FunctionResult::success())
    });
    let listener = session_listener(&broker, DispatchMode::Single, executor);

    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || broker.calls().completes.len() == 1).await);
    listener.stop().await.unwrap();

    let calls = broker.calls();
    assert!(!calls.session_renewals.is_empty());
    assert!(calls.session_renewals.iter().all(|id| id == "session-a"));
    assert!(calls.abandons.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_active_sessions_are_visible() {
    // ---
    init_logging();

    let broker = MemoryBroker::default();
    send_session(&broker, "session-a", 1);

    let release = Arc::new(tokio::sync::Notify::new());
    let gate = release.clone();
    let executor = executor_fn(move |_input, _cancel| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(FunctionResult::success())
        }
    });
    let listener = session_listener(&broker, DispatchMode::Single, executor);

    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || listener.active_session_ids() == ["session-a"]).await);

    release.notify_one();
    assert!(wait_until(SETTLE, || listener.active_session_ids().is_empty()).await);
    listener.stop().await.unwrap();

    assert_eq!(broker.calls().closed_sessions, ["session-a"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_sessions_settle_per_session_and_close_when_drained() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::default();
    send_session(&broker, "session-a", 3);
    send_session(&broker, "session-b", 3);

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let executor = executor_fn(move |input, _cancel| {
        let sessions: Vec<Option<String>> = input
            .messages()
            .iter()
            .map(|m| m.session_id.as_deref().map(str::to_owned))
            .collect();
        sink.lock().unwrap().push(sessions);
        async { Ok(FunctionResult::success()) }
    });
    let listener = session_listener(&broker, DispatchMode::Batch, executor);

    // ---
    // Act
    // ---
    listener.start(CancellationToken::new()).await.unwrap();
    let drained = wait_until(SETTLE, || {
        let calls = broker.calls();
        calls.completes.len() == 2 && calls.closed_sessions.len() >= 2
    })
    .await;
    listener.stop().await.unwrap();

    // ---
    // Assert
    // ---
    assert!(drained);
    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 2);
    for batch in &batches {
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|s| s == &batch[0]));
    }

    let calls = broker.calls();
    assert!(calls.completes.iter().all(|tokens| tokens.len() == 3));
    let mut closed = calls.closed_sessions.clone();
    closed.sort();
    closed.dedup();
    assert_eq!(closed, ["session-a", "session-b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_session_fault_releases_session_without_abandon() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::default();
    send_session(&broker, "session-a", 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let executor = {
        let calls = calls.clone();
        let seen = seen.clone();
        executor_fn(move |input, _cancel| {
            let counts: Vec<u32> = input.messages().iter().map(|m| m.delivery_count).collect();
            seen.lock().unwrap().push(counts);
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    Err(TriggerError::Execution("handler crashed".into()))
                } else {
                    Ok(FunctionResult::success())
                }
            }
        })
    };
    let (reporter, reports) = recording_reporter();
    let listener = ListenerBuilder::new()
        .function_id("Functions.ProcessSessions")
        .entity(queue())
        .provider(broker.provider())
        .executor(executor)
        .sessions_enabled(true)
        .dispatch(DispatchMode::Batch)
        .options(session_options())
        .error_reporter(reporter)
        .build()
        .expect("listener should build");

    // ---
    // Act
    // ---
    listener.start(CancellationToken::new()).await.unwrap();
    let settled = wait_until(SETTLE, || broker.calls().completes.len() == 1).await;
    listener.stop().await.unwrap();

    // ---
    // Assert
    // ---
    assert!(settled);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], [1, 1, 1]);
    assert_eq!(seen[1], [1, 1, 1]);

    let calls = broker.calls();
    assert!(calls.abandons.is_empty());
    assert_eq!(calls.completes.len(), 1);
    assert_eq!(calls.completes[0].len(), 3);
    assert!(calls.accepted_sessions.len() >= 2);
    assert!(calls.closed_sessions.iter().any(|id| id == "session-a"));
    assert_eq!(broker.available_count(QUEUE), 0);

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1, "{reports:?}");
    assert_eq!(reports[0].0, ReportAction::UserCallback);
}
