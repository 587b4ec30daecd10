// tests/batch_dispatch.rs

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mom_trigger::{
    // ---
    executor_fn,
    BrokerError,
    DispatchMode,
    ExecutorPtr,
    FunctionResult,
    Listener,
    ListenerBuilder,
    ListenerOptions,
    LockToken,
    MemoryBroker,
    OutgoingMessage,
    TriggerError,
};

use common::{init_logging, queue, wait_until, QUEUE};

const SETTLE: Duration = Duration::from_secs(5);

fn batch_listener(broker: &MemoryBroker, auto_complete: bool, executor: ExecutorPtr) -> Listener {
    // ---
    let mut options = ListenerOptions::default();
    options.batch.max_message_count = 10;
    options.batch.operation_timeout = Duration::from_millis(200);
    options.batch.auto_complete = auto_complete;

    ListenerBuilder::new()
        .function_id("Functions.ProcessOrderBatch")
        .entity(queue())
        .provider(broker.provider())
        .executor(executor)
        .dispatch(DispatchMode::Batch)
        .options(options)
        .build()
        .expect("listener should build")
}

/// Executor that records the lock tokens of each batch and answers with
/// `outcome`.
fn batch_recorder<F>(outcome: F) -> (ExecutorPtr, Arc<Mutex<Vec<Vec<LockToken>>>>)
where
    F: Fn() -> mom_trigger::Result<FunctionResult> + Send + Sync + 'static,
{
    // ---
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let outcome = Arc::new(outcome);
    let executor = executor_fn(move |input, _cancel| {
        assert!(!input.is_single());
        sink.lock().unwrap().push(input.lock_tokens());
        let outcome = outcome.clone();
        async move { outcome() }
    });
    (executor, batches)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_success_completes_all_in_one_call() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::default();
    for i in 0..3 {
        broker.send(QUEUE, OutgoingMessage::new(format!("order-{i}")));
    }
    let (executor, batches) = batch_recorder(|| Ok(FunctionResult::success()));
    let listener = batch_listener(&broker, true, executor);

    // ---
    // Act
    // ---
    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || !broker.calls().completes.is_empty()).await);
    listener.stop().await.unwrap();

    // ---
    // Assert
    // ---
    let batches = batches.lock().unwrap().clone();
    let calls = broker.calls();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert_eq!(calls.completes, batches);
    assert!(calls.abandons.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_failure_abandons_all_in_one_call() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::default();
    for i in 0..3 {
        broker.send(QUEUE, OutgoingMessage::new(format!("order-{i}")));
    }
    let (executor, batches) = batch_recorder(|| {
        Ok(FunctionResult::failure(TriggerError::Execution(
            "downstream unavailable".into(),
        )))
    });
    let listener = batch_listener(&broker, true, executor);

    // ---
    // Act
    // ---
    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || !broker.calls().abandons.is_empty()).await);
    listener.stop().await.unwrap();

    // ---
    // Assert
    // ---
    let first = batches.lock().unwrap()[0].clone();
    let calls = broker.calls();
    assert_eq!(first.len(), 3);
    assert_eq!(calls.abandons[0], first);
    assert!(calls.completes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_lock_lost_failure_is_not_abandoned() {
    // ---
    init_logging();

    let broker = MemoryBroker::default();
    broker.send(QUEUE, OutgoingMessage::new("order"));
    let (executor, batches) = batch_recorder(|| {
        Ok(FunctionResult::failure(TriggerError::from(BrokerError::lock_lost(
            "lock expired",
        ))))
    });
    let listener = batch_listener(&broker, true, executor);

    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || !batches.lock().unwrap().is_empty()).await);
    listener.stop().await.unwrap();

    let calls = broker.calls();
    assert!(calls.abandons.is_empty());
    assert!(calls.completes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_without_auto_complete_leaves_settlement_to_function() {
    // ---
    init_logging();

    let broker = MemoryBroker::default();
    for i in 0..2 {
        broker.send(QUEUE, OutgoingMessage::new(format!("order-{i}")));
    }
    let settled = Arc::new(Mutex::new(false));
    let flag = settled.clone();
    let executor = executor_fn(move |input, _cancel| {
        let flag = flag.clone();
        async move {
            let tokens = input.lock_tokens();
            input.receiver().complete(&tokens).await?;
            *flag.lock().unwrap() = true;
            Ok::<_, TriggerError>(FunctionResult::success())
        }
    });
    let listener = batch_listener(&broker, false, executor);

    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || *settled.lock().unwrap()).await);
    listener.stop().await.unwrap();

    // One call, made by the function itself.
    let calls = broker.calls();
    assert_eq!(calls.completes.len(), 1);
    assert_eq!(calls.completes[0].len(), 2);
    assert!(calls.abandons.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_fault_abandons_all() {
    // ---
    init_logging();

    let broker = MemoryBroker::default();
    for i in 0..3 {
        broker.send(QUEUE, OutgoingMessage::new(format!("order-{i}")));
    }
    let (executor, batches) =
        batch_recorder(|| Err(TriggerError::Execution("runtime unavailable".into())));
    let listener = batch_listener(&broker, true, executor);

    listener.start(CancellationToken::new()).await.unwrap();
    assert!(wait_until(SETTLE, || !broker.calls().abandons.is_empty()).await);
    listener.stop().await.unwrap();

    let first = batches.lock().unwrap()[0].clone();
    assert_eq!(broker.calls().abandons[0], first);
    assert!(broker.calls().completes.is_empty());
}

#[test]
fn test_failing_batches_do_not_starve_a_single_worker() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime should build");

    let broker = MemoryBroker::default();
    for i in 0..3 {
        broker.send(QUEUE, OutgoingMessage::new(format!("order-{i}")));
    }
    let (executor, batches) =
        batch_recorder(|| Ok(FunctionResult::failure(TriggerError::Execution("rejected".into()))));
    let listener = batch_listener(&broker, true, executor);

    // ---
    // Act
    // ---
    let stopped = runtime.block_on(runtime.spawn(async move {
        listener.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(SETTLE, listener.stop()).await
    }));

    // ---
    // Assert
    // ---
    let stopped = stopped.expect("scenario task panicked");
    assert!(stopped.is_ok(), "stop did not finish while batches kept failing");
    stopped.unwrap().unwrap();
    assert!(!batches.lock().unwrap().is_empty());
    assert!(!broker.calls().abandons.is_empty());
}
