// tests/common/mod.rs

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use mom_trigger::{
    // ---
    reporter_fn,
    ConnectionDescriptor,
    EntityIdentity,
    ErrorReporterPtr,
    ReportAction,
};

pub const QUEUE: &str = "orders";

static LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn queue() -> EntityIdentity {
    EntityIdentity::queue(QUEUE, ConnectionDescriptor::named("Messaging"))
}

/// Reporter that records every reported action with the error text.
pub fn recording_reporter() -> (ErrorReporterPtr, Arc<Mutex<Vec<(ReportAction, String)>>>) {
    // ---
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let reporter = reporter_fn(move |error, context| {
        sink.lock().unwrap().push((context.action, error.to_string()));
    });
    (reporter, reports)
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    // ---
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    timeout(limit, future).await.expect("timed out")
}
