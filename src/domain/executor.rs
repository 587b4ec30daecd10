// src/domain/executor.rs

//! Execution runtime boundary.
//!
//! The listener does not know how user code is located or invoked. It hands
//! each [`TriggerInput`] to a [`TriggerExecutor`] and acts on the returned
//! [`FunctionResult`].
//!
//! Two kinds of failure are distinguished:
//!
//! - an ordinary function failure is reported in-band as
//!   `FunctionResult { succeeded: false, .. }`
//! - an infrastructure fault is returned as `Err(..)` (a panic inside the
//!   executor is treated the same way)

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    Result,
    TriggerError,
    TriggerInput,
};

/// Outcome of one invocation of user logic.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub succeeded: bool,
    pub exception: Option<Arc<TriggerError>>,
}

impl FunctionResult {
    // ---
    pub fn success() -> Self {
        Self {
            succeeded: true,
            exception: None,
        }
    }

    pub fn failure(error: TriggerError) -> Self {
        Self {
            succeeded: false,
            exception: Some(Arc::new(error)),
        }
    }

    /// True when the invocation failed because a lock was already lost.
    pub fn is_lock_lost(&self) -> bool {
        self.exception
            .as_ref()
            .map(|err| err.is_lock_lost())
            .unwrap_or(false)
    }
}

/// Runs user logic for one trigger input.
///
/// `cancel` is cancelled when the listener shuts down. It is a cooperative
/// signal only: the listener waits for the call to return regardless.
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    async fn try_execute(
        &self,
        input: TriggerInput,
        cancel: CancellationToken,
    ) -> Result<FunctionResult>;
}

pub type ExecutorPtr = Arc<dyn TriggerExecutor>;

struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TriggerExecutor for FnExecutor<F>
where
    F: Fn(TriggerInput, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FunctionResult>> + Send,
{
    async fn try_execute(
        &self,
        input: TriggerInput,
        cancel: CancellationToken,
    ) -> Result<FunctionResult> {
        (self.f)(input, cancel).await
    }
}

/// Wrap an async closure into an [`ExecutorPtr`].
///
/// ```ignore
/// let executor = executor_fn(|input, _cancel| async move {
///     println!("got {} message(s)", input.messages().len());
///     Ok(FunctionResult::success())
/// });
/// ```
pub fn executor_fn<F, Fut>(f: F) -> ExecutorPtr
where
    F: Fn(TriggerInput, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FunctionResult>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}
