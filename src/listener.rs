//! Trigger listener.
//!
//! A [`Listener`] binds one entity to one function. It owns the broker
//! clients for that entity, picks the receive loop that matches its dispatch
//! and session flags, and drives the lifecycle described by
//! [`ListenerState`].
//!
//! | dispatch | sessions | receive loop                                      |
//! |----------|----------|---------------------------------------------------|
//! | single   | no       | message pump, up to `maxConcurrentCalls` in flight |
//! | single   | yes      | session pump, one session at a time               |
//! | batch    | no       | one batch loop                                    |
//! | batch    | yes      | `maxConcurrentSessions` batch loops               |
//!
//! ## Design notes
//!
//! - `start` marks the listener `Started` before any receive loop is
//!   spawned, so a message can never arrive at a listener that still looks
//!   stopped. A wiring failure rolls the state back.
//! - `start` and `stop` are serialized by one async mutex. Concurrent `stop`
//!   calls run one shutdown sequence; the others fail with `NotStarted`.
//! - `stop` waits for in-flight invocations without a time limit. Callers
//!   that need a bound wrap the call in their own timeout.
//! - `dispose` never waits and never fails. It can run during a `stop`.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{
    // ---
    batch::{run_batch_loop, BatchSource},
    client_cell::ClientCell,
    lock_ignore_poison,
    pump::{run_message_pump, run_session_pump, ActiveSessions, PumpContext},
    processor::MessageProcessorPtr,
    reporter::ReportHandle,
    DispatchMode,
    EntityIdentity,
    ExecutorPtr,
    ListenerOptions,
    ListenerState,
    MessageReceiver,
    MessagingProviderPtr,
    ReceiverPtr,
    Result,
    ScaleMonitor,
    SessionClient,
    SessionClientPtr,
    TriggerError,
};

/// Message trigger listener.
///
/// Cheap to clone; clones share the same listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    function_id: String,
    entity: Arc<EntityIdentity>,
    sessions_enabled: bool,
    dispatch: DispatchMode,
    options: Arc<ListenerOptions>,

    provider: MessagingProviderPtr,
    executor: ExecutorPtr,
    processor: MessageProcessorPtr,
    reports: ReportHandle,

    // Broker clients, created on first use and reset on stop
    receiver: Arc<ClientCell<dyn MessageReceiver>>,
    session_client: ClientCell<dyn SessionClient>,

    state: Mutex<ListenerState>,
    run: Mutex<Option<RunState>>,
    lifecycle: tokio::sync::Mutex<()>,
    monitor: OnceLock<Arc<ScaleMonitor>>,
}

/// Everything that exists only while the listener is started.
struct RunState {
    shutdown: CancellationToken,
    receive_token: CancellationToken,
    tracker: TaskTracker,
    ctx: Arc<PumpContext>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(run) = lock_ignore_poison(&self.run).take() {
            run.shutdown.cancel();
        }
    }
}

impl Listener {
    // ---
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        function_id: String,
        entity: EntityIdentity,
        sessions_enabled: bool,
        dispatch: DispatchMode,
        options: ListenerOptions,
        provider: MessagingProviderPtr,
        executor: ExecutorPtr,
        processor: MessageProcessorPtr,
        reporter: crate::ErrorReporterPtr,
    ) -> Self {
        // ---
        let entity = Arc::new(entity);
        Self {
            inner: Arc::new(Inner {
                function_id,
                reports: ReportHandle::new(reporter, entity.clone()),
                entity,
                sessions_enabled,
                dispatch,
                options: Arc::new(options),
                provider,
                executor,
                processor,
                receiver: Arc::new(ClientCell::new()),
                session_client: ClientCell::new(),
                state: Mutex::new(ListenerState::Created),
                run: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                monitor: OnceLock::new(),
            }),
        }
    }

    pub fn function_id(&self) -> &str {
        &self.inner.function_id
    }

    pub fn entity(&self) -> &EntityIdentity {
        &self.inner.entity
    }

    pub fn sessions_enabled(&self) -> bool {
        self.inner.sessions_enabled
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.inner.dispatch
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ListenerState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Start receiving.
    ///
    /// Cancelling `cancel` has the same effect as [`cancel`](Self::cancel).
    ///
    /// # Errors
    ///
    /// - [`TriggerError::AlreadyStarted`] if the listener is running
    /// - [`TriggerError::Disposed`] after [`dispose`](Self::dispose)
    /// - the broker error if a client cannot be created; the listener is
    ///   left in its previous state
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = {
            let mut state = lock_ignore_poison(&self.inner.state);
            match *state {
                ListenerState::Disposed => return Err(TriggerError::Disposed),
                ListenerState::Started => return Err(TriggerError::AlreadyStarted),
                previous => {
                    *state = ListenerState::Started;
                    previous
                }
            }
        };

        let run = match self.wire(cancel).await {
            Ok(run) => run,
            Err(err) => {
                let mut state = lock_ignore_poison(&self.inner.state);
                if *state == ListenerState::Started {
                    *state = previous;
                }
                return Err(err);
            }
        };

        {
            let state = lock_ignore_poison(&self.inner.state);
            if *state == ListenerState::Disposed {
                run.shutdown.cancel();
                run.tracker.close();
                return Err(TriggerError::Disposed);
            }
            *lock_ignore_poison(&self.inner.run) = Some(run);
        }

        crate::log_info!(
            "listener started for {} (function '{}', dispatch {:?}, sessions {}) with options:\n{}",
            self.inner.entity,
            self.inner.function_id,
            self.inner.dispatch,
            self.inner.sessions_enabled,
            self.inner.options.format()
        );
        Ok(())
    }

    /// Create the clients and spawn the receive loops for one run.
    async fn wire(&self, cancel: CancellationToken) -> Result<RunState> {
        // ---
        let inner = &self.inner;
        let options = &inner.options;

        enum Source {
            Receiver(ReceiverPtr),
            Sessions(SessionClientPtr),
        }
        let source = if inner.sessions_enabled {
            Source::Sessions(self.session_client().await?)
        } else {
            Source::Receiver(self.receiver().await?)
        };

        let shutdown = CancellationToken::new();
        let receive_token = shutdown.child_token();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(PumpContext {
            entity: inner.entity.clone(),
            options: options.clone(),
            executor: inner.executor.clone(),
            processor: inner.processor.clone(),
            reports: inner.reports.clone(),
            receive_token: receive_token.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            concurrency: Arc::new(Semaphore::new(options.message_handler.max_concurrent_calls)),
            sessions: ActiveSessions::default(),
        });

        {
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => shutdown.cancel(),
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        match (inner.dispatch, source) {
            (DispatchMode::Single, Source::Receiver(receiver)) => {
                tracker.spawn(run_message_pump(ctx.clone(), receiver));
            }
            (DispatchMode::Single, Source::Sessions(client)) => {
                tracker.spawn(run_session_pump(ctx.clone(), client));
            }
            (DispatchMode::Batch, Source::Receiver(receiver)) => {
                tracker.spawn(run_batch_loop(ctx.clone(), BatchSource::Receiver(receiver)));
            }
            (DispatchMode::Batch, Source::Sessions(client)) => {
                let accept_gate = Arc::new(tokio::sync::Mutex::new(()));
                for _ in 0..options.session_handler.max_concurrent_sessions {
                    let source = BatchSource::Sessions {
                        client: client.clone(),
                        accept_gate: accept_gate.clone(),
                    };
                    tracker.spawn(run_batch_loop(ctx.clone(), source));
                }
            }
        }

        Ok(RunState {
            shutdown,
            receive_token,
            tracker,
            ctx,
        })
    }

    /// Stop receiving and wait for in-flight invocations to finish.
    ///
    /// Invocations see their cancellation token fire but are never aborted.
    /// Once `stop` returns, the broker clients are closed and the listener
    /// may be started again.
    ///
    /// # Errors
    ///
    /// - [`TriggerError::NotStarted`] unless the listener is running
    /// - [`TriggerError::Disposed`] after [`dispose`](Self::dispose)
    pub async fn stop(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.state() {
            ListenerState::Started => {}
            ListenerState::Disposed => return Err(TriggerError::Disposed),
            _ => return Err(TriggerError::NotStarted),
        }

        let run = lock_ignore_poison(&self.inner.run).take();
        if let Some(run) = run {
            run.shutdown.cancel();
            run.tracker.close();
            run.tracker.wait().await;
        }

        self.close_clients().await;

        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state != ListenerState::Disposed {
                *state = ListenerState::Stopped;
            }
        }

        crate::log_info!(
            "listener stopped for {} (function '{}')",
            self.inner.entity,
            self.inner.function_id
        );
        Ok(())
    }

    /// Stop receiving new messages; let in-flight invocations finish with
    /// their cancellation tokens untouched. Does not wait. A later
    /// [`stop`](Self::stop) completes the shutdown.
    pub fn drain(&self) -> Result<()> {
        // ---
        let receive_token = self.running()?;
        crate::log_info!("draining listener for {}", self.inner.entity);
        receive_token.cancel();
        Ok(())
    }

    /// Signal in-flight invocations and stop receiving. Does not wait.
    pub fn cancel(&self) -> Result<()> {
        // ---
        self.running()?;
        if let Some(run) = lock_ignore_poison(&self.inner.run).as_ref() {
            crate::log_info!("cancelling listener for {}", self.inner.entity);
            run.shutdown.cancel();
        }
        Ok(())
    }

    /// Receive token of the current run, if the listener is started.
    fn running(&self) -> Result<CancellationToken> {
        // ---
        match self.state() {
            ListenerState::Started => {}
            ListenerState::Disposed => return Err(TriggerError::Disposed),
            _ => return Err(TriggerError::NotStarted),
        }
        lock_ignore_poison(&self.inner.run)
            .as_ref()
            .map(|run| run.receive_token.clone())
            .ok_or(TriggerError::NotStarted)
    }

    /// Release everything. Idempotent; never waits for invocations and never
    /// fails. The listener cannot be used afterwards, and its scale monitor
    /// reports `Disposed`.
    pub async fn dispose(&self) {
        // ---
        let previous = {
            let mut state = lock_ignore_poison(&self.inner.state);
            std::mem::replace(&mut *state, ListenerState::Disposed)
        };
        if previous == ListenerState::Disposed {
            return;
        }

        let run = lock_ignore_poison(&self.inner.run).take();
        if let Some(run) = run {
            run.shutdown.cancel();
            run.tracker.close();
            for session in run.ctx.sessions.drain() {
                let _ = session.receiver().close().await;
            }
        }

        if let Some(receiver) = self.inner.receiver.close().await {
            let _ = receiver.close().await;
        }
        if let Some(client) = self.inner.session_client.close().await {
            let _ = client.close().await;
        }

        crate::log_info!("listener disposed for {}", self.inner.entity);
    }

    /// Scale monitor for this listener's entity. Created once and shared.
    pub fn monitor(&self) -> Arc<ScaleMonitor> {
        // ---
        self.inner
            .monitor
            .get_or_init(|| {
                Arc::new(ScaleMonitor::new(
                    &self.inner.function_id,
                    self.inner.entity.clone(),
                    self.inner.provider.clone(),
                    self.inner.receiver.clone(),
                    self.inner.options.prefetch_count,
                    self.inner.options.receive_retry.clone(),
                ))
            })
            .clone()
    }

    /// Ids of the sessions this listener currently holds.
    pub fn active_session_ids(&self) -> Vec<String> {
        lock_ignore_poison(&self.inner.run)
            .as_ref()
            .map(|run| run.ctx.sessions.ids())
            .unwrap_or_default()
    }

    async fn receiver(&self) -> Result<ReceiverPtr> {
        // ---
        let inner = &self.inner;
        Ok(inner
            .receiver
            .get_or_try_create(|| {
                inner
                    .provider
                    .create_receiver(&inner.entity, inner.options.prefetch_count)
            })
            .await?)
    }

    async fn session_client(&self) -> Result<SessionClientPtr> {
        // ---
        let inner = &self.inner;
        Ok(inner
            .session_client
            .get_or_try_create(|| {
                inner
                    .provider
                    .create_session_client(&inner.entity, inner.options.prefetch_count)
            })
            .await?)
    }

    async fn close_clients(&self) {
        // ---
        if let Some(receiver) = self.inner.receiver.take().await {
            if let Err(err) = receiver.close().await {
                crate::log_warn!(
                    "failed to close receiver for {}: {}",
                    self.inner.entity,
                    err
                );
            }
        }
        if let Some(client) = self.inner.session_client.take().await {
            if let Err(err) = client.close().await {
                crate::log_warn!(
                    "failed to close session client for {}: {}",
                    self.inner.entity,
                    err
                );
            }
        }
    }
}
