//! Error reporting hook.
//!
//! Nothing raised on the receive, renewal or settlement paths escapes to the
//! caller of the listener. Every such error is funnelled to an
//! [`ErrorReporter`] together with the action that failed and the entity it
//! failed on.
//!
//! ## Design notes
//!
//! Reporters are user code running inside the listener's own tasks. A
//! panicking reporter is contained (and logged) so it cannot take a pump or
//! renewer down with it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::{
    // ---
    EntityIdentity,
    TriggerError,
};

/// What the listener was doing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportAction {
    Receive,
    UserCallback,
    Complete,
    Abandon,
    RenewLock,
    AcceptMessageSession,
    CloseMessageSession,
}

impl fmt::Display for ReportAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportAction::Receive => "Receive",
            ReportAction::UserCallback => "UserCallback",
            ReportAction::Complete => "Complete",
            ReportAction::Abandon => "Abandon",
            ReportAction::RenewLock => "RenewLock",
            ReportAction::AcceptMessageSession => "AcceptMessageSession",
            ReportAction::CloseMessageSession => "CloseMessageSession",
        };
        f.write_str(name)
    }
}

/// Where an error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionContext {
    pub action: ReportAction,
    pub endpoint: Option<String>,
    pub entity_path: String,
    pub client_id: Option<String>,
}

impl fmt::Display for ExceptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Action={}, Endpoint={}, EntityPath={}, ClientId={}",
            self.action,
            self.endpoint.as_deref().unwrap_or("<unknown>"),
            self.entity_path,
            self.client_id.as_deref().unwrap_or("<none>")
        )
    }
}

/// Receives every error the listener swallows.
///
/// Implementations must be cheap and must not block.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &TriggerError, context: &ExceptionContext);
}

pub type ErrorReporterPtr = Arc<dyn ErrorReporter>;

/// Default reporter: logs each error at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, error: &TriggerError, context: &ExceptionContext) {
        crate::log_warn!("message processing error ({}): {}", context, error);
    }
}

struct FnReporter<F> {
    f: F,
}

impl<F> ErrorReporter for FnReporter<F>
where
    F: Fn(&TriggerError, &ExceptionContext) + Send + Sync,
{
    fn report(&self, error: &TriggerError, context: &ExceptionContext) {
        (self.f)(error, context)
    }
}

/// Wrap a closure into an [`ErrorReporterPtr`].
pub fn reporter_fn<F>(f: F) -> ErrorReporterPtr
where
    F: Fn(&TriggerError, &ExceptionContext) + Send + Sync + 'static,
{
    Arc::new(FnReporter { f })
}

/// Reporter bound to one entity, shared by the listener's tasks.
#[derive(Clone)]
pub(crate) struct ReportHandle {
    reporter: ErrorReporterPtr,
    entity: Arc<EntityIdentity>,
}

impl ReportHandle {
    // ---
    pub(crate) fn new(reporter: ErrorReporterPtr, entity: Arc<EntityIdentity>) -> Self {
        Self { reporter, entity }
    }

    pub(crate) fn report(&self, error: &TriggerError, action: ReportAction, client_id: Option<&str>) {
        // ---
        let context = ExceptionContext {
            action,
            endpoint: self.entity.connection().endpoint().map(str::to_owned),
            entity_path: self.entity.path().to_owned(),
            client_id: client_id.map(str::to_owned),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.reporter.report(error, &context)));
        if outcome.is_err() {
            crate::log_error!("error reporter panicked while reporting ({}): {}", context, error);
        }
    }
}
