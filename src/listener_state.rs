//! Listener state and dispatch mode enumerations.

use std::fmt;

/// Lifecycle state of a [`Listener`](crate::Listener).
///
/// ```text
/// Created --start--> Started --stop--> Stopped --start--> Started ...
///    any  --dispose--> Disposed (terminal)
/// ```
///
/// `start` requires `Created` or `Stopped`; `stop`, `drain` and `cancel`
/// require `Started`. Every operation except `dispose` fails once the
/// listener is `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Created,
    Started,
    Stopped,
    Disposed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Created => "created",
            ListenerState::Started => "started",
            ListenerState::Stopped => "stopped",
            ListenerState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// How received messages map to invocations of user logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchMode {
    /// One invocation per message.
    ///
    /// Driven by the receive pump; concurrency is bounded by
    /// `maxConcurrentCalls` (or one session at a time in session mode).
    #[default]
    Single,

    /// One invocation per received batch.
    ///
    /// Driven by the batch loop; the whole batch is completed or abandoned
    /// together.
    Batch,
}
