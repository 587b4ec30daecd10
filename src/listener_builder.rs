//! Listener builder.
//!
//! Provides a fluent builder API for wiring a [`Listener`] to its entity,
//! broker client factory and function executor.

use std::sync::Arc;

use crate::{
    // ---
    DefaultMessageProcessor,
    DispatchMode,
    EntityIdentity,
    ErrorReporterPtr,
    ExecutorPtr,
    Listener,
    ListenerOptions,
    LogErrorReporter,
    MessageProcessorPtr,
    MessagingProviderPtr,
    Result,
    TriggerError,
};

/// Builder for [`Listener`] instances.
///
/// # Examples
///
/// ```no_run
/// use mom_trigger::{
///     create_memory_broker, executor_fn, ConnectionDescriptor, EntityIdentity, FunctionResult,
///     ListenerBuilder,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> mom_trigger::Result<()> {
/// let broker = create_memory_broker();
/// let listener = ListenerBuilder::new()
///     .function_id("Functions.ProcessOrders")
///     .entity(EntityIdentity::queue("orders", ConnectionDescriptor::named("Messaging")))
///     .provider(broker.provider())
///     .executor(executor_fn(|input, _cancel| async move {
///         println!("received {}", input.message().message_id);
///         Ok(FunctionResult::success())
///     }))
///     .build()?;
///
/// listener.start(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ListenerBuilder {
    // ---
    function_id: Option<String>,
    entity: Option<EntityIdentity>,
    provider: Option<MessagingProviderPtr>,
    executor: Option<ExecutorPtr>,

    sessions_enabled: bool,
    dispatch: DispatchMode,
    options: Option<ListenerOptions>,

    // Optional collaborators
    processor: Option<MessageProcessorPtr>,
    reporter: Option<ErrorReporterPtr>,
}

impl ListenerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier of the function the listener triggers. Required.
    pub fn function_id(mut self, id: impl Into<String>) -> Self {
        self.function_id = Some(id.into());
        self
    }

    /// Queue or subscription to consume. Required.
    pub fn entity(mut self, entity: EntityIdentity) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Factory for the broker clients. Required.
    pub fn provider(mut self, provider: MessagingProviderPtr) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Runs the user function. Required.
    pub fn executor(mut self, executor: ExecutorPtr) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Consume the entity through sessions.
    ///
    /// Default: false.
    pub fn sessions_enabled(mut self, enabled: bool) -> Self {
        self.sessions_enabled = enabled;
        self
    }

    /// Default: [`DispatchMode::Single`].
    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Default: [`ListenerOptions::default`].
    pub fn options(mut self, options: ListenerOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Override the single-dispatch message processor.
    ///
    /// Default: [`DefaultMessageProcessor`] using the `autoComplete` flag of
    /// the message handler (or the session handler when sessions are
    /// enabled).
    pub fn processor(mut self, processor: MessageProcessorPtr) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Default: [`LogErrorReporter`].
    pub fn error_reporter(mut self, reporter: ErrorReporterPtr) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the listener (consumes self).
    pub fn build(self) -> Result<Listener> {
        // ---
        let function_id = self
            .function_id
            .ok_or_else(|| TriggerError::MissingConfig("function_id".into()))?;
        let entity = self
            .entity
            .ok_or_else(|| TriggerError::MissingConfig("entity".into()))?;
        let provider = self
            .provider
            .ok_or_else(|| TriggerError::MissingConfig("provider".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| TriggerError::MissingConfig("executor".into()))?;

        let options = self.options.unwrap_or_default();
        options.validate()?;

        let processor = self.processor.unwrap_or_else(|| {
            let auto_complete = if self.sessions_enabled {
                options.session_handler.auto_complete
            } else {
                options.message_handler.auto_complete
            };
            Arc::new(DefaultMessageProcessor::new(auto_complete))
        });
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(LogErrorReporter));

        Ok(Listener::new(
            function_id,
            entity,
            self.sessions_enabled,
            self.dispatch,
            options,
            provider,
            executor,
            processor,
            reporter,
        ))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_broker, executor_fn, ConnectionDescriptor, FunctionResult, ListenerState};

    fn entity() -> EntityIdentity {
        EntityIdentity::queue("orders", ConnectionDescriptor::named("Messaging"))
    }

    #[test]
    fn test_missing_fields_are_reported() {
        // ---
        let err = ListenerBuilder::new().entity(entity()).build().err();
        assert!(matches!(err, Some(TriggerError::MissingConfig(field)) if field == "function_id"));

        let err = ListenerBuilder::new()
            .function_id("f")
            .entity(entity())
            .provider(create_memory_broker().provider())
            .build()
            .err();
        assert!(matches!(err, Some(TriggerError::MissingConfig(field)) if field == "executor"));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        // ---
        let mut options = ListenerOptions::default();
        options.batch.max_message_count = 0;

        let err = ListenerBuilder::new()
            .function_id("f")
            .entity(entity())
            .provider(create_memory_broker().provider())
            .executor(executor_fn(|_, _| async { Ok(FunctionResult::success()) }))
            .options(options)
            .build()
            .err();
        assert!(matches!(err, Some(TriggerError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_defaults() {
        // ---
        let listener = ListenerBuilder::new()
            .function_id("Functions.ProcessOrders")
            .entity(entity())
            .provider(create_memory_broker().provider())
            .executor(executor_fn(|_, _| async { Ok(FunctionResult::success()) }))
            .build()
            .unwrap();

        assert_eq!(listener.state(), ListenerState::Created);
        assert_eq!(listener.dispatch_mode(), DispatchMode::Single);
        assert!(!listener.sessions_enabled());
        assert_eq!(listener.function_id(), "Functions.ProcessOrders");
        assert_eq!(listener.entity().path(), "orders");
    }
}
