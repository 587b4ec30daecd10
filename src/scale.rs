//! Scale metrics.
//!
//! A [`ScaleMonitor`] gives an autoscaler a read-only snapshot of the entity
//! a listener consumes: queue depth, partition count, and the age and
//! delivery count of the next message in line.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    // ---
    client_cell::ClientCell,
    options::timespan,
    retry::retry_with_backoff,
    EntityIdentity,
    MessageReceiver,
    MessagingProviderPtr,
    Result,
    RetryConfig,
};

/// Identifies the monitor to the scaling infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScaleMonitorDescriptor {
    /// `{function_id}-messagetrigger-{entity_path}`, lower-cased.
    pub id: String,
}

impl ScaleMonitorDescriptor {
    pub fn new(function_id: &str, entity_path: &str) -> Self {
        Self {
            id: format!("{function_id}-messagetrigger-{entity_path}").to_lowercase(),
        }
    }
}

/// One metrics sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMetrics {
    /// Active messages on the entity.
    pub message_count: i64,
    pub partition_count: i32,
    /// Age of the next message; zero when the entity is empty.
    #[serde(with = "timespan")]
    pub queue_time: Duration,
    /// Delivery count of the next message; -1 when the entity is empty.
    pub delivery_count: i64,
    pub timestamp: DateTime<Utc>,
}

pub struct ScaleMonitor {
    descriptor: ScaleMonitorDescriptor,
    entity: Arc<EntityIdentity>,
    provider: MessagingProviderPtr,
    receiver: Arc<ClientCell<dyn MessageReceiver>>,
    prefetch_count: u32,
    retry: RetryConfig,
}

impl ScaleMonitor {
    // ---
    pub(crate) fn new(
        function_id: &str,
        entity: Arc<EntityIdentity>,
        provider: MessagingProviderPtr,
        receiver: Arc<ClientCell<dyn MessageReceiver>>,
        prefetch_count: u32,
        retry: RetryConfig,
    ) -> Self {
        Self {
            descriptor: ScaleMonitorDescriptor::new(function_id, entity.path()),
            entity,
            provider,
            receiver,
            prefetch_count,
            retry,
        }
    }

    pub fn descriptor(&self) -> &ScaleMonitorDescriptor {
        &self.descriptor
    }

    /// Sample the entity. Transient broker failures are retried.
    pub async fn get_metrics(&self) -> Result<TriggerMetrics> {
        // ---
        let receiver = self
            .receiver
            .get_or_try_create(|| self.provider.create_receiver(&self.entity, self.prefetch_count))
            .await?;

        let properties =
            retry_with_backoff(Some(&self.retry), || receiver.entity_properties()).await?;
        let next = retry_with_backoff(Some(&self.retry), || receiver.peek()).await?;

        let timestamp = Utc::now();
        let (queue_time, delivery_count) = match next {
            Some(message) => (
                (timestamp - message.enqueued_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                i64::from(message.delivery_count),
            ),
            None => (Duration::ZERO, -1),
        };

        Ok(TriggerMetrics {
            message_count: properties.active_message_count,
            partition_count: properties.partition_count,
            queue_time,
            delivery_count,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_descriptor_id_is_lower_case() {
        // ---
        let descriptor = ScaleMonitorDescriptor::new("Functions.ProcessOrders", "Orders/Subscriptions/Audit");
        assert_eq!(
            descriptor.id,
            "functions.processorders-messagetrigger-orders/subscriptions/audit"
        );
    }
}
