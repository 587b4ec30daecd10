// src/domain/entity.rs

//! Entity identity.
//!
//! An entity is the broker object a listener consumes from: a queue, or a
//! subscription of a topic. Its identity is fixed when the listener is built
//! and never changes afterwards.

use std::fmt;
use std::sync::Arc;

use crate::{Result, TriggerError};

/// Kind of entity a listener is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Queue,
    Topic,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Queue => f.write_str("queue"),
            EntityType::Topic => f.write_str("topic"),
        }
    }
}

/// Where an entity lives.
///
/// Only the pieces needed for diagnostics are kept; credentials are never
/// retained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    name: Arc<str>,
    endpoint: Option<Arc<str>>,
}

impl ConnectionDescriptor {
    // ---
    /// A descriptor that names a connection without an endpoint.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
        }
    }

    /// Parse a `Key=Value;Key=Value` connection string.
    ///
    /// The `Endpoint` key is required. Its host is kept, so
    /// `Endpoint=sb://acme.example.net/;SharedAccessKey=...` yields the
    /// endpoint `acme.example.net`.
    pub fn from_connection_string(name: impl Into<Arc<str>>, connection_string: &str) -> Result<Self> {
        // ---
        let name = name.into();
        let endpoint = connection_string
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                TriggerError::MissingConfig(format!(
                    "connection '{name}' does not contain an Endpoint"
                ))
            })?;

        Ok(Self {
            name,
            endpoint: Some(endpoint_host(endpoint).into()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

fn endpoint_host(endpoint: &str) -> &str {
    // ---
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
}

/// Immutable identity of the entity a listener consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityIdentity {
    entity_type: EntityType,
    path: Arc<str>,
    connection: ConnectionDescriptor,
}

impl EntityIdentity {
    // ---
    pub fn queue(name: impl Into<Arc<str>>, connection: ConnectionDescriptor) -> Self {
        Self {
            entity_type: EntityType::Queue,
            path: name.into(),
            connection,
        }
    }

    /// A topic subscription, addressed as `{topic}/Subscriptions/{subscription}`.
    pub fn subscription(topic: &str, subscription: &str, connection: ConnectionDescriptor) -> Self {
        Self {
            entity_type: EntityType::Topic,
            path: format!("{topic}/Subscriptions/{subscription}").into(),
            connection,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connection(&self) -> &ConnectionDescriptor {
        &self.connection
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.entity_type, self.path)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_subscription_path() {
        // ---
        let entity =
            EntityIdentity::subscription("orders", "audit", ConnectionDescriptor::named("default"));
        assert_eq!(entity.path(), "orders/Subscriptions/audit");
        assert_eq!(entity.entity_type(), EntityType::Topic);
    }

    #[test]
    fn test_connection_string_endpoint() {
        // ---
        let conn = ConnectionDescriptor::from_connection_string(
            "primary",
            "Endpoint=sb://acme.example.net/;SharedAccessKeyName=listen;SharedAccessKey=abc=",
        )
        .unwrap();
        assert_eq!(conn.name(), "primary");
        assert_eq!(conn.endpoint(), Some("acme.example.net"));
    }

    #[test]
    fn test_connection_string_without_endpoint() {
        // ---
        let err = ConnectionDescriptor::from_connection_string("primary", "SharedAccessKey=abc")
            .unwrap_err();
        assert!(matches!(err, TriggerError::MissingConfig(_)));
    }
}
