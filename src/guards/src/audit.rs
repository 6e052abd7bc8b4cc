//! Audit trail for denials and invalidations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DenialReason;
use crate::types::UserId;

/// What an invalidation covered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InvalidationScope {
    User(UserId),
    Role(String),
    All,
}

impl std::fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{}", user),
            Self::Role(role) => write!(f, "role:{}", role),
            Self::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    /// A guard failed closed. `user_id` is absent when authentication failed.
    Denied {
        user_id: Option<UserId>,
        denial: DenialReason,
    },
    Invalidated {
        scope: InvalidationScope,
    },
}

/// One audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
    pub reason: String,
}

impl AuditEvent {
    pub fn denied(user_id: Option<UserId>, denial: DenialReason, reason: impl Into<String>) -> Self {
        Self::new(AuditKind::Denied { user_id, denial }, reason)
    }

    pub fn invalidated(scope: InvalidationScope, reason: impl Into<String>) -> Self {
        Self::new(AuditKind::Invalidated { scope }, reason)
    }

    fn new(kind: AuditKind, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes events to the `routeguards::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        match &event.kind {
            AuditKind::Denied { user_id, denial } => warn!(
                target: "routeguards::audit",
                event_id = %event.id,
                user_id = user_id.as_deref().unwrap_or("-"),
                denial = ?denial,
                reason = %event.reason,
                "Access denied"
            ),
            AuditKind::Invalidated { scope } => info!(
                target: "routeguards::audit",
                event_id = %event.id,
                scope = %scope,
                reason = %event.reason,
                "Cache invalidated"
            ),
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    /// Denials recorded for one user
    pub async fn denials_for(&self, user_id: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| {
                matches!(&event.kind, AuditKind::Denied { user_id: Some(u), .. } if u == user_id)
            })
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.write().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::denied(
            Some("alice".to_string()),
            DenialReason::Forbidden,
            "requires admin:users",
        ))
        .await;
        sink.record(AuditEvent::invalidated(
            InvalidationScope::User("alice".to_string()),
            "role revoked",
        ))
        .await;
        sink.record(AuditEvent::denied(None, DenialReason::Unauthenticated, "credential missing"))
            .await;

        let events = sink.events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].reason, "role revoked");
        assert_eq!(sink.denials_for("alice").await.len(), 1);
        assert_ne!(events[0].id, events[2].id);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::invalidated(InvalidationScope::Role("admin".to_string()), "policy change");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "invalidated");
        assert_eq!(json["scope"]["type"], "role");
        assert_eq!(json["scope"]["value"], "admin");
        assert_eq!(json["reason"], "policy change");
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        TracingAuditSink
            .record(AuditEvent::invalidated(InvalidationScope::All, "emergency"))
            .await;
    }
}
