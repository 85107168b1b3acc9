//! Notifications: claimed, in-flight records of upstream changes.
//!
//! This module provides:
//! - [`NotificationEntity`] - One row of the notification store
//! - [`Notification`] - What the orchestrator needs from a claimed notification
//! - [`EntityNotification`] / [`NotificationFactory`] - Per-entity expansion logic
//! - [`NotificationFactories`] - Factory lookup keyed by entity name
//! - [`ClaimedNotification`] - The notification produced by the store-backed repository
//! - [`FailedNotification`] - Bookkeeping pair routed to the commit call
//!
//! # Lifecycle
//!
//! ```text
//! received ──claim──► processing ──finalize──► processed | failed
//!                        │
//!                        └── crash: stays processing until the processing
//!                            timeout makes it reclaimable
//! ```
//!
//! # Example
//!
//! ```ignore
//! struct OrderNotification { order_id: String }
//!
//! impl EntityNotification for OrderNotification {
//!     fn to_document_events(&self) -> Result<Deferred<Vec<DocumentEvent>>> {
//!         let identity = Identity::new("Order", [("id", self.order_id.as_str())]);
//!         Ok(Deferred::ready(vec![DocumentEvent::new(identity, 0, Utc::now())]))
//!     }
//! }
//!
//! let mut factories = NotificationFactories::new();
//! factories.register("Order", OrderFactory);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::deferred::Deferred;
use crate::document_event::DocumentEvent;
use crate::error::EventHandlerError;

// =============================================================================
// Store Representation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "notification_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Received,
    Processing,
    Processed,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Received => "received",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Processed => "processed",
            NotificationStatus::Failed => "failed",
        }
    }

    /// Processed and failed notifications are never selected again.
    pub fn is_final(&self) -> bool {
        matches!(self, NotificationStatus::Processed | NotificationStatus::Failed)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the notification store.
///
/// Rows are written by whatever observes upstream changes. This crate only
/// reads them and moves them through their statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct NotificationEntity {
    pub id: Uuid,
    /// Entity type tag; selects the [`NotificationFactory`].
    pub entity_name: String,
    /// Entity-specific change payload.
    pub entity_data: serde_json::Value,
    pub status: NotificationStatus,
    /// When the upstream change happened. Claims go oldest first.
    pub occurrence_date: DateTime<Utc>,
    /// Last claim timestamp; doubles as the optimistic concurrency token.
    pub processing_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl NotificationEntity {
    /// A freshly received notification.
    pub fn new(
        entity_name: impl Into<String>,
        entity_data: serde_json::Value,
        occurrence_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_name: entity_name.into(),
            entity_data,
            status: NotificationStatus::Received,
            occurrence_date,
            processing_date: None,
            processed_date: None,
        }
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// A claimed notification as seen by the orchestrator.
pub trait Notification: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> Uuid;

    fn entity_name(&self) -> &str;

    /// Start expanding this notification into document events.
    ///
    /// An `Err` means expansion could not even be started. A started expansion
    /// may still fail when waited on.
    fn to_document_events(&self) -> Result<Deferred<Vec<DocumentEvent>>>;

    /// For repositories that only accept their own notifications.
    fn as_any(&self) -> &dyn Any;

    /// Concrete type name, used in type-mismatch errors.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Entity-specific interpretation of a notification row.
pub trait EntityNotification: Send + Sync + fmt::Debug {
    /// Start computing the document events this change implies.
    fn to_document_events(&self) -> Result<Deferred<Vec<DocumentEvent>>>;
}

/// Parses notification rows of one entity type.
pub trait NotificationFactory: Send + Sync {
    fn notification_for(&self, entity: &NotificationEntity) -> Result<Box<dyn EntityNotification>>;
}

// =============================================================================
// Factory Registry
// =============================================================================

/// Registry of notification factories keyed by entity name.
///
/// The registered names are the "supported" entity names: rows of any other
/// entity are never selected.
#[derive(Default, Clone)]
pub struct NotificationFactories {
    factories: HashMap<String, Arc<dyn NotificationFactory>>,
}

impl NotificationFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for an entity name.
    ///
    /// # Panics
    ///
    /// Panics if a factory is already registered for this entity name.
    pub fn register<F>(&mut self, entity_name: impl Into<String>, factory: F)
    where
        F: NotificationFactory + 'static,
    {
        let entity_name = entity_name.into();
        if self.factories.contains_key(&entity_name) {
            panic!("notification factory already registered for entity: {}", entity_name);
        }
        self.factories.insert(entity_name, Arc::new(factory));
    }

    pub fn get(&self, entity_name: &str) -> Option<&Arc<dyn NotificationFactory>> {
        self.factories.get(entity_name)
    }

    /// Supported entity names, sorted.
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, entity_name: &str) -> bool {
        self.factories.contains_key(entity_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for NotificationFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationFactories")
            .field("entity_names", &self.entity_names())
            .finish()
    }
}

// =============================================================================
// Claimed Notification
// =============================================================================

/// Parsed body of a claimed notification.
#[derive(Debug)]
pub enum NotificationBody {
    Parsed(Box<dyn EntityNotification>),
    /// The factory rejected the row. Expansion always fails with this reason,
    /// so the row is finalized as failed instead of sinking the batch.
    Unparseable { reason: String },
}

/// A notification claimed by [`StoreNotificationRepository`](crate::StoreNotificationRepository).
#[derive(Debug)]
pub struct ClaimedNotification {
    entity: NotificationEntity,
    original_processing_date: Option<DateTime<Utc>>,
    claimed_at: DateTime<Utc>,
    body: NotificationBody,
}

impl ClaimedNotification {
    /// Parse `entity` and mark it locally as claimed at `now`.
    ///
    /// The pre-claim processing date is kept as the concurrency token.
    pub(crate) fn claim(
        mut entity: NotificationEntity,
        factories: &NotificationFactories,
        now: DateTime<Utc>,
    ) -> Self {
        let body = match factories.get(&entity.entity_name) {
            Some(factory) => match factory.notification_for(&entity) {
                Ok(parsed) => NotificationBody::Parsed(parsed),
                Err(e) => {
                    tracing::debug!(
                        notification_id = %entity.id,
                        entity_name = %entity.entity_name,
                        error = %e,
                        "failed to parse notification entity"
                    );
                    NotificationBody::Unparseable {
                        reason: format!("{:#}", e),
                    }
                }
            },
            None => NotificationBody::Unparseable {
                reason: format!(
                    "no notification factory registered for entity {}",
                    entity.entity_name
                ),
            },
        };

        let original_processing_date = entity.processing_date;
        entity.processing_date = Some(now);
        entity.status = NotificationStatus::Processing;

        Self {
            entity,
            original_processing_date,
            claimed_at: now,
            body,
        }
    }

    /// The row as it will look once the claim is applied.
    pub fn entity(&self) -> &NotificationEntity {
        &self.entity
    }

    /// Processing date observed before the claim (the concurrency token).
    pub fn original_processing_date(&self) -> Option<DateTime<Utc>> {
        self.original_processing_date
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub fn body(&self) -> &NotificationBody {
        &self.body
    }

    pub fn is_parseable(&self) -> bool {
        matches!(self.body, NotificationBody::Parsed(_))
    }

    /// Instant after which work for this claim must not be committed:
    /// `claimed_at + processing_timeout - expire_threshold`.
    pub fn claim_expires_at(
        &self,
        processing_timeout: std::time::Duration,
        expire_threshold: std::time::Duration,
    ) -> DateTime<Utc> {
        clock::minus(
            clock::plus(self.claimed_at, processing_timeout),
            expire_threshold,
        )
    }
}

impl Notification for ClaimedNotification {
    fn id(&self) -> Uuid {
        self.entity.id
    }

    fn entity_name(&self) -> &str {
        &self.entity.entity_name
    }

    fn to_document_events(&self) -> Result<Deferred<Vec<DocumentEvent>>> {
        match &self.body {
            NotificationBody::Parsed(parsed) => parsed.to_document_events(),
            NotificationBody::Unparseable { reason } => {
                Ok(Deferred::failed(EventHandlerError::UnparseableNotification {
                    notification_id: self.entity.id,
                    reason: reason.clone(),
                }))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Failed Notification
// =============================================================================

/// A notification paired with the reason it failed. Never persisted directly.
#[derive(Debug)]
pub struct FailedNotification {
    pub notification: Arc<dyn Notification>,
    pub cause: anyhow::Error,
}

impl FailedNotification {
    pub fn new(notification: Arc<dyn Notification>, cause: anyhow::Error) -> Self {
        Self {
            notification,
            cause,
        }
    }
}
