//! Store boundary for notifications and document events.
//!
//! # The Contract
//!
//! 1. **Bulk is positional.** [`NotificationStore::bulk_update`] returns
//!    exactly one [`UpdateResponse`] per request, in submission order.
//!
//! 2. **Conflicts are data, not errors.** A conditional update whose token no
//!    longer matches reports `modified == 0`. A per-item store failure is
//!    reported in [`UpdateResponse::errors`]. Only a transport failure
//!    returns `Err` for the whole call.
//!
//! 3. **Inserts are all-or-nothing.** [`DocumentEventStore::insert_all`]
//!    either persists every event or none.
//!
//! Implementations: `testing::InMemory*Store` for tests and
//! `postgres::Pg*Store` behind the `postgres` feature.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::document_event::DocumentEvent;
use crate::notification::{NotificationEntity, NotificationStatus};

// =============================================================================
// Bulk Update Requests
// =============================================================================

/// Precondition for a single notification update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCondition {
    Always,
    /// Apply only if the stored processing date equals this token.
    /// Two absent dates compare equal.
    ProcessingDateIs(Option<DateTime<Utc>>),
}

impl UpdateCondition {
    pub fn matches(&self, stored: Option<DateTime<Utc>>) -> bool {
        match self {
            UpdateCondition::Always => true,
            UpdateCondition::ProcessingDateIs(token) => *token == stored,
        }
    }
}

/// One sub-request of a bulk notification update.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationUpdate {
    pub id: Uuid,
    pub status: NotificationStatus,
    /// `Some` overwrites the stored processing date; `None` leaves it.
    pub processing_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
    pub condition: UpdateCondition,
}

impl NotificationUpdate {
    /// Claim `id` at `claimed_at`, provided nobody touched it since `token` was read.
    pub fn claim(id: Uuid, token: Option<DateTime<Utc>>, claimed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: NotificationStatus::Processing,
            processing_date: Some(claimed_at),
            processed_date: None,
            condition: UpdateCondition::ProcessingDateIs(token),
        }
    }

    /// Finalize a notification we claimed at `claimed_at`.
    pub fn finalize(
        id: Uuid,
        status: NotificationStatus,
        claimed_at: DateTime<Utc>,
        processed_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status,
            processing_date: None,
            processed_date: Some(processed_date),
            condition: UpdateCondition::ProcessingDateIs(Some(claimed_at)),
        }
    }
}

/// Store response to one [`NotificationUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResponse {
    pub modified: u64,
    pub errors: Vec<String>,
}

impl UpdateResponse {
    pub fn modified(modified: u64) -> Self {
        Self {
            modified,
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            modified: 0,
            errors: vec![message.into()],
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// True when the update was applied without store-level errors.
    pub fn is_applied(&self) -> bool {
        self.modified > 0 && !self.has_errors()
    }
}

// =============================================================================
// Store Traits
// =============================================================================

/// Persistence for notification rows.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Oldest claimable rows of the given entity names.
    ///
    /// Claimable: not finalized, and either not processing or claimed before
    /// `reclaim_before`. Ordered by occurrence date ascending.
    async fn find_oldest(
        &self,
        entity_names: &[String],
        max: usize,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<NotificationEntity>>;

    /// Apply each update independently; one response per request, in order.
    async fn bulk_update(&self, updates: &[NotificationUpdate]) -> Result<Vec<UpdateResponse>>;
}

/// Persistence for document events.
#[async_trait]
pub trait DocumentEventStore: Send + Sync {
    /// Insert every event or none.
    async fn insert_all(&self, events: &[DocumentEvent]) -> Result<()>;

    /// Atomically move up to `max` pending events to processing and return
    /// them, highest priority first, then oldest first.
    async fn claim_priority(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<DocumentEvent>>;

    async fn mark_processed(&self, ids: &[Uuid], processed_date: DateTime<Utc>) -> Result<()>;
}
