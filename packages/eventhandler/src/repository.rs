//! Claim/commit protocols over the notification and document-event stores.
//!
//! # Notification claims
//!
//! Optimistic concurrency on the processing date is the only coordination
//! between pollers:
//!
//! 1. **Find.** Select the oldest claimable rows of the enabled entities.
//! 2. **Claim.** Issue one conditional update per row: "set processing at
//!    `now` if the processing date is still what I read".
//! 3. **Correlate.** Responses are matched to requests by position. A
//!    response count that differs from the request count is fatal.
//! 4. **Skip losers.** A zero-modified response or a per-item error means
//!    another poller won the race. The row is dropped, with a warning.
//!
//! Commits are conditioned on the processing date written by our own claim,
//! so a poller whose claim was taken over cannot finalize the row.

use std::any::type_name;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{self, Clock, SystemClock};
use crate::document_event::{DocumentEvent, DocumentLookups, ReadyDocumentEvent};
use crate::error::EventHandlerError;
use crate::notification::{
    ClaimedNotification, FailedNotification, Notification, NotificationFactories,
    NotificationStatus,
};
use crate::store::{DocumentEventStore, NotificationStore, NotificationUpdate, UpdateResponse};

// =============================================================================
// Repository Traits
// =============================================================================

/// Claim/commit protocol for notifications.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Claim up to `max` of the oldest claimable notifications.
    ///
    /// Notifications lost to a concurrent claimant are silently absent from
    /// the result.
    async fn retrieve_oldest_notifications_up_to(
        &self,
        max: usize,
    ) -> Result<Vec<Arc<dyn Notification>>>;

    /// Fail with [`EventHandlerError::ClaimExpired`] once the claim on
    /// `notification` is too old to commit work for.
    fn ensure_transaction_active(
        &self,
        notification: &dyn Notification,
    ) -> Result<(), EventHandlerError>;

    /// Finalize claimed notifications as processed or failed.
    async fn mark_notifications_processed_or_failed(
        &self,
        processed: &[Arc<dyn Notification>],
        failed: &[FailedNotification],
    ) -> Result<()>;
}

/// Claim/commit protocol for document events.
#[async_trait]
pub trait DocumentEventRepository: Send + Sync {
    async fn add_new_document_events(&self, events: &[DocumentEvent]) -> Result<()>;

    async fn retrieve_priority_document_events_up_to(
        &self,
        max: usize,
    ) -> Result<Vec<ReadyDocumentEvent>>;

    async fn confirm_processed_document_events(&self, events: &[ReadyDocumentEvent])
        -> Result<()>;
}

// =============================================================================
// Notification Repository
// =============================================================================

/// Configuration for [`StoreNotificationRepository`].
#[derive(Debug, Clone)]
pub struct NotificationRepositoryConfig {
    /// Age after which a processing claim is presumed abandoned.
    pub processing_timeout: Duration,
    /// Safety margin subtracted from the processing timeout before commit.
    pub expire_threshold: Duration,
    /// Entity names enabled for processing. `None` processes nothing.
    pub entity_names_to_process: Option<HashSet<String>>,
}

impl Default for NotificationRepositoryConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(600),
            expire_threshold: Duration::from_secs(60),
            entity_names_to_process: None,
        }
    }
}

/// [`NotificationRepository`] over any [`NotificationStore`].
pub struct StoreNotificationRepository<S: NotificationStore> {
    store: Arc<S>,
    factories: Arc<NotificationFactories>,
    config: NotificationRepositoryConfig,
    clock: Arc<dyn Clock>,
}

impl<S: NotificationStore> StoreNotificationRepository<S> {
    pub fn new(
        store: Arc<S>,
        factories: Arc<NotificationFactories>,
        config: NotificationRepositoryConfig,
    ) -> Self {
        Self {
            store,
            factories,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &NotificationRepositoryConfig {
        &self.config
    }

    /// Entity names that are both supported (have a factory) and enabled.
    pub fn entity_names_to_process(&self) -> Vec<String> {
        let Some(enabled) = &self.config.entity_names_to_process else {
            return Vec::new();
        };
        self.factories
            .entity_names()
            .into_iter()
            .filter(|name| enabled.contains(name))
            .collect()
    }

    fn claimed<'a>(
        &self,
        notification: &'a dyn Notification,
    ) -> Result<&'a ClaimedNotification, EventHandlerError> {
        notification
            .as_any()
            .downcast_ref::<ClaimedNotification>()
            .ok_or_else(|| EventHandlerError::NotificationTypeMismatch {
                expected: type_name::<ClaimedNotification>(),
                actual: notification.type_name(),
            })
    }
}

fn ensure_positional<T>(requests: &[T], responses: &[UpdateResponse]) -> Result<(), EventHandlerError> {
    if requests.len() != responses.len() {
        return Err(EventHandlerError::BulkResponseMismatch {
            requests: requests.len(),
            responses: responses.len(),
        });
    }
    Ok(())
}

#[async_trait]
impl<S: NotificationStore + 'static> NotificationRepository for StoreNotificationRepository<S> {
    async fn retrieve_oldest_notifications_up_to(
        &self,
        max: usize,
    ) -> Result<Vec<Arc<dyn Notification>>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let entity_names = self.entity_names_to_process();
        if entity_names.is_empty() {
            debug!("no entity names enabled for processing");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let reclaim_before = clock::minus(now, self.config.processing_timeout);
        let entities = self
            .store
            .find_oldest(&entity_names, max, reclaim_before)
            .await?;
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let claims: Vec<ClaimedNotification> = entities
            .into_iter()
            .map(|entity| ClaimedNotification::claim(entity, &self.factories, now))
            .collect();
        let updates: Vec<NotificationUpdate> = claims
            .iter()
            .map(|claim| {
                NotificationUpdate::claim(
                    claim.entity().id,
                    claim.original_processing_date(),
                    claim.claimed_at(),
                )
            })
            .collect();

        let responses = self.store.bulk_update(&updates).await?;
        ensure_positional(&updates, &responses)?;

        let mut claimed: Vec<Arc<dyn Notification>> = Vec::with_capacity(claims.len());
        for (claim, response) in claims.into_iter().zip(responses) {
            if response.has_errors() {
                warn!(
                    notification_id = %claim.entity().id,
                    errors = ?response.errors,
                    "store rejected notification claim, skipping"
                );
            } else if response.modified == 0 {
                warn!(
                    notification_id = %claim.entity().id,
                    "notification claimed concurrently, skipping"
                );
            } else {
                claimed.push(Arc::new(claim));
            }
        }

        debug!(claimed = claimed.len(), "claimed notifications");
        Ok(claimed)
    }

    fn ensure_transaction_active(
        &self,
        notification: &dyn Notification,
    ) -> Result<(), EventHandlerError> {
        let claim = self.claimed(notification)?;
        let expired_at =
            claim.claim_expires_at(self.config.processing_timeout, self.config.expire_threshold);

        if self.clock.now() >= expired_at {
            return Err(EventHandlerError::ClaimExpired {
                notification_id: claim.entity().id,
                claimed_at: claim.claimed_at(),
                expired_at,
                processing_timeout: self.config.processing_timeout,
                expire_threshold: self.config.expire_threshold,
            });
        }
        Ok(())
    }

    async fn mark_notifications_processed_or_failed(
        &self,
        processed: &[Arc<dyn Notification>],
        failed: &[FailedNotification],
    ) -> Result<()> {
        if processed.is_empty() && failed.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut updates = Vec::with_capacity(processed.len() + failed.len());
        for notification in processed {
            let claim = self.claimed(notification.as_ref())?;
            updates.push(NotificationUpdate::finalize(
                claim.entity().id,
                NotificationStatus::Processed,
                claim.claimed_at(),
                now,
            ));
        }
        for failure in failed {
            let claim = self.claimed(failure.notification.as_ref())?;
            updates.push(NotificationUpdate::finalize(
                claim.entity().id,
                NotificationStatus::Failed,
                claim.claimed_at(),
                now,
            ));
        }

        let responses = self.store.bulk_update(&updates).await?;
        ensure_positional(&updates, &responses)?;

        for (update, response) in updates.iter().zip(&responses) {
            if !response.is_applied() {
                warn!(
                    notification_id = %update.id,
                    status = %update.status,
                    errors = ?response.errors,
                    "notification was not finalized; claim no longer held"
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Document Event Repository
// =============================================================================

/// [`DocumentEventRepository`] over any [`DocumentEventStore`].
pub struct StoreDocumentEventRepository<S: DocumentEventStore> {
    store: Arc<S>,
    lookups: Arc<DocumentLookups>,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentEventStore> StoreDocumentEventRepository<S> {
    pub fn new(store: Arc<S>, lookups: Arc<DocumentLookups>) -> Self {
        Self {
            store,
            lookups,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<S: DocumentEventStore + 'static> DocumentEventRepository for StoreDocumentEventRepository<S> {
    async fn add_new_document_events(&self, events: &[DocumentEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.store.insert_all(events).await
    }

    async fn retrieve_priority_document_events_up_to(
        &self,
        max: usize,
    ) -> Result<Vec<ReadyDocumentEvent>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let events = self.store.claim_priority(max, self.clock.now()).await?;
        Ok(events
            .into_iter()
            .map(|event| {
                let lookup = self.lookups.get(event.resource_type());
                ReadyDocumentEvent::new(event, lookup)
            })
            .collect())
    }

    async fn confirm_processed_document_events(
        &self,
        events: &[ReadyDocumentEvent],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = events.iter().map(|ready| ready.event().id).collect();
        self.store.mark_processed(&ids, self.clock.now()).await
    }
}
