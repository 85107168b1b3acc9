//! Notification processor: one claim/expand/commit cycle.
//!
//! # Cycle
//!
//! ```text
//! NotificationProcessor::run_cycle
//!     │
//!     ├─► claim batch           (NotificationRepository)
//!     ├─► start every expansion (Notification::to_document_events)
//!     ├─► wait all, bounded     (Deferred::wait + join_all)
//!     ├─► drop expired claims   (ensure_transaction_active)
//!     ├─► persist events        (DocumentEventRepository)
//!     │       └─► on failure: every success becomes a failure
//!     └─► finalize              (mark_notifications_processed_or_failed)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deferred::Deferred;
use crate::document_event::DocumentEvent;
use crate::notification::{FailedNotification, Notification};
use crate::repository::{DocumentEventRepository, NotificationRepository};

/// Configuration for the notification processor.
#[derive(Debug, Clone)]
pub struct NotificationProcessorConfig {
    /// Identifies this processor in logs.
    pub instance_id: String,
    /// Maximum notifications claimed per cycle. Zero skips the claim.
    pub batch_size: usize,
    /// Bound on waiting for one notification's expansion.
    pub process_timeout: Duration,
}

impl Default for NotificationProcessorConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("poller-{}", Uuid::new_v4()),
            batch_size: 50,
            process_timeout: Duration::from_secs(60),
        }
    }
}

impl NotificationProcessorConfig {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }
}

/// What happened during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationCycleReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    /// Successful expansions dropped because their claim expired.
    pub expired: usize,
    /// Document events persisted.
    pub document_events: usize,
    /// Persisting document events failed and the batch's successes were failed.
    pub rolled_back: bool,
}

pub struct NotificationProcessor {
    notifications: Arc<dyn NotificationRepository>,
    document_events: Arc<dyn DocumentEventRepository>,
    config: NotificationProcessorConfig,
}

impl NotificationProcessor {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        document_events: Arc<dyn DocumentEventRepository>,
        config: NotificationProcessorConfig,
    ) -> Self {
        Self {
            notifications,
            document_events,
            config,
        }
    }

    pub fn config(&self) -> &NotificationProcessorConfig {
        &self.config
    }

    /// Run one polling cycle.
    ///
    /// Returns `Err` only for failures that cannot be attributed to a single
    /// notification: claim or finalize transport errors and bulk response
    /// mismatches.
    pub async fn run_cycle(&self) -> Result<NotificationCycleReport> {
        let instance_id = self.config.instance_id.as_str();
        let mut report = NotificationCycleReport::default();

        let claimed = self
            .notifications
            .retrieve_oldest_notifications_up_to(self.config.batch_size)
            .await?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }

        // Start every expansion before waiting on any of them.
        let mut failed: Vec<FailedNotification> = Vec::new();
        let mut started: Vec<(Arc<dyn Notification>, Deferred<Vec<DocumentEvent>>)> =
            Vec::with_capacity(claimed.len());
        for notification in claimed {
            match notification.to_document_events() {
                Ok(deferred) => started.push((notification, deferred)),
                Err(e) => {
                    error!(
                        instance_id,
                        notification_id = %notification.id(),
                        error = %e,
                        "notification expansion could not be started"
                    );
                    failed.push(FailedNotification::new(notification, e));
                }
            }
        }

        let timeout = self.config.process_timeout;
        let outcomes = join_all(started.into_iter().map(|(notification, deferred)| async move {
            let outcome = deferred.wait(timeout).await;
            (notification, outcome)
        }))
        .await;

        let mut expanded: Vec<(Arc<dyn Notification>, Vec<DocumentEvent>)> = Vec::new();
        for (notification, outcome) in outcomes {
            match outcome {
                Ok(events) => expanded.push((notification, events)),
                Err(e) => {
                    error!(
                        instance_id,
                        notification_id = %notification.id(),
                        entity_name = %notification.entity_name(),
                        error = %e,
                        "notification expansion failed"
                    );
                    failed.push(FailedNotification::new(notification, e));
                }
            }
        }

        // Work for expired claims is neither persisted nor finalized.
        expanded.retain(|(notification, _)| {
            match self.notifications.ensure_transaction_active(notification.as_ref()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        instance_id,
                        notification_id = %notification.id(),
                        error = %e,
                        "dropping expanded notification"
                    );
                    report.expired += 1;
                    false
                }
            }
        });

        let events: Vec<DocumentEvent> = expanded
            .iter()
            .flat_map(|(_, events)| events.iter().cloned())
            .collect();

        let mut processed: Vec<Arc<dyn Notification>> = Vec::with_capacity(expanded.len());
        match self.document_events.add_new_document_events(&events).await {
            Ok(()) => {
                report.document_events = events.len();
                processed.extend(expanded.into_iter().map(|(notification, _)| notification));
            }
            Err(e) => {
                error!(
                    instance_id,
                    notifications = expanded.len(),
                    document_events = events.len(),
                    error = %e,
                    "failed to persist document events, failing the batch"
                );
                report.rolled_back = true;
                let cause = format!("{:#}", e);
                failed.extend(expanded.into_iter().map(|(notification, _)| {
                    FailedNotification::new(
                        notification,
                        anyhow!("document events were not persisted: {}", cause),
                    )
                }));
            }
        }

        report.processed = processed.len();
        report.failed = failed.len();
        self.notifications
            .mark_notifications_processed_or_failed(&processed, &failed)
            .await?;

        if report.failed > 0 || report.expired > 0 {
            info!(instance_id, ?report, "notification cycle complete");
        } else {
            debug!(instance_id, ?report, "notification cycle complete");
        }
        Ok(report)
    }
}
