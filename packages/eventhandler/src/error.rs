//! Structured error types for the event pipeline.
//!
//! `EventHandlerError` provides pattern-matchable errors for the failure modes
//! the orchestrators react to. Store, factory and sink seams speak
//! `anyhow::Error`; domain errors travel inside it and are recovered with
//! `downcast_ref`.
//!
//! # Propagation
//!
//! | Failure | Handling |
//! |---------|----------|
//! | claim conflict (zero rows modified, per-item store error) | skipped, logged |
//! | [`EventHandlerError::ClaimExpired`] | dropped from the success set, logged |
//! | expansion / resolution failure, [`EventHandlerError::Timeout`] | recorded per item |
//! | [`EventHandlerError::BulkResponseMismatch`] | fatal for the cycle |
//! | [`EventHandlerError::NotificationTypeMismatch`] | programmer error, fails fast |
//!
//! # Example
//!
//! ```ignore
//! use eventhandler::EventHandlerError;
//!
//! match processor.run_cycle().await {
//!     Ok(report) => tracing::debug!(?report, "cycle complete"),
//!     Err(e) => match e.downcast_ref::<EventHandlerError>() {
//!         Some(EventHandlerError::BulkResponseMismatch { requests, responses }) => {
//!             tracing::error!(requests, responses, "store returned a short bulk response");
//!         }
//!         _ => tracing::error!(error = %e, "cycle failed"),
//!     },
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Structured error type for event pipeline operations.
#[derive(Debug, Error)]
pub enum EventHandlerError {
    /// The processing claim on a notification aged out before commit.
    ///
    /// Another poller may already consider the notification reclaimable, so
    /// work produced for it must not be persisted.
    #[error(
        "claim on notification {notification_id} expired at {expired_at} \
         (claimed at {claimed_at}, processing timeout {processing_timeout:?}, \
         expire threshold {expire_threshold:?})"
    )]
    ClaimExpired {
        notification_id: Uuid,
        claimed_at: DateTime<Utc>,
        expired_at: DateTime<Utc>,
        processing_timeout: Duration,
        expire_threshold: Duration,
    },

    /// A repository was handed a notification it did not produce.
    #[error("unsupported notification type: expected {expected}, got {actual}")]
    NotificationTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A bulk store call returned a different number of responses than
    /// requests submitted. Results cannot be attributed positionally.
    #[error("mismatched bulk response: {requests} requests but {responses} responses")]
    BulkResponseMismatch { requests: usize, responses: usize },

    /// Timeout waiting for a deferred computation.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The notification row could not be turned into a domain notification.
    #[error("notification {notification_id} could not be parsed: {reason}")]
    UnparseableNotification { notification_id: Uuid, reason: String },

    /// A document event names a type with no registered lookup.
    #[error("no document lookup registered for resource type {resource_type}")]
    UnknownDocumentType { resource_type: String },

    /// The task backing a deferred computation panicked.
    #[error("deferred task panicked: {message}")]
    TaskPanicked { message: String },

    /// The task backing a deferred computation was cancelled.
    #[error("deferred task was cancelled")]
    TaskCancelled,

    /// Configuration failed validation.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl EventHandlerError {
    /// Returns true if the error means ownership of a claim was lost.
    pub fn is_claim_expired(&self) -> bool {
        matches!(self, EventHandlerError::ClaimExpired { .. })
    }

    /// Returns true for bounded-wait timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EventHandlerError::Timeout { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        EventHandlerError::Config {
            message: message.into(),
        }
    }
}
