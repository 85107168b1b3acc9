//! # Event Handler
//!
//! A polling pipeline that turns change notifications into document events
//! and hands resolved documents downstream.
//!
//! Several pipeline instances may poll the same store at once. They never
//! coordinate in-process: every claim and commit is a conditional update on
//! the notification's processing date, and a poller that loses a race simply
//! skips the row.
//!
//! ## Architecture
//!
//! ```text
//! upstream change
//!     │
//!     ▼
//! event_notifications (received)
//!     │
//!     ▼ NotificationProcessor::run_cycle()
//! claim ─► expand (concurrent, bounded) ─► drop expired claims
//!     │
//!     ├─► add_new_document_events ─── fails ─► whole batch marked failed
//!     │
//!     └─► mark processed / failed
//!
//! document_events (pending)
//!     │
//!     ▼ ReadyEventDispatcher::run_cycle()
//! claim by priority ─► resolve (concurrent, bounded) ─► confirm ─► DocumentSink
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Claims are compare-and-swap** - The processing date read before a
//!    claim must still be stored when the claim is written
//! 2. **Bulk responses are positional** - A short response list is fatal
//! 3. **Stale work is not committed** - Expansions whose claim expired are dropped
//! 4. **Persist all or fail all** - If document events cannot be stored, every
//!    success in the batch is finalized as failed
//! 5. **Every wait is bounded** - A timeout aborts only the slow item
//!
//! ## Example
//!
//! ```ignore
//! use eventhandler::*;
//!
//! let config = EventHandlerConfig::from_env()?;
//!
//! let mut factories = NotificationFactories::new();
//! factories.register("Order", OrderNotificationFactory::new(orders.clone()));
//! let mut lookups = DocumentLookups::new();
//! lookups.register("Order", OrderLookup::new(orders));
//!
//! let notifications = Arc::new(StoreNotificationRepository::new(
//!     notification_store,
//!     Arc::new(factories),
//!     config.notification_repository.clone(),
//! ));
//! let document_events = Arc::new(StoreDocumentEventRepository::new(
//!     document_event_store,
//!     Arc::new(lookups),
//! ));
//!
//! let processor = NotificationProcessor::new(
//!     notifications,
//!     document_events.clone(),
//!     config.notification_processor.clone(),
//! );
//! let dispatcher = ReadyEventDispatcher::new(document_events, sink, config.dispatcher.clone());
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn(PollingService::new(processor, config.polling.notification_interval).run(shutdown.clone()));
//! tokio::spawn(PollingService::new(dispatcher, config.polling.document_event_interval).run(shutdown.clone()));
//! ```

// Core modules
mod clock;
mod config;
mod deferred;
mod dispatcher;
mod document_event;
mod error;
mod identity;
mod notification;
mod poller;
mod processor;
mod repository;
mod store;

// PostgreSQL stores (feature-gated)
#[cfg(feature = "postgres")]
pub mod postgres;

// In-memory stores and simulated clock
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod pipeline_tests;

pub use clock::{Clock, SystemClock};
pub use config::{EventHandlerConfig, PollingConfig};
pub use deferred::Deferred;
pub use dispatcher::{
    DispatchCycleReport, DocumentSink, ReadyEventDispatcher, ReadyEventDispatcherConfig,
};
pub use document_event::{
    Document, DocumentEvent, DocumentEventStatus, DocumentLookup, DocumentLookups,
    ReadyDocumentEvent, Resolution,
};
pub use error::EventHandlerError;
pub use identity::Identity;
pub use notification::{
    ClaimedNotification, EntityNotification, FailedNotification, Notification, NotificationBody,
    NotificationEntity, NotificationFactories, NotificationFactory, NotificationStatus,
};
pub use poller::{PollingCycle, PollingService};
pub use processor::{NotificationCycleReport, NotificationProcessor, NotificationProcessorConfig};
pub use repository::{
    DocumentEventRepository, NotificationRepository, NotificationRepositoryConfig,
    StoreDocumentEventRepository, StoreNotificationRepository,
};
pub use store::{
    DocumentEventStore, NotificationStore, NotificationUpdate, UpdateCondition, UpdateResponse,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
