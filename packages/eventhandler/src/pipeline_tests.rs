//! End-to-end scenarios over the in-memory stores.
//!
//! These tests drive both orchestrators through the store-backed
//! repositories, including concurrent pollers racing for the same rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::deferred::Deferred;
use crate::dispatcher::{ReadyEventDispatcher, ReadyEventDispatcherConfig};
use crate::document_event::{
    DocumentEvent, DocumentEventStatus, DocumentLookup, DocumentLookups, Resolution,
};
use crate::identity::Identity;
use crate::notification::{
    EntityNotification, NotificationEntity, NotificationFactories, NotificationFactory,
    NotificationStatus,
};
use crate::poller::PollingService;
use crate::processor::{NotificationProcessor, NotificationProcessorConfig};
use crate::repository::{
    NotificationRepository, NotificationRepositoryConfig, StoreDocumentEventRepository,
    StoreNotificationRepository,
};
use crate::testing::{InMemoryDocumentEventStore, InMemoryNotificationStore, SimulatedClock};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Types
// =============================================================================

/// Notification payload telling the scripted expansion what to do.
#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum Script {
    Expand { ids: Vec<String> },
    RefuseToStart,
    Hang,
    Fail { reason: String },
    /// Advance the clock past the claim deadline, then expand.
    Linger { ids: Vec<String>, secs: u64 },
}

#[derive(Debug)]
struct ScriptedNotification {
    script: Script,
    clock: Arc<SimulatedClock>,
}

fn order_events(ids: &[String]) -> Vec<DocumentEvent> {
    ids.iter()
        .map(|id| DocumentEvent::new(Identity::new("Order", [("id", id.as_str())]), 0, t0()))
        .collect()
}

impl EntityNotification for ScriptedNotification {
    fn to_document_events(&self) -> Result<Deferred<Vec<DocumentEvent>>> {
        match &self.script {
            Script::Expand { ids } => {
                let events = order_events(ids);
                Ok(Deferred::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(events)
                }))
            }
            Script::RefuseToStart => Err(anyhow!("expansion backend offline")),
            Script::Hang => Ok(Deferred::spawn(async {
                futures::future::pending::<Result<Vec<DocumentEvent>>>().await
            })),
            Script::Fail { reason } => {
                let reason = reason.clone();
                Ok(Deferred::spawn(async move { Err(anyhow!(reason)) }))
            }
            Script::Linger { ids, secs } => {
                let events = order_events(ids);
                let clock = self.clock.clone();
                let secs = *secs;
                Ok(Deferred::spawn(async move {
                    clock.advance(Duration::from_secs(secs));
                    Ok(events)
                }))
            }
        }
    }
}

struct ScriptedFactory {
    clock: Arc<SimulatedClock>,
}

impl NotificationFactory for ScriptedFactory {
    fn notification_for(&self, entity: &NotificationEntity) -> Result<Box<dyn EntityNotification>> {
        let script: Script = serde_json::from_value(entity.entity_data.clone())?;
        Ok(Box::new(ScriptedNotification {
            script,
            clock: self.clock.clone(),
        }))
    }
}

struct OrderLookup;

impl DocumentLookup for OrderLookup {
    fn lookup_document(&self, identity: &Identity) -> Result<Deferred<serde_json::Value>> {
        let id = identity.field("id").unwrap_or_default().to_string();
        Ok(Deferred::spawn(async move {
            Ok(serde_json::json!({ "order_id": id, "state": "shipped" }))
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Pipeline {
    clock: Arc<SimulatedClock>,
    notifications: Arc<InMemoryNotificationStore>,
    document_events: Arc<InMemoryDocumentEventStore>,
    notification_repository: Arc<StoreNotificationRepository<InMemoryNotificationStore>>,
    document_event_repository: Arc<StoreDocumentEventRepository<InMemoryDocumentEventStore>>,
}

impl Pipeline {
    fn new() -> Self {
        init_tracing();
        let clock = Arc::new(SimulatedClock::new(t0()));
        let notifications = Arc::new(InMemoryNotificationStore::new());
        let document_events = Arc::new(InMemoryDocumentEventStore::new());

        let mut lookups = DocumentLookups::new();
        lookups.register("Order", OrderLookup);

        Self {
            notification_repository: Arc::new(Self::repository(&notifications, &clock)),
            document_event_repository: Arc::new(
                StoreDocumentEventRepository::new(document_events.clone(), Arc::new(lookups))
                    .with_clock(clock.clone()),
            ),
            clock,
            notifications,
            document_events,
        }
    }

    /// A notification repository polling `store`; each call is an independent poller.
    fn repository(
        store: &Arc<InMemoryNotificationStore>,
        clock: &Arc<SimulatedClock>,
    ) -> StoreNotificationRepository<InMemoryNotificationStore> {
        let mut factories = NotificationFactories::new();
        factories.register(
            "Order",
            ScriptedFactory {
                clock: clock.clone(),
            },
        );
        let config = NotificationRepositoryConfig {
            processing_timeout: Duration::from_secs(600),
            expire_threshold: Duration::from_secs(60),
            entity_names_to_process: Some(HashSet::from(["Order".to_string()])),
        };
        StoreNotificationRepository::new(store.clone(), Arc::new(factories), config)
            .with_clock(clock.clone())
    }

    fn processor(&self, process_timeout: Duration) -> NotificationProcessor {
        NotificationProcessor::new(
            self.notification_repository.clone(),
            self.document_event_repository.clone(),
            NotificationProcessorConfig {
                process_timeout,
                ..NotificationProcessorConfig::with_instance_id("pipeline-test")
            },
        )
    }

    fn seed(&self, script: serde_json::Value) -> Uuid {
        let count = self.notifications.all().len() as i64;
        let entity = NotificationEntity::new(
            "Order",
            script,
            t0() - chrono::Duration::minutes(60 - count),
        );
        let id = entity.id;
        self.notifications.insert(entity);
        id
    }

    fn status(&self, id: Uuid) -> NotificationStatus {
        self.notifications
            .get(id)
            .map(|row| row.status)
            .unwrap_or_else(|| panic!("notification {} missing", id))
    }

    fn stored_event_ids(&self) -> HashSet<String> {
        self.document_events
            .all()
            .iter()
            .filter_map(|event| event.identity.field("id").map(String::from))
            .collect()
    }
}

fn expand(ids: &[&str]) -> serde_json::Value {
    serde_json::json!({ "mode": "expand", "ids": ids })
}

// =============================================================================
// Notification Processing
// =============================================================================

#[tokio::test]
async fn test_persistence_failure_rolls_back_the_batch() {
    let pipeline = Pipeline::new();
    let a = pipeline.seed(expand(&["1", "2"]));
    let b = pipeline.seed(expand(&["3", "4"]));
    let c = pipeline.seed(expand(&["5"]));
    pipeline.document_events.fail_inserts(true);

    let report = pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    assert!(report.rolled_back);
    assert_eq!(report.claimed, 3);
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 3);
    assert!(pipeline.document_events.all().is_empty());
    for id in [a, b, c] {
        assert_eq!(pipeline.status(id), NotificationStatus::Failed);
    }
}

#[tokio::test]
async fn test_partial_batch_success() {
    let pipeline = Pipeline::new();
    let refused = pipeline.seed(serde_json::json!({ "mode": "refuse_to_start" }));
    let hung = pipeline.seed(serde_json::json!({ "mode": "hang" }));
    let first = pipeline.seed(expand(&["10", "11"]));
    let second = pipeline.seed(expand(&["12"]));

    let report = pipeline
        .processor(Duration::from_millis(50))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.claimed, 4);
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.document_events, 3);
    assert!(!report.rolled_back);

    assert_eq!(pipeline.status(refused), NotificationStatus::Failed);
    assert_eq!(pipeline.status(hung), NotificationStatus::Failed);
    assert_eq!(pipeline.status(first), NotificationStatus::Processed);
    assert_eq!(pipeline.status(second), NotificationStatus::Processed);

    let expected: HashSet<String> = ["10", "11", "12"].iter().map(|s| s.to_string()).collect();
    assert_eq!(pipeline.stored_event_ids(), expected);
}

#[tokio::test]
async fn test_expansion_error_is_recorded_per_notification() {
    let pipeline = Pipeline::new();
    let broken = pipeline.seed(serde_json::json!({ "mode": "fail", "reason": "order deleted" }));
    let fine = pipeline.seed(expand(&["20"]));

    let report = pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(pipeline.status(broken), NotificationStatus::Failed);
    assert_eq!(pipeline.status(fine), NotificationStatus::Processed);
    assert_eq!(pipeline.document_events.all().len(), 1);
}

#[tokio::test]
async fn test_unparseable_notification_is_finalized_as_failed() {
    let pipeline = Pipeline::new();
    let garbage = pipeline.seed(serde_json::json!({ "mode": "teleport" }));
    let fine = pipeline.seed(expand(&["30"]));

    let report = pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.claimed, 2);
    assert_eq!(pipeline.status(garbage), NotificationStatus::Failed);
    assert_eq!(pipeline.status(fine), NotificationStatus::Processed);
}

#[tokio::test]
async fn test_failed_notifications_are_not_reselected() {
    let pipeline = Pipeline::new();
    pipeline.seed(serde_json::json!({ "mode": "refuse_to_start" }));
    let processor = pipeline.processor(Duration::from_secs(1));

    assert_eq!(processor.run_cycle().await.unwrap().failed, 1);

    pipeline.clock.advance(Duration::from_secs(3600));
    assert_eq!(processor.run_cycle().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_claim_expired_during_expansion_is_not_committed() {
    let pipeline = Pipeline::new();
    let lingering =
        pipeline.seed(serde_json::json!({ "mode": "linger", "ids": ["40"], "secs": 540 }));

    let report = pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 0);
    assert!(pipeline.document_events.all().is_empty());

    // Left claimed; becomes reclaimable once the processing timeout passes.
    assert_eq!(pipeline.status(lingering), NotificationStatus::Processing);
    pipeline.clock.advance(Duration::from_secs(61));
    let reclaimed = pipeline
        .notification_repository
        .retrieve_oldest_notifications_up_to(10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn test_lost_race_is_skipped() {
    let pipeline = Pipeline::new();
    let contested = pipeline.seed(expand(&["50"]));
    let free = pipeline.seed(expand(&["51"]));

    let rival_claim = t0() - chrono::Duration::seconds(5);
    pipeline.notifications.on_next_bulk_update(move |rows| {
        if let Some(row) = rows.get_mut(&contested) {
            row.status = NotificationStatus::Processing;
            row.processing_date = Some(rival_claim);
        }
    });

    let report = pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(pipeline.status(free), NotificationStatus::Processed);

    let row = pipeline.notifications.get(contested).unwrap();
    assert_eq!(row.status, NotificationStatus::Processing);
    assert_eq!(row.processing_date, Some(rival_claim));
    assert_eq!(pipeline.stored_event_ids(), HashSet::from(["51".to_string()]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_disjoint() {
    for _ in 0..20 {
        let pipeline = Pipeline::new();
        let seeded: HashSet<Uuid> = (0..25).map(|_| pipeline.seed(expand(&["x"]))).collect();

        let first = Arc::new(Pipeline::repository(&pipeline.notifications, &pipeline.clock));
        let second = Arc::new(Pipeline::repository(&pipeline.notifications, &pipeline.clock));

        let a = tokio::spawn({
            let repository = first.clone();
            async move { repository.retrieve_oldest_notifications_up_to(25).await }
        });
        let b = tokio::spawn({
            let repository = second.clone();
            async move { repository.retrieve_oldest_notifications_up_to(25).await }
        });

        let a: Vec<Uuid> = a.await.unwrap().unwrap().iter().map(|n| n.id()).collect();
        let b: Vec<Uuid> = b.await.unwrap().unwrap().iter().map(|n| n.id()).collect();

        let a_ids: HashSet<Uuid> = a.iter().copied().collect();
        let b_ids: HashSet<Uuid> = b.iter().copied().collect();
        assert!(a_ids.is_disjoint(&b_ids), "a notification was claimed twice");
        assert_eq!(a_ids.len() + b_ids.len(), seeded.len());
    }
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_notifications_flow_to_the_sink() {
    let pipeline = Pipeline::new();
    pipeline.seed(expand(&["60", "61"]));
    pipeline.seed(expand(&["62"]));

    pipeline
        .processor(Duration::from_secs(1))
        .run_cycle()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Resolution>();
    let dispatcher = ReadyEventDispatcher::new(
        pipeline.document_event_repository.clone(),
        Arc::new(tx),
        ReadyEventDispatcherConfig::with_instance_id("pipeline-test"),
    );

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.resolved, 3);

    let mut delivered = Vec::new();
    while let Ok(resolution) = rx.try_recv() {
        let document = resolution.outcome.unwrap();
        delivered.push(document.body["order_id"].as_str().unwrap().to_string());
    }
    delivered.sort();
    assert_eq!(delivered, vec!["60", "61", "62"]);
    assert_eq!(
        pipeline
            .document_events
            .with_status(DocumentEventStatus::Processed)
            .len(),
        3
    );
}

#[tokio::test]
async fn test_polling_service_drains_the_store() {
    let pipeline = Pipeline::new();
    let ids: Vec<Uuid> = (0..5)
        .map(|i| pipeline.seed(expand(&[format!("7{}", i).as_str()])))
        .collect();

    let processor = NotificationProcessor::new(
        pipeline.notification_repository.clone(),
        pipeline.document_event_repository.clone(),
        NotificationProcessorConfig {
            batch_size: 2,
            process_timeout: Duration::from_secs(1),
            ..NotificationProcessorConfig::with_instance_id("polling-test")
        },
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(
        PollingService::new(processor, Duration::from_millis(5)).run(shutdown.clone()),
    );

    for _ in 0..100 {
        if pipeline
            .notifications
            .with_status(NotificationStatus::Processed)
            .len()
            == ids.len()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    for id in ids {
        assert_eq!(pipeline.status(id), NotificationStatus::Processed);
    }
    assert_eq!(pipeline.document_events.all().len(), 5);
    assert_eq!(pipeline.clock.now(), t0());
}
