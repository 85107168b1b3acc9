//! In-memory stores and a controllable clock for tests.
//!
//! Available under `cfg(test)` or with the `testing` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::document_event::{DocumentEvent, DocumentEventStatus};
use crate::notification::{NotificationEntity, NotificationStatus};
use crate::store::{DocumentEventStore, NotificationStore, NotificationUpdate, UpdateResponse};

type Rows = HashMap<Uuid, NotificationEntity>;
type RowsHook = Box<dyn FnOnce(&mut Rows) + Send>;

// =============================================================================
// Notification Store
// =============================================================================

/// In-memory notification store backed by a HashMap.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    rows: Mutex<Rows>,
    before_next_update: Mutex<Option<RowsHook>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: NotificationEntity) {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity.id, entity);
    }

    pub fn get(&self, id: Uuid) -> Option<NotificationEntity> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// All rows, oldest occurrence first.
    pub fn all(&self) -> Vec<NotificationEntity> {
        let mut rows: Vec<NotificationEntity> = self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.occurrence_date, row.id));
        rows
    }

    pub fn with_status(&self, status: NotificationStatus) -> Vec<NotificationEntity> {
        self.all()
            .into_iter()
            .filter(|row| row.status == status)
            .collect()
    }

    /// Run `hook` against the rows right before the next bulk update applies.
    ///
    /// Simulates a concurrent writer slipping in between find and update.
    pub fn on_next_bulk_update<F>(&self, hook: F)
    where
        F: FnOnce(&mut Rows) + Send + 'static,
    {
        *self
            .before_next_update
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn find_oldest(
        &self,
        entity_names: &[String],
        max: usize,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<NotificationEntity>> {
        let rows = self
            .rows
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;

        let mut selected: Vec<NotificationEntity> = rows
            .values()
            .filter(|row| entity_names.contains(&row.entity_name))
            .filter(|row| !row.status.is_final())
            .filter(|row| {
                row.status != NotificationStatus::Processing
                    || row.processing_date.map_or(true, |date| date < reclaim_before)
            })
            .cloned()
            .collect();
        selected.sort_by_key(|row| (row.occurrence_date, row.id));
        selected.truncate(max);
        Ok(selected)
    }

    async fn bulk_update(&self, updates: &[NotificationUpdate]) -> Result<Vec<UpdateResponse>> {
        let hook = self
            .before_next_update
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?
            .take();
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;
        if let Some(hook) = hook {
            hook(&mut rows);
        }

        Ok(updates
            .iter()
            .map(|update| match rows.get_mut(&update.id) {
                Some(row) if update.condition.matches(row.processing_date) => {
                    row.status = update.status;
                    if update.processing_date.is_some() {
                        row.processing_date = update.processing_date;
                    }
                    if update.processed_date.is_some() {
                        row.processed_date = update.processed_date;
                    }
                    UpdateResponse::modified(1)
                }
                _ => UpdateResponse::modified(0),
            })
            .collect())
    }
}

// =============================================================================
// Document Event Store
// =============================================================================

/// In-memory document event store.
#[derive(Default)]
pub struct InMemoryDocumentEventStore {
    rows: Mutex<HashMap<Uuid, DocumentEvent>>,
    fail_inserts: AtomicBool,
}

impl InMemoryDocumentEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail without persisting anything.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// All rows, oldest first.
    pub fn all(&self) -> Vec<DocumentEvent> {
        let mut rows: Vec<DocumentEvent> = self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.creation_date, row.id));
        rows
    }

    pub fn with_status(&self, status: DocumentEventStatus) -> Vec<DocumentEvent> {
        self.all()
            .into_iter()
            .filter(|row| row.status == status)
            .collect()
    }
}

#[async_trait]
impl DocumentEventStore for InMemoryDocumentEventStore {
    async fn insert_all(&self, events: &[DocumentEvent]) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow!("document event store unavailable"));
        }
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;
        if let Some(duplicate) = events.iter().find(|event| rows.contains_key(&event.id)) {
            return Err(anyhow!("duplicate document event id {}", duplicate.id));
        }
        for event in events {
            rows.insert(event.id, event.clone());
        }
        Ok(())
    }

    async fn claim_priority(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<DocumentEvent>> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;

        let mut pending: Vec<&mut DocumentEvent> = rows
            .values_mut()
            .filter(|row| row.status == DocumentEventStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.creation_date.cmp(&b.creation_date))
                .then(a.id.cmp(&b.id))
        });

        Ok(pending
            .into_iter()
            .take(max)
            .map(|row| {
                row.status = DocumentEventStatus::Processing;
                row.processing_date = Some(now);
                row.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, ids: &[Uuid], processed_date: DateTime<Utc>) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                row.status = DocumentEventStatus::Processed;
                row.processed_date = Some(processed_date);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Simulated Clock
// =============================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct SimulatedClock {
    now: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = clock::plus(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
