//! PostgreSQL stores (feature `postgres`).
//!
//! Notification claims rely only on the conditional update
//! (`processing_date IS NOT DISTINCT FROM $token`). Document event claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never share a row.
//!
//! ```ignore
//! let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
//! run_migrations(&pool).await?;
//! let notifications = Arc::new(PgNotificationStore::new(pool.clone()));
//! let document_events = Arc::new(PgDocumentEventStore::new(pool));
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::document_event::{DocumentEvent, DocumentEventStatus};
use crate::identity::Identity;
use crate::notification::NotificationEntity;
use crate::store::{
    DocumentEventStore, NotificationStore, NotificationUpdate, UpdateCondition, UpdateResponse,
};

/// Apply the bundled schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run event handler migrations")?;
    Ok(())
}

fn limit(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

// ============================================================================
// Notifications
// ============================================================================

pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a received notification. Used by producers and tests.
    pub async fn insert(&self, entity: &NotificationEntity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_notifications
                (id, entity_name, entity_data, status, occurrence_date, processing_date, processed_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entity.id)
        .bind(&entity.entity_name)
        .bind(&entity.entity_data)
        .bind(entity.status)
        .bind(entity.occurrence_date)
        .bind(entity.processing_date)
        .bind(entity.processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn find_oldest(
        &self,
        entity_names: &[String],
        max: usize,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<NotificationEntity>> {
        let rows = sqlx::query_as::<_, NotificationEntity>(
            r#"
            SELECT id, entity_name, entity_data, status, occurrence_date, processing_date, processed_date
            FROM event_notifications
            WHERE entity_name = ANY($1)
              AND (
                status = 'received'
                OR (status = 'processing' AND (processing_date IS NULL OR processing_date < $2))
              )
            ORDER BY occurrence_date, id
            LIMIT $3
            "#,
        )
        .bind(entity_names)
        .bind(reclaim_before)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn bulk_update(&self, updates: &[NotificationUpdate]) -> Result<Vec<UpdateResponse>> {
        let mut responses = Vec::with_capacity(updates.len());

        // One statement per request: a per-row failure must not abort its siblings.
        for update in updates {
            let (unconditional, token) = match update.condition {
                UpdateCondition::Always => (true, None),
                UpdateCondition::ProcessingDateIs(token) => (false, token),
            };

            let result = sqlx::query(
                r#"
                UPDATE event_notifications
                SET status = $2,
                    processing_date = COALESCE($3, processing_date),
                    processed_date = COALESCE($4, processed_date)
                WHERE id = $1
                  AND ($5 OR processing_date IS NOT DISTINCT FROM $6)
                "#,
            )
            .bind(update.id)
            .bind(update.status)
            .bind(update.processing_date)
            .bind(update.processed_date)
            .bind(unconditional)
            .bind(token)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => responses.push(UpdateResponse::modified(done.rows_affected())),
                Err(sqlx::Error::Database(e)) => {
                    responses.push(UpdateResponse::error(e.message().to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(responses)
    }
}

// ============================================================================
// Document Events
// ============================================================================

#[derive(Debug, FromRow)]
struct DocumentEventRow {
    id: Uuid,
    resource_type: String,
    identity_fields: Json<BTreeMap<String, String>>,
    priority: i32,
    status: DocumentEventStatus,
    creation_date: DateTime<Utc>,
    processing_date: Option<DateTime<Utc>>,
    processed_date: Option<DateTime<Utc>>,
}

impl From<DocumentEventRow> for DocumentEvent {
    fn from(row: DocumentEventRow) -> Self {
        DocumentEvent {
            id: row.id,
            identity: Identity::new(row.resource_type, row.identity_fields.0),
            priority: row.priority,
            status: row.status,
            creation_date: row.creation_date,
            processing_date: row.processing_date,
            processed_date: row.processed_date,
        }
    }
}

pub struct PgDocumentEventStore {
    pool: PgPool,
}

impl PgDocumentEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentEventStore for PgDocumentEventStore {
    async fn insert_all(&self, events: &[DocumentEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO document_events
                    (id, resource_type, identity_fields, priority, status,
                     creation_date, processing_date, processed_date)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.id)
            .bind(event.identity.resource_type())
            .bind(Json(event.identity.fields()))
            .bind(event.priority)
            .bind(event.status)
            .bind(event.creation_date)
            .bind(event.processing_date)
            .bind(event.processed_date)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert document event {}", event.id))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_priority(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<DocumentEvent>> {
        let rows = sqlx::query_as::<_, DocumentEventRow>(
            r#"
            WITH next_events AS (
                SELECT id
                FROM document_events
                WHERE status = 'pending'
                ORDER BY priority DESC, creation_date, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE document_events
            SET status = 'processing',
                processing_date = $2
            WHERE id IN (SELECT id FROM next_events)
            RETURNING id, resource_type, identity_fields, priority, status,
                      creation_date, processing_date, processed_date
            "#,
        )
        .bind(limit(max))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE's order.
        let mut events: Vec<DocumentEvent> = rows.into_iter().map(DocumentEvent::from).collect();
        events.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.creation_date.cmp(&b.creation_date))
                .then(a.id.cmp(&b.id))
        });
        Ok(events)
    }

    async fn mark_processed(&self, ids: &[Uuid], processed_date: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE document_events
            SET status = 'processed',
                processed_date = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
