//! Ready-event dispatcher: claim, resolve, confirm, forward.
//!
//! Confirmation happens before delivery. A crash between the two drops the
//! batch's deliveries (at-most-once on this path).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::document_event::{Document, Resolution};
use crate::repository::DocumentEventRepository;

/// Downstream consumer of resolution results.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn deliver(&self, resolution: Resolution) -> Result<()>;
}

#[async_trait]
impl DocumentSink for mpsc::UnboundedSender<Resolution> {
    async fn deliver(&self, resolution: Resolution) -> Result<()> {
        self.send(resolution)
            .map_err(|_| anyhow!("document sink receiver dropped"))
    }
}

/// Configuration for the ready-event dispatcher.
#[derive(Debug, Clone)]
pub struct ReadyEventDispatcherConfig {
    pub instance_id: String,
    /// Maximum document events claimed per cycle. Zero skips the claim.
    pub batch_size: usize,
    /// Bound on waiting for one document lookup.
    pub resolution_timeout: Duration,
}

impl Default for ReadyEventDispatcherConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("poller-{}", Uuid::new_v4()),
            batch_size: 50,
            resolution_timeout: Duration::from_secs(60),
        }
    }
}

impl ReadyEventDispatcherConfig {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchCycleReport {
    pub claimed: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Results the sink refused.
    pub delivery_failures: usize,
}

pub struct ReadyEventDispatcher {
    document_events: Arc<dyn DocumentEventRepository>,
    sink: Arc<dyn DocumentSink>,
    config: ReadyEventDispatcherConfig,
}

impl ReadyEventDispatcher {
    pub fn new(
        document_events: Arc<dyn DocumentEventRepository>,
        sink: Arc<dyn DocumentSink>,
        config: ReadyEventDispatcherConfig,
    ) -> Self {
        Self {
            document_events,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &ReadyEventDispatcherConfig {
        &self.config
    }

    /// Run one polling cycle.
    pub async fn run_cycle(&self) -> Result<DispatchCycleReport> {
        let instance_id = self.config.instance_id.as_str();
        let mut report = DispatchCycleReport::default();

        let ready = self
            .document_events
            .retrieve_priority_document_events_up_to(self.config.batch_size)
            .await?;
        report.claimed = ready.len();
        if ready.is_empty() {
            return Ok(report);
        }

        let started: Vec<_> = ready
            .iter()
            .map(|event| (event.event().clone(), event.lookup_document()))
            .collect();

        let timeout = self.config.resolution_timeout;
        let resolutions: Vec<Resolution> =
            join_all(started.into_iter().map(|(event, lookup)| async move {
                let outcome = match lookup {
                    Ok(deferred) => deferred.wait(timeout).await,
                    Err(e) => Err(e),
                }
                .map(|body| Document {
                    identity: event.identity.clone(),
                    body,
                });
                Resolution { event, outcome }
            }))
            .await;

        for resolution in &resolutions {
            match &resolution.outcome {
                Ok(_) => report.resolved += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        instance_id,
                        document_event_id = %resolution.event.id,
                        identity = %resolution.event.identity,
                        error = %e,
                        "document resolution failed"
                    );
                }
            }
        }

        self.document_events
            .confirm_processed_document_events(&ready)
            .await?;

        for resolution in resolutions {
            let event_id = resolution.event.id;
            if let Err(e) = self.sink.deliver(resolution).await {
                report.delivery_failures += 1;
                error!(
                    instance_id,
                    document_event_id = %event_id,
                    error = %e,
                    "document sink rejected resolution"
                );
            }
        }

        debug!(instance_id, ?report, "dispatch cycle complete");
        Ok(report)
    }
}
