//! Fixed-interval polling loop around an orchestrator cycle.
//!
//! ```ignore
//! let shutdown = CancellationToken::new();
//! let handle = tokio::spawn(
//!     PollingService::new(processor, Duration::from_secs(5)).run(shutdown.clone()),
//! );
//! // ...
//! shutdown.cancel();
//! handle.await?;
//! ```

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::dispatcher::{DispatchCycleReport, ReadyEventDispatcher};
use crate::processor::{NotificationCycleReport, NotificationProcessor};

/// One unit of polling work.
#[async_trait]
pub trait PollingCycle: Send + Sync {
    type Report: Debug + Send;

    /// Name used in logs.
    fn name(&self) -> &str;

    async fn run_cycle(&self) -> Result<Self::Report>;
}

#[async_trait]
impl PollingCycle for NotificationProcessor {
    type Report = NotificationCycleReport;

    fn name(&self) -> &str {
        &self.config().instance_id
    }

    async fn run_cycle(&self) -> Result<NotificationCycleReport> {
        NotificationProcessor::run_cycle(self).await
    }
}

#[async_trait]
impl PollingCycle for ReadyEventDispatcher {
    type Report = DispatchCycleReport;

    fn name(&self) -> &str {
        &self.config().instance_id
    }

    async fn run_cycle(&self) -> Result<DispatchCycleReport> {
        ReadyEventDispatcher::run_cycle(self).await
    }
}

/// Runs a [`PollingCycle`] every `interval` until cancelled.
///
/// A failed cycle is logged and the next one runs on schedule. Cycles never
/// overlap: the interval is measured from the end of the previous cycle.
pub struct PollingService<C: PollingCycle> {
    cycle: C,
    interval: Duration,
}

impl<C: PollingCycle> PollingService<C> {
    pub fn new(cycle: C, interval: Duration) -> Self {
        Self { cycle, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.cycle.name().to_string();
        info!(poller = %name, interval = ?self.interval, "polling service starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.cycle.run_cycle() => match result {
                    Ok(report) => trace!(poller = %name, ?report, "cycle finished"),
                    Err(e) => error!(poller = %name, error = %e, "polling cycle failed"),
                },
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(poller = %name, "polling service stopped");
    }
}
