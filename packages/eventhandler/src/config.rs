use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use uuid::Uuid;

use crate::dispatcher::ReadyEventDispatcherConfig;
use crate::error::EventHandlerError;
use crate::processor::NotificationProcessorConfig;
use crate::repository::NotificationRepositoryConfig;

/// Polling cadence for both orchestrators.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub notification_interval: Duration,
    pub document_event_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            notification_interval: Duration::from_secs(5),
            document_event_interval: Duration::from_secs(5),
        }
    }
}

/// Pipeline configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct EventHandlerConfig {
    pub instance_id: String,
    pub database_url: Option<String>,
    pub notification_repository: NotificationRepositoryConfig,
    pub notification_processor: NotificationProcessorConfig,
    pub dispatcher: ReadyEventDispatcherConfig,
    pub polling: PollingConfig,
}

impl Default for EventHandlerConfig {
    fn default() -> Self {
        Self::with_instance_id(format!("poller-{}", Uuid::new_v4()))
    }
}

impl EventHandlerConfig {
    /// Defaults, with both orchestrators named after `instance_id`.
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            notification_processor: NotificationProcessorConfig::with_instance_id(format!(
                "{}-notifications",
                instance_id
            )),
            dispatcher: ReadyEventDispatcherConfig::with_instance_id(format!(
                "{}-document-events",
                instance_id
            )),
            instance_id,
            database_url: None,
            notification_repository: NotificationRepositoryConfig::default(),
            polling: PollingConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_id = lookup("EVENTHANDLER_INSTANCE_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("poller-{}", Uuid::new_v4()));
        let mut config = Self::with_instance_id(instance_id);

        config.database_url = lookup("DATABASE_URL");
        config.notification_repository.entity_names_to_process =
            lookup("EVENTHANDLER_ENTITY_NAMES").and_then(|names| parse_entity_names(&names));

        config.notification_processor.batch_size =
            parse_or(&lookup, "EVENTHANDLER_NOTIFICATION_BATCH_SIZE", 50)?;
        config.polling.notification_interval =
            millis_or(&lookup, "EVENTHANDLER_NOTIFICATION_POLL_INTERVAL_MS", 5_000)?;
        config.notification_repository.processing_timeout =
            millis_or(&lookup, "EVENTHANDLER_NOTIFICATION_PROCESSING_TIMEOUT_MS", 600_000)?;
        config.notification_repository.expire_threshold =
            millis_or(&lookup, "EVENTHANDLER_NOTIFICATION_EXPIRE_THRESHOLD_MS", 60_000)?;
        config.notification_processor.process_timeout =
            millis_or(&lookup, "EVENTHANDLER_NOTIFICATION_PROCESS_TIMEOUT_MS", 60_000)?;

        config.dispatcher.batch_size =
            parse_or(&lookup, "EVENTHANDLER_DOCUMENT_EVENT_BATCH_SIZE", 50)?;
        config.polling.document_event_interval =
            millis_or(&lookup, "EVENTHANDLER_DOCUMENT_EVENT_POLL_INTERVAL_MS", 5_000)?;
        config.dispatcher.resolution_timeout =
            millis_or(&lookup, "EVENTHANDLER_DOCUMENT_RESOLUTION_TIMEOUT_MS", 60_000)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EventHandlerError> {
        let repository = &self.notification_repository;
        if repository.processing_timeout.is_zero() {
            return Err(EventHandlerError::config("processing timeout must be non-zero"));
        }
        if repository.expire_threshold >= repository.processing_timeout {
            return Err(EventHandlerError::config(format!(
                "expire threshold {:?} must be smaller than processing timeout {:?}",
                repository.expire_threshold, repository.processing_timeout
            )));
        }
        if self.notification_processor.process_timeout.is_zero() {
            return Err(EventHandlerError::config("process timeout must be non-zero"));
        }
        if self.dispatcher.resolution_timeout.is_zero() {
            return Err(EventHandlerError::config("resolution timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Comma separated names; blank input enables nothing.
fn parse_entity_names(raw: &str) -> Option<HashSet<String>> {
    let names: HashSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    (!names.is_empty()).then_some(names)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_millis)
}
