//! Document events: units of work asking for a document to be (re)built.
//!
//! A [`DocumentEvent`] names a resource [`Identity`] whose current state
//! should be resolved and delivered downstream. Events are created by
//! notification expansion, persisted, and later claimed in priority order as
//! [`ReadyDocumentEvent`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deferred::Deferred;
use crate::error::EventHandlerError;
use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "document_event_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum DocumentEventStatus {
    #[default]
    Pending,
    Processing,
    Processed,
}

impl DocumentEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentEventStatus::Pending => "pending",
            DocumentEventStatus::Processing => "processing",
            DocumentEventStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for DocumentEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to resolve the current document for `identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub id: Uuid,
    pub identity: Identity,
    /// Higher values are claimed first.
    pub priority: i32,
    pub status: DocumentEventStatus,
    pub creation_date: DateTime<Utc>,
    pub processing_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl DocumentEvent {
    pub fn new(identity: Identity, priority: i32, creation_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            priority,
            status: DocumentEventStatus::Pending,
            creation_date,
            processing_date: None,
            processed_date: None,
        }
    }

    /// Type tag selecting the [`DocumentLookup`].
    pub fn resource_type(&self) -> &str {
        self.identity.resource_type()
    }
}

/// A resolved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub identity: Identity,
    pub body: serde_json::Value,
}

/// Resolves the current document for an identity.
///
/// Returning a pending [`Deferred`] lets the dispatcher start every lookup in
/// a batch before waiting on any.
pub trait DocumentLookup: Send + Sync {
    fn lookup_document(&self, identity: &Identity) -> Result<Deferred<serde_json::Value>>;
}

/// Registry of document lookups keyed by resource type.
#[derive(Default, Clone)]
pub struct DocumentLookups {
    lookups: HashMap<String, Arc<dyn DocumentLookup>>,
}

impl DocumentLookups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the lookup for a resource type.
    ///
    /// # Panics
    ///
    /// Panics if a lookup is already registered for this resource type.
    pub fn register<L>(&mut self, resource_type: impl Into<String>, lookup: L)
    where
        L: DocumentLookup + 'static,
    {
        let resource_type = resource_type.into();
        if self.lookups.contains_key(&resource_type) {
            panic!("document lookup already registered for type: {}", resource_type);
        }
        self.lookups.insert(resource_type, Arc::new(lookup));
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn DocumentLookup>> {
        self.lookups.get(resource_type).cloned()
    }

    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.lookups.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }
}

impl fmt::Debug for DocumentLookups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentLookups")
            .field("resource_types", &self.resource_types())
            .finish()
    }
}

/// A claimed document event together with the lookup that can resolve it.
#[derive(Clone)]
pub struct ReadyDocumentEvent {
    event: DocumentEvent,
    lookup: Option<Arc<dyn DocumentLookup>>,
}

impl ReadyDocumentEvent {
    pub fn new(event: DocumentEvent, lookup: Option<Arc<dyn DocumentLookup>>) -> Self {
        Self { event, lookup }
    }

    pub fn event(&self) -> &DocumentEvent {
        &self.event
    }

    pub fn into_event(self) -> DocumentEvent {
        self.event
    }

    /// Start resolving the document. Unknown resource types settle as
    /// [`EventHandlerError::UnknownDocumentType`].
    pub fn lookup_document(&self) -> Result<Deferred<serde_json::Value>> {
        match &self.lookup {
            Some(lookup) => lookup.lookup_document(&self.event.identity),
            None => Ok(Deferred::failed(EventHandlerError::UnknownDocumentType {
                resource_type: self.event.resource_type().to_string(),
            })),
        }
    }
}

impl fmt::Debug for ReadyDocumentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyDocumentEvent")
            .field("event", &self.event)
            .field("has_lookup", &self.lookup.is_some())
            .finish()
    }
}

/// Outcome of resolving one ready document event, handed to the sink.
#[derive(Debug)]
pub struct Resolution {
    pub event: DocumentEvent,
    pub outcome: Result<Document>,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_ok()
    }
}
