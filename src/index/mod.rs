//! Index sink: the remote searchable store entries are shipped to.
//!
//! Entries are upserted by a key derived from their timestamp and message,
//! so delivering the same entry twice leaves a single document behind.

mod elastic;
mod memory;

pub use elastic::ElasticIndex;
pub use memory::MemoryIndex;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::parser::{ParsedEntry, Severity};
use crate::retry::RetryPolicy;

/// Mapping type documents are stored under.
pub const DOC_TYPE: &str = "log";

/// Document shape stored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedEntry {
    pub key: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub entry_point: String,
    pub file_name: String,
    pub container_name: String,
    pub message: String,
}

impl IndexedEntry {
    pub fn from_parsed(entry: &ParsedEntry) -> Self {
        let message = entry.message();
        Self {
            key: dedup_key(entry.timestamp, &message),
            severity: entry.severity,
            timestamp: entry.timestamp,
            entry_point: entry.entry_point.clone(),
            file_name: entry.file.name.clone(),
            container_name: entry.file.origin.clone().unwrap_or_default(),
            message,
        }
    }
}

/// `<UTC timestamp, nanosecond precision>/<FNV-1a 32 of the message>`
pub fn dedup_key(timestamp: DateTime<Utc>, message: &str) -> String {
    format!(
        "{}/{}",
        timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        fnv1a_32(message.as_bytes())
    )
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Ensures the index exists with the expected schema. Safe to call on
    /// every start.
    async fn provision(&self) -> Result<()>;

    /// Writes the entry under its key, replacing any previous version.
    async fn upsert(&self, entry: &IndexedEntry) -> Result<()>;
}

/// Administrative calls the provisioning protocol is built from.
#[async_trait]
pub trait IndexAdmin: Send + Sync {
    async fn exists(&self) -> Result<bool>;
    async fn create(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn open(&self) -> Result<()>;
    async fn put_settings(&self, settings: &Value) -> Result<()>;
    async fn put_mapping(&self, mapping: &Value) -> Result<()>;
}

/// Retry budgets used while provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionPolicy {
    /// Existence check on startup; the store may still be coming up.
    pub startup: RetryPolicy,
    /// Closing the index before schema changes.
    pub close: RetryPolicy,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            startup: RetryPolicy::new(10, Duration::from_secs(10)),
            close: RetryPolicy::new(10, Duration::from_secs(1)),
        }
    }
}

/// Analysis settings: a lowercasing keyword analyzer for exact-match fields.
pub fn index_settings() -> Value {
    json!({
        "analysis": {
            "analyzer": {
                "analyzer_keyword": {
                    "tokenizer": "keyword",
                    "filter": "lowercase"
                }
            }
        }
    })
}

pub fn index_mapping() -> Value {
    json!({
        "_all": { "enabled": false },
        "properties": {
            "key": { "type": "keyword" },
            "severity": { "type": "text", "analyzer": "analyzer_keyword" },
            "timestamp": { "type": "date" },
            "entryPoint": { "type": "text" },
            "fileName": { "type": "text" },
            "containerName": { "type": "text" },
            "message": { "type": "text" }
        }
    })
}

/// Creates the index if it is missing, then applies settings and mapping
/// while the index is closed.
pub async fn provision<A: IndexAdmin + ?Sized>(admin: &A, policy: &ProvisionPolicy) -> Result<()> {
    let exists = policy
        .startup
        .run("Index existence check", || admin.exists())
        .await?;
    if !exists {
        info!("Creating index");
        admin
            .create()
            .await
            .map_err(|e| Error::Provision(format!("failed to create index: {e}")))?;
    }

    with_suspended_index(admin, &policy.close, async {
        admin.put_settings(&index_settings()).await?;
        admin.put_mapping(&index_mapping()).await
    })
    .await
}

/// Closes the index, runs `mutate`, and reopens the index whether or not
/// `mutate` succeeded.
async fn with_suspended_index<A, F>(admin: &A, close: &RetryPolicy, mutate: F) -> Result<()>
where
    A: IndexAdmin + ?Sized,
    F: std::future::Future<Output = Result<()>>,
{
    close
        .run("Closing index", || admin.close())
        .await
        .map_err(|e| Error::Provision(format!("failed to close index: {e}")))?;

    let mutated = mutate.await;
    let reopened = admin.open().await;

    match (mutated, reopened) {
        (Err(e), Err(open_err)) => {
            warn!(error = %open_err, "Failed to reopen index after failed update");
            Err(Error::Provision(format!("failed to update index: {e}")))
        }
        (Err(e), Ok(())) => Err(Error::Provision(format!("failed to update index: {e}"))),
        (Ok(()), Err(e)) => Err(Error::Provision(format!("failed to open index: {e}"))),
        (Ok(()), Ok(())) => Ok(()),
    }
}
