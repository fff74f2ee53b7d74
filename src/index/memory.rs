use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{IndexSink, IndexedEntry};
use crate::error::Result;

/// Keeps documents in memory, keyed like the remote index. Backs dry runs.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: Mutex<BTreeMap<String, IndexedEntry>>,
    deliveries: AtomicUsize,
    provisions: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts received, duplicates included.
    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    /// Documents ordered by key.
    pub async fn documents(&self) -> Vec<IndexedEntry> {
        self.docs.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl IndexSink for MemoryIndex {
    async fn provision(&self) -> Result<()> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, entry: &IndexedEntry) -> Result<()> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        debug!(
            key = %entry.key,
            severity = %entry.severity,
            file = %entry.file_name,
            "{}",
            entry.message
        );
        self.docs
            .lock()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }
}
