//! Ingestion loop: scan, parse, deliver, record progress.
//!
//! Within a file, an entry is always delivered before the offset covering it
//! is written, so a crash between the two only causes a re-delivery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::index::{IndexSink, IndexedEntry};
use crate::log::{FileTail, LineReader, LogFile};
use crate::offsets::{FileProgress, OffsetStore};
use crate::parser::EntryParser;
use crate::scanner::{Candidate, FileScanner};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What a single file pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Not modified since the recorded pass.
    Unchanged,
    /// Read to the end; `offset` is the new discard offset.
    Processed { entries: usize, offset: u64 },
    /// Cancelled part way; progress up to `offset` was recorded.
    Stopped { entries: usize, offset: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub files_seen: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub entries: usize,
}

pub struct Pipeline {
    scanner: FileScanner,
    store: Box<dyn OffsetStore>,
    sink: Arc<dyn IndexSink>,
    interval: Duration,
    checkpoint_entries: usize,
}

impl Pipeline {
    pub fn new(scanner: FileScanner, store: Box<dyn OffsetStore>, sink: Arc<dyn IndexSink>) -> Self {
        Self {
            scanner,
            store,
            sink,
            interval: DEFAULT_POLL_INTERVAL,
            checkpoint_entries: 1,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Record progress every `entries` delivered entries; 0 records only
    /// once per file.
    pub fn with_checkpoint_entries(mut self, entries: usize) -> Self {
        self.checkpoint_entries = entries;
        self
    }

    pub fn store(&self) -> &dyn OffsetStore {
        self.store.as_ref()
    }

    /// Runs passes until `cancel` fires, sleeping `interval` between them.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            directory = %self.scanner.root().display(),
            pattern = %self.scanner.pattern(),
            "Watching directory for log files"
        );

        while !cancel.is_cancelled() {
            match self.run_pass(&cancel).await {
                Ok(stats) if stats.files_processed > 0 || stats.files_failed > 0 => info!(
                    processed = stats.files_processed,
                    failed = stats.files_failed,
                    entries = stats.entries,
                    "Pass finished"
                ),
                Ok(stats) => debug!(files = stats.files_seen, "Pass finished, nothing changed"),
                Err(e) => warn!(error = %e, "Pass aborted"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Pipeline stopped");
    }

    /// One walk over the directory. A failing file is logged and skipped;
    /// only a failed scan fails the pass.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassStats> {
        let scanner = self.scanner.clone();
        let candidates = tokio::task::spawn_blocking(move || scanner.scan()).await??;
        let mut stats = PassStats::default();

        for candidate in &candidates {
            if cancel.is_cancelled() {
                break;
            }
            stats.files_seen += 1;
            match self.process_file(candidate, cancel).await {
                Ok(FileOutcome::Unchanged) => {}
                Ok(FileOutcome::Processed { entries, .. }) | Ok(FileOutcome::Stopped { entries, .. }) => {
                    stats.files_processed += 1;
                    stats.entries += entries;
                }
                Err(e) => {
                    stats.files_failed += 1;
                    warn!(path = %candidate.path.display(), error = %e, "Failed to process file");
                }
            }
        }

        Ok(stats)
    }

    /// Ships whatever the file gained since its recorded offset.
    pub async fn process_file(
        &mut self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let previous = match self.store.get(&candidate.path) {
            Ok(progress) => Some(progress),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if !candidate.is_changed(previous.as_ref()) {
            return Ok(FileOutcome::Unchanged);
        }

        // Intermediate records keep the previous modification time, so a
        // file interrupted part way still counts as changed on the next pass.
        let resume_modified = previous
            .as_ref()
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |p| p.last_modified);
        let mut start = previous.as_ref().map_or(0, |p| p.discard);
        if candidate.len < start {
            warn!(
                path = %candidate.path.display(),
                previous_offset = start,
                current_size = candidate.len,
                "File shrank, reading it again from the start"
            );
            start = 0;
        }

        info!(path = %candidate.path.display(), offset = start, "Handling file");

        let lines = FileTail {
            path: candidate.path.clone(),
            offset: start,
        }
        .open()
        .await?;
        self.ship(candidate, lines, start, resume_modified, cancel).await
    }

    /// Delivers every entry read from `lines`, which starts `start` bytes
    /// into the file, recording progress as it goes.
    async fn ship<R: AsyncBufRead + Unpin + Send>(
        &mut self,
        candidate: &Candidate,
        lines: LineReader<R>,
        start: u64,
        resume_modified: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let file = Arc::new(LogFile::from_path(&candidate.path));
        let mut parser = EntryParser::new(lines, file, cancel.clone());

        let mut shipped = start;
        let mut entries = 0;
        let mut pending = 0;
        loop {
            let entry = match parser.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    self.save_partial(&candidate.path, resume_modified, start, shipped)
                        .await;
                    return Err(e);
                }
            };

            if !entry.is_empty() {
                if let Err(e) = self.sink.upsert(&IndexedEntry::from_parsed(&entry)).await {
                    self.save_partial(&candidate.path, resume_modified, start, shipped)
                        .await;
                    return Err(e);
                }
                entries += 1;
                pending += 1;
            }
            shipped = start + parser.consumed();

            if self.checkpoint_entries > 0 && pending >= self.checkpoint_entries {
                self.save(&candidate.path, resume_modified, shipped).await?;
                pending = 0;
            }
        }

        if cancel.is_cancelled() {
            self.save(&candidate.path, resume_modified, shipped).await?;
            info!(path = %candidate.path.display(), offset = shipped, "Stopped part way through file");
            return Ok(FileOutcome::Stopped {
                entries,
                offset: shipped,
            });
        }

        self.save(&candidate.path, candidate.modified, shipped).await?;
        debug!(path = %candidate.path.display(), entries, offset = shipped, "File handled");
        Ok(FileOutcome::Processed {
            entries,
            offset: shipped,
        })
    }

    async fn save(&mut self, path: &Path, last_modified: DateTime<Utc>, discard: u64) -> Result<()> {
        self.store.set(FileProgress {
            path: path.to_path_buf(),
            last_modified,
            discard,
        })
        .await
    }

    /// Records progress for entries delivered before a failure.
    async fn save_partial(&mut self, path: &Path, last_modified: DateTime<Utc>, start: u64, shipped: u64) {
        if shipped == start {
            return;
        }
        if let Err(e) = self.save(path, last_modified, shipped).await {
            warn!(path = %path.display(), error = %e, "Failed to record partial progress");
        }
    }
}
