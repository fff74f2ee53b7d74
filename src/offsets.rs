//! Durable per-file read progress.
//!
//! The store maps a file path to the last modification time seen and the
//! number of bytes already shipped. Every write reaches disk before `set`
//! returns: a lost write may only cause bytes to be shipped twice, never
//! skipped.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const BUCKET: &str = "metadata";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default time to wait for another process to release the store.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
    /// Bytes from the start of the file already shipped.
    pub discard: u64,
}

#[async_trait]
pub trait OffsetStore: Send {
    /// Fails with [`Error::NotFound`] when the path has never been recorded.
    fn get(&self, path: &Path) -> Result<FileProgress>;

    /// Overwrites the record for `progress.path`, durably. On failure the
    /// previous record stays visible to `get`.
    async fn set(&mut self, progress: FileProgress) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    buckets: BTreeMap<String, BTreeMap<String, FileProgress>>,
}

/// Progress store backed by a single JSON file, held under an exclusive
/// lock for as long as the store is open.
#[derive(Debug)]
pub struct JsonOffsetStore {
    path: PathBuf,
    document: Document,
    lock: File,
    lock_path: PathBuf,
}

impl JsonOffsetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Opens or creates the store. Fails with [`Error::Locked`] if another
    /// process keeps it locked past `timeout`.
    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&path);
        let lock = acquire_lock(&path, &lock_path, timeout)?;

        let document = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            Document::default()
        };

        let records = document.buckets.get(BUCKET).map_or(0, |b| b.len());
        info!(path = %path.display(), records, "Opened progress store");

        Ok(Self {
            path,
            document,
            lock,
            lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bucket(&self) -> Option<&BTreeMap<String, FileProgress>> {
        self.document.buckets.get(BUCKET)
    }
}

#[async_trait]
impl OffsetStore for JsonOffsetStore {
    fn get(&self, path: &Path) -> Result<FileProgress> {
        self.bucket()
            .and_then(|b| b.get(&key_for(path)))
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    async fn set(&mut self, progress: FileProgress) -> Result<()> {
        let mut document = self.document.clone();
        document
            .buckets
            .entry(BUCKET.to_string())
            .or_default()
            .insert(key_for(&progress.path), progress);

        let path = self.path.clone();
        let document = tokio::task::spawn_blocking(move || {
            atomic_write(&path, &document).map(|()| document)
        })
        .await??;
        self.document = document;
        Ok(())
    }
}

impl Drop for JsonOffsetStore {
    fn drop(&mut self) {
        debug!("Releasing progress store lock: {}", self.lock_path.display());
        if let Err(e) = FileExt::unlock(&self.lock) {
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
    }
}

/// In-memory store, used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    records: HashMap<PathBuf, FileProgress>,
    writes: usize,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    fn get(&self, path: &Path) -> Result<FileProgress> {
        self.records
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    async fn set(&mut self, progress: FileProgress) -> Result<()> {
        self.writes += 1;
        self.records.insert(progress.path.clone(), progress);
        Ok(())
    }
}

fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `/metadata/metadata.json` -> `/metadata/metadata.json.lock`
fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

fn acquire_lock(path: &Path, lock_path: &Path, timeout: Duration) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Acquired progress store lock: {}", lock_path.display());
                return Ok(file);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::Locked(path.to_path_buf()));
                }
                thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Writes to a temp file, syncs it, renames it over the store, then syncs
/// the directory so the rename itself is durable.
fn atomic_write(path: &Path, document: &Document) -> Result<()> {
    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, document)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            warn!("Failed to remove {}: {}", temp_path.display(), cleanup);
        }
        return Err(e.into());
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}
