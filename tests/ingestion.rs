use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use logbeat::index::{IndexSink, IndexedEntry, MemoryIndex};
use logbeat::log::{LineReader, LogFile};
use logbeat::offsets::{FileProgress, JsonOffsetStore, OffsetStore};
use logbeat::parser::{EntryParser, Severity};
use logbeat::pipeline::{FileOutcome, Pipeline};
use logbeat::scanner::{Candidate, FileScanner};
use logbeat::{Error, Result};
use pretty_assertions::assert_eq;
use regex::Regex;
use tokio_util::sync::CancellationToken;

const THREE_ENTRIES: &str = "I0101 10:00:00.000000 1 a.go:1] one\n\
                             E0101 10:00:01.000000 1 a.go:2] two\n  trace\n\
                             W0101 10:00:02.000000 1 a.go:3] three\n";

/// Delivers to an in-memory index but fails the n-th upsert.
struct FlakySink {
    inner: Arc<MemoryIndex>,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl IndexSink for FlakySink {
    async fn provision(&self) -> Result<()> {
        self.inner.provision().await
    }

    async fn upsert(&self, entry: &IndexedEntry) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(Error::Provision("index unavailable".to_string()));
        }
        self.inner.upsert(entry).await
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    logs: PathBuf,
    progress: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(logs.join("webui")).unwrap();
        let progress = dir.path().join("metadata").join("metadata.json");
        Self {
            _dir: dir,
            logs,
            progress,
        }
    }

    fn write_log(&self, contents: &str) -> PathBuf {
        let path = self.logs.join("webui").join("host.log.INFO.20190124-164334.1");
        fs::write(&path, contents).unwrap();
        path
    }

    fn pipeline(&self, sink: Arc<dyn IndexSink>) -> Pipeline {
        let scanner = FileScanner::new(&self.logs, Regex::new(r"\.log\.INFO\.").unwrap());
        let store = JsonOffsetStore::open(&self.progress).unwrap();
        Pipeline::new(scanner, Box::new(store), sink)
    }
}

fn candidate(path: &Path) -> Candidate {
    let metadata = fs::metadata(path).unwrap();
    Candidate {
        path: path.to_path_buf(),
        modified: DateTime::<Utc>::from(metadata.modified().unwrap()),
        len: metadata.len(),
    }
}

#[tokio::test]
async fn scenario_a_two_entries_from_three_lines() {
    let fixture = Fixture::new();
    let path = fixture.write_log(
        "I0101 10:00:00.000000 1 a.go:1] hello\n  world\nI0101 10:00:01.000000 1 a.go:2] bye\n",
    );
    let index = Arc::new(MemoryIndex::new());
    let mut pipeline = fixture.pipeline(index.clone());

    let stats = pipeline.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.entries, 2);

    let docs = index.documents().await;
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].severity, Severity::Info);
    assert_eq!(docs[0].message, "hello\n  world");
    assert_eq!(docs[0].container_name, "webui");
    assert_eq!(docs[0].timestamp.year(), 2019);
    assert_eq!((docs[0].timestamp.hour(), docs[0].timestamp.second()), (10, 0));
    assert_eq!(docs[1].message, "bye");
    assert_eq!(docs[1].timestamp.second(), 1);
    assert_eq!(docs[0].file_name, path.to_string_lossy());
}

#[tokio::test]
async fn scenario_b_redelivery_after_crash_collapses_by_key() {
    let fixture = Fixture::new();
    let path = fixture.write_log(THREE_ENTRIES);
    let index = Arc::new(MemoryIndex::new());
    let first_entry_len = "I0101 10:00:00.000000 1 a.go:1] one\n".len() as u64;

    {
        let mut pipeline = fixture.pipeline(index.clone());
        pipeline.run_pass(&CancellationToken::new()).await.unwrap();
    }
    assert_eq!(index.deliveries(), 3);

    // Crash state: entries 1 and 2 delivered, only entry 1 recorded.
    {
        let mut store = JsonOffsetStore::open(&fixture.progress).unwrap();
        store
            .set(FileProgress {
                path: path.clone(),
                last_modified: DateTime::<Utc>::UNIX_EPOCH,
                discard: first_entry_len,
            })
            .await
            .unwrap();
    }

    let mut pipeline = fixture.pipeline(index.clone());
    let outcome = pipeline
        .process_file(&candidate(&path), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, FileOutcome::Processed { entries: 2, .. }));
    assert_eq!(index.deliveries(), 5);
    assert_eq!(index.len().await, 3);
    let progress = pipeline.store().get(&path).unwrap();
    assert_eq!(progress.discard, THREE_ENTRIES.len() as u64);
}

#[tokio::test]
async fn failed_delivery_keeps_offset_before_the_failed_entry() {
    let fixture = Fixture::new();
    let path = fixture.write_log(THREE_ENTRIES);
    let index = Arc::new(MemoryIndex::new());

    {
        let flaky = Arc::new(FlakySink {
            inner: index.clone(),
            fail_on: 3,
            calls: AtomicUsize::new(0),
        });
        let mut pipeline = fixture.pipeline(flaky);
        let stats = pipeline.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.files_failed, 1);
    }

    let two_entries = THREE_ENTRIES.find("W0101").unwrap() as u64;
    {
        let store = JsonOffsetStore::open(&fixture.progress).unwrap();
        let progress = store.get(&path).unwrap();
        assert_eq!(progress.discard, two_entries);
        assert_eq!(progress.last_modified, DateTime::<Utc>::UNIX_EPOCH);
    }

    let mut pipeline = fixture.pipeline(index.clone());
    pipeline.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(index.deliveries(), 3);
    let messages: Vec<_> = index.documents().await.into_iter().map(|d| d.message).collect();
    assert_eq!(messages, vec!["one", "two\n  trace", "three"]);
}

#[tokio::test]
async fn scenario_c_year_rollover_and_bad_timestamp() {
    let fixture = Fixture::new();
    fixture.write_log(
        "I1231 23:59:59.000000 1 a.go:1] old year\n\
         I0101 00:00:01.000000 1 a.go:2] new year\n\
         E1340 25:61:00.000000 1 a.go:3] broken clock\n",
    );
    let index = Arc::new(MemoryIndex::new());
    let mut pipeline = fixture.pipeline(index.clone());
    let stats = pipeline.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.files_failed, 0);

    let mut docs = index.documents().await;
    docs.sort_by(|a, b| a.entry_point.cmp(&b.entry_point));
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0].timestamp.year(), 2019);
    assert_eq!(docs[1].timestamp.year(), 2020);
    assert_eq!(docs[2].timestamp, docs[1].timestamp);
    assert_eq!(docs[2].severity, Severity::Error);
}

#[tokio::test]
async fn unchanged_file_causes_no_writes_or_deliveries() {
    let fixture = Fixture::new();
    fixture.write_log(THREE_ENTRIES);
    let index = Arc::new(MemoryIndex::new());
    let mut pipeline = fixture.pipeline(index.clone());
    let cancel = CancellationToken::new();

    pipeline.run_pass(&cancel).await.unwrap();
    let before = fs::read(&fixture.progress).unwrap();
    let modified_before = fs::metadata(&fixture.progress).unwrap().modified().unwrap();

    let stats = pipeline.run_pass(&cancel).await.unwrap();
    assert_eq!(stats.files_processed, 0);
    assert_eq!(index.deliveries(), 3);
    assert_eq!(fs::read(&fixture.progress).unwrap(), before);
    assert_eq!(
        fs::metadata(&fixture.progress).unwrap().modified().unwrap(),
        modified_before
    );
}

#[tokio::test]
async fn progress_survives_restart() {
    let fixture = Fixture::new();
    let path = fixture.write_log(THREE_ENTRIES);
    let index = Arc::new(MemoryIndex::new());

    {
        let mut pipeline = fixture.pipeline(index.clone());
        pipeline.run_pass(&CancellationToken::new()).await.unwrap();
    }

    let mut pipeline = fixture.pipeline(index.clone());
    let outcome = pipeline
        .process_file(&candidate(&path), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, FileOutcome::Unchanged);
    assert_eq!(index.deliveries(), 3);
}

#[tokio::test]
async fn resuming_at_any_entry_boundary_is_exact() {
    let input = "I0101 10:00:00.000000 1 a.go:1] a\n  a2\n\
                 W0102 11:00:00.000000 1 a.go:2] b\n\
                 E0103 12:00:00.000000 1 a.go:3] c\n  c2\n  c3\n\
                 I0104 13:00:00.000000 1 a.go:4] d\n";
    let file = Arc::new(LogFile::from_path("/logs/webui/host.log.INFO.20190124-164334.1"));

    let parse = |bytes: &'static [u8]| {
        let file = file.clone();
        async move {
            EntryParser::new(LineReader::new(bytes), file, CancellationToken::new())
                .collect()
                .await
                .unwrap()
        }
    };
    let (whole, total) = parse(input.as_bytes()).await;
    assert_eq!(whole.len(), 4);
    assert_eq!(total, input.len() as u64);

    let boundaries: Vec<usize> = input.match_indices('\n').map(|(i, _)| i + 1).collect();
    for split in boundaries {
        if !input[split..].is_empty() && !input[split..].starts_with(['I', 'W', 'E']) {
            continue;
        }
        let (head, head_bytes) = parse(&input.as_bytes()[..split]).await;
        assert_eq!(head_bytes, split as u64);
        let (tail, tail_bytes) = parse(&input.as_bytes()[split..]).await;
        assert_eq!(head_bytes + tail_bytes, total);

        let joined: Vec<_> = head.iter().chain(tail.iter()).map(|e| e.message()).collect();
        let expected: Vec<_> = whole.iter().map(|e| e.message()).collect();
        assert_eq!(joined, expected, "split at byte {split}");
    }
}

#[tokio::test]
async fn provisioning_a_memory_index_is_idempotent() {
    let index = MemoryIndex::new();
    index.provision().await.unwrap();
    index.provision().await.unwrap();
    assert_eq!(index.provisions(), 2);
    assert!(index.is_empty().await);
}

#[tokio::test]
async fn dangling_symlink_does_not_block_shipping() {
    let fixture = Fixture::new();
    fixture.write_log(THREE_ENTRIES);
    let webui = fixture.logs.join("webui");
    std::os::unix::fs::symlink(
        webui.join("host.log.INFO.20190101-000000.1"),
        webui.join("app.INFO"),
    )
    .unwrap();

    let index = Arc::new(MemoryIndex::new());
    let mut pipeline = fixture.pipeline(index.clone());
    let stats = pipeline.run_pass(&CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_processed, 1);
    assert_eq!(index.deliveries(), 3);
}
