use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::Options;
use crate::config::Config;
use crate::index::{ElasticIndex, IndexSink, MemoryIndex, ProvisionPolicy};
use crate::offsets::{JsonOffsetStore, MemoryOffsetStore, OffsetStore};
use crate::pipeline::Pipeline;
use crate::scanner::FileScanner;

/// Application runtime: wires config, progress store, index, and the
/// ingestion loop, then waits for a shutdown signal.
pub async fn run(options: Options) -> Result<()> {
    let config = Config::load(&options.config)
        .with_context(|| format!("Cannot load config {}", options.config.display()))?;

    let sink: Arc<dyn IndexSink> = if options.dry_run {
        info!("Dry run, entries and progress are kept in memory");
        Arc::new(MemoryIndex::new())
    } else {
        Arc::new(
            ElasticIndex::connect(&config.index_config, ProvisionPolicy::default())
                .await
                .context("Cannot open log index")?,
        )
    };
    sink.provision().await.context("Cannot provision log index")?;

    let store: Box<dyn OffsetStore> = if options.dry_run {
        Box::new(MemoryOffsetStore::new())
    } else {
        // Lock acquisition polls with a blocking sleep.
        let path = options.offsets.clone();
        let store = tokio::task::spawn_blocking(move || JsonOffsetStore::open(path))
            .await
            .context("Progress store task failed")?
            .with_context(|| format!("Cannot open progress store {}", options.offsets.display()))?;
        Box::new(store)
    };

    let handler = &config.handler_config;
    let scanner = FileScanner::new(&handler.directory, handler.file_regex()?);
    let mut pipeline = Pipeline::new(scanner, store, sink)
        .with_interval(options.interval)
        .with_checkpoint_entries(handler.checkpoint_entries);

    let cancel = CancellationToken::new();
    let worker = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run(cancel).await })
    };

    wait_for_signal().await?;
    info!("Shutting down");
    cancel.cancel();

    // Dropping the pipeline with the worker closes the progress store.
    worker.await.context("Ingestion worker failed")?;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sig_term = signal(SignalKind::terminate()).context("Cannot listen for SIGTERM")?;
    let mut sig_int = signal(SignalKind::interrupt()).context("Cannot listen for SIGINT")?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}
