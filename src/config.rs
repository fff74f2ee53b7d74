//! Configuration document loaded once at startup.
//!
//! ```json
//! {
//!   "indexConfig": { "index": "logging", "sniff": false, "urls": ["http://elasticsearch:9200"] },
//!   "handlerConfig": { "filePattern": "\\.log\\.INFO\\.", "directory": "/logs" }
//! }
//! ```
//!
//! Every field is optional. Empty strings and lists count as missing.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_INDEX: &str = "logging";
pub const DEFAULT_INDEX_URL: &str = "http://elasticsearch:9200";
pub const DEFAULT_FILE_PATTERN: &str = r"\.log\.INFO\.";
pub const DEFAULT_DIRECTORY: &str = "/logs";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub index_config: IndexConfig,
    pub handler_config: HandlerConfig,
}

/// Where entries are shipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexConfig {
    pub index: String,
    /// Discover the cluster's nodes instead of only using `urls`.
    pub sniff: bool,
    pub urls: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index: DEFAULT_INDEX.to_string(),
            sniff: false,
            urls: vec![DEFAULT_INDEX_URL.to_string()],
        }
    }
}

/// Which files are tailed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerConfig {
    /// Regex matched against the full path of each file under `directory`.
    pub file_pattern: String,
    pub directory: PathBuf,
    /// Entries delivered between intermediate progress writes; 0 writes
    /// progress only once a file is done.
    pub checkpoint_entries: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            checkpoint_entries: 1,
        }
    }
}

impl HandlerConfig {
    pub fn file_regex(&self) -> Result<Regex> {
        Ok(Regex::new(&self.file_pattern)?)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.fill_defaults();
        config.handler_config.file_regex()?;
        Ok(config)
    }

    fn fill_defaults(&mut self) {
        let index = &mut self.index_config;
        if index.index.is_empty() {
            index.index = DEFAULT_INDEX.to_string();
        }
        if index.urls.is_empty() {
            index.urls = vec![DEFAULT_INDEX_URL.to_string()];
        }
        let handler = &mut self.handler_config;
        if handler.file_pattern.is_empty() {
            handler.file_pattern = DEFAULT_FILE_PATTERN.to_string();
        }
        if handler.directory.as_os_str().is_empty() {
            handler.directory = PathBuf::from(DEFAULT_DIRECTORY);
        }
    }
}
