//! Tails multi-line application logs, ships each entry to a search index
//! under a content-derived key, and records per-file progress so restarts
//! neither skip nor duplicate what was already shipped.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod offsets;
pub mod parser;
pub mod pipeline;
pub mod retry;
pub mod scanner;
pub mod telemetry;

pub use error::{Error, Result};
