//! Multi-line entry parser.
//!
//! Turns the physical lines of a log file into logical entries. A header line
//! like `E0124 16:53:43.847231 1 server.go:147] message` starts an entry; any
//! other line continues the message of the current one. The parser is pulled
//! by the caller one entry at a time and reports how many bytes the entries
//! it has handed out covered, so a later pass can resume right after them.

use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::log::{Line, LineReader, LogFile};

static HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([IWEF])([0-9]{4}\s+[0-9:.]+)\s+(\w+)\s+([\w.\-]+:[0-9]+)\]\s(.*)$")
        .expect("Invalid entry header regex")
});

const ENTRY_TIMESTAMP_FORMAT: &str = "%Y%m%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// Maps a header letter; anything unknown is treated as info.
    pub fn from_letter(letter: &str) -> Self {
        match letter {
            "W" => Severity::Warning,
            "E" => Severity::Error,
            "F" => Severity::Fatal,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical log record, possibly spanning several physical lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
    pub entry_point: String,
    pub message_lines: Vec<String>,
    pub file: Arc<LogFile>,
    /// Raw bytes of the stream this entry covers.
    pub bytes: u64,
}

impl ParsedEntry {
    /// The accumulator a pass starts with, before any header is seen.
    fn initial(file: Arc<LogFile>) -> Self {
        Self {
            severity: Severity::Info,
            timestamp: file.reference_date,
            thread_id: String::new(),
            entry_point: String::new(),
            message_lines: Vec::new(),
            file,
            bytes: 0,
        }
    }

    /// Entries without message lines carry nothing worth delivering.
    pub fn is_empty(&self) -> bool {
        self.message_lines.is_empty()
    }

    pub fn message(&self) -> String {
        self.message_lines.join("\n")
    }
}

/// Result of feeding one line to the current accumulator.
#[derive(Debug)]
pub enum Step {
    Continue(ParsedEntry),
    Emit {
        finished: ParsedEntry,
        next: ParsedEntry,
    },
}

/// Applies one physical line to the current entry.
///
/// `continues_previous` is set when the previous line was cut at the buffer
/// limit; the chunk is then glued onto the last message line verbatim.
pub fn advance(mut current: ParsedEntry, line: Line, continues_previous: bool) -> Step {
    if continues_previous {
        match current.message_lines.last_mut() {
            Some(last) => last.push_str(&line.text),
            None => current.message_lines.push(line.text),
        }
        current.bytes += line.bytes;
        return Step::Continue(current);
    }

    let Some(caps) = HEADER_REGEX.captures(&line.text) else {
        current.message_lines.push(line.text);
        current.bytes += line.bytes;
        return Step::Continue(current);
    };

    let next = ParsedEntry {
        severity: Severity::from_letter(&caps[1]),
        timestamp: entry_timestamp(current.timestamp, &caps[2]),
        thread_id: caps[3].to_string(),
        entry_point: caps[4].to_string(),
        message_lines: vec![caps[5].to_string()],
        file: current.file.clone(),
        bytes: line.bytes,
    };
    Step::Emit {
        finished: current,
        next,
    }
}

/// Rebuilds a full timestamp from a `MMDD HH:MM:SS.ffffff` header field.
///
/// The year comes from the previous entry. A month earlier than the previous
/// one means the log crossed new year. Unparsable input reuses `prev`.
pub fn entry_timestamp(prev: DateTime<Utc>, raw: &str) -> DateTime<Utc> {
    let parse = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{year}{raw}"), ENTRY_TIMESTAMP_FORMAT)
            .ok()
            .map(|ts| ts.and_utc())
    };
    match parse(prev.year()) {
        Some(ts) if ts.month() < prev.month() => parse(prev.year() + 1).unwrap_or(prev),
        Some(ts) => ts,
        None => prev,
    }
}

/// Pull-based parser over one file's line stream.
pub struct EntryParser<R> {
    lines: LineReader<R>,
    current: Option<ParsedEntry>,
    continues_previous: bool,
    consumed: u64,
    cancel: CancellationToken,
}

impl<R: AsyncBufRead + Unpin> EntryParser<R> {
    pub fn new(lines: LineReader<R>, file: Arc<LogFile>, cancel: CancellationToken) -> Self {
        Self {
            lines,
            current: Some(ParsedEntry::initial(file)),
            continues_previous: false,
            consumed: 0,
            cancel,
        }
    }

    /// Bytes covered by the entries handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Returns the next finalized entry, or `None` once the stream is
    /// exhausted or the parser was cancelled.
    ///
    /// The last entry is returned at end of stream even when it has no
    /// message lines; callers skip those. On cancellation the unfinished
    /// entry is dropped, so its bytes are read again on the next pass.
    pub async fn next_entry(&mut self) -> Result<Option<ParsedEntry>> {
        loop {
            let Some(current) = self.current.take() else {
                return Ok(None);
            };
            if self.cancel.is_cancelled() {
                debug!(
                    file = %current.file.name,
                    consumed = self.consumed,
                    "Parsing stopped"
                );
                return Ok(None);
            }

            let Some(line) = self.lines.next_line().await? else {
                self.consumed += current.bytes;
                return Ok(Some(current));
            };

            let continues = std::mem::replace(&mut self.continues_previous, line.truncated);
            match advance(current, line, continues) {
                Step::Continue(entry) => self.current = Some(entry),
                Step::Emit { finished, next } => {
                    self.current = Some(next);
                    self.consumed += finished.bytes;
                    return Ok(Some(finished));
                }
            }
        }
    }

    /// Drains the parser, keeping only entries with message lines.
    pub async fn collect(mut self) -> Result<(Vec<ParsedEntry>, u64)> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            if !entry.is_empty() {
                entries.push(entry);
            }
        }
        Ok((entries, self.consumed))
    }
}
