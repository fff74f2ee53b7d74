//! Log source layer: identifies a tailed file and streams its physical lines.
//!
//! Lines are read with a bounded buffer. A line longer than the buffer is
//! handed out in chunks, every chunk except the last flagged as `truncated`,
//! so the entry parser can glue them back together instead of mistaking the
//! tail of a long line for a new header.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};

/// Largest physical line the reader hands out in one piece.
pub const MAX_LINE_BYTES: usize = 4096;

/// Matches paths like `/logs/webui/fffa108f2364.log.WARNING.20190124-164334.1`.
static FILE_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*/(\w+)/[\w.\-]+\.log\.\w+\.([0-9]{8}-[0-9]{6}).*")
        .expect("Invalid file path regex")
});

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A source file being tailed during one parse pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub name: String,
    /// Component that produced the file, taken from the parent directory name.
    pub origin: Option<String>,
    /// Seed date for entries whose headers carry no year.
    pub reference_date: DateTime<Utc>,
}

impl LogFile {
    /// Builds the file descriptor from the path convention, falling back to
    /// the current time and no origin when the path doesn't follow it.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        let mut file = Self {
            path: path.to_path_buf(),
            name,
            origin: None,
            reference_date: Utc::now(),
        };
        if let Some(caps) = FILE_PATH_REGEX.captures(&file.name) {
            file.origin = Some(caps[1].to_string());
            if let Ok(date) = NaiveDateTime::parse_from_str(&caps[2], FILE_TIMESTAMP_FORMAT) {
                file.reference_date = date.and_utc();
            }
        }
        file
    }

    pub fn with_reference_date(mut self, date: DateTime<Utc>) -> Self {
        self.reference_date = date;
        self
    }
}

/// One physical line (or a chunk of an over-long one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    /// Bytes consumed from the stream for this line, terminator included.
    pub bytes: u64,
    /// The line did not fit in the buffer; the next line continues it.
    pub truncated: bool,
}

/// Reads physical lines from a buffered async stream.
pub struct LineReader<R> {
    reader: R,
    max_len: usize,
    /// Bytes already consumed that belong to the next chunk of a long line.
    carry: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_LINE_BYTES)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            max_len: max_len.max(1),
            carry: Vec::new(),
        }
    }

    /// Returns the next line, or `None` at end of stream. A trailing line
    /// without a newline is still returned.
    ///
    /// A line longer than the buffer is split before an incomplete UTF-8
    /// sequence or a trailing `\r`, so every chunk decodes on its own and a
    /// `\r\n` terminator is never separated.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        let mut buf = std::mem::take(&mut self.carry);
        let mut consumed = buf.len() as u64;

        loop {
            let (used, newline) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(finish_line(buf, consumed, false)));
                }
                let room = self.max_len - buf.len();
                let window = &available[..available.len().min(room)];
                match window.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        buf.extend_from_slice(&window[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        buf.extend_from_slice(window);
                        (window.len(), false)
                    }
                }
            };
            self.reader.consume(used);
            consumed += used as u64;

            if newline {
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
                return Ok(Some(finish_line(buf, consumed, false)));
            }
            if buf.len() >= self.max_len {
                let split = chunk_boundary(&buf);
                self.carry = buf.split_off(split);
                consumed -= self.carry.len() as u64;
                return Ok(Some(finish_line(buf, consumed, true)));
            }
        }
    }
}

/// Where to cut a full buffer: before a trailing incomplete UTF-8 sequence
/// and before a trailing `\r`. Falls back to the whole buffer when the cut
/// would leave nothing.
fn chunk_boundary(buf: &[u8]) -> usize {
    let mut split = buf.len();
    let tail_start = buf.len().saturating_sub(3);
    if let Some(lead) = (tail_start..buf.len()).rev().find(|&i| buf[i] & 0xC0 != 0x80) {
        let width = match buf[lead] {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        if buf.len() - lead < width {
            split = lead;
        }
    }
    if split > 0 && buf[split - 1] == b'\r' {
        split -= 1;
    }
    if split == 0 { buf.len() } else { split }
}

fn finish_line(buf: Vec<u8>, bytes: u64, truncated: bool) -> Line {
    let text = match String::from_utf8(buf) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    Line {
        text,
        bytes,
        truncated,
    }
}

/// A file opened for reading from a previously shipped offset.
pub struct FileTail {
    pub path: PathBuf,
    pub offset: u64,
}

impl FileTail {
    pub async fn open(self) -> io::Result<LineReader<BufReader<File>>> {
        let mut file = File::open(&self.path).await?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset)).await?;
        }
        Ok(LineReader::new(BufReader::new(file)))
    }
}
