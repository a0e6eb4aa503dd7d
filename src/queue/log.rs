//! Newline-delimited JSON codec for the queue log and the dead-letter log.
//!
//! The queue log starts with a header line carrying its compaction
//! generation, followed by one line per enqueued job. Lines are only ever
//! appended, or the whole file is rewritten atomically by compaction.

use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};
use crate::model::Job;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum LogLine {
    Header { generation: u64 },
    Job(Job),
}

pub(crate) fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// A job line located in the log file. `len` includes the newline.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub offset: u64,
    pub len: u64,
    pub job: Job,
}

/// A line that could not be decoded.
#[derive(Debug, Clone)]
pub(crate) struct CorruptLine {
    pub offset: u64,
    pub reason: String,
    pub raw: Vec<u8>,
}

/// Result of replaying a log from the start.
#[derive(Debug, Default)]
pub(crate) struct LogScan {
    pub generation: Option<u64>,
    pub entries: Vec<LogEntry>,
    pub corrupt: Vec<CorruptLine>,
    /// Length of the prefix made of complete lines.
    pub valid_len: u64,
    /// A trailing partial line exists past `valid_len`.
    pub torn_tail: bool,
}

pub(crate) fn scan(bytes: &[u8]) -> LogScan {
    let mut out = LogScan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let Some(nl) = bytes[pos..].iter().position(|b| *b == b'\n') else {
            out.torn_tail = true;
            break;
        };
        let end = pos + nl + 1;
        let raw = &bytes[pos..pos + nl];
        let offset = pos as u64;

        if !raw.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<LogLine>(raw) {
                Ok(LogLine::Header { generation }) if offset == 0 => {
                    out.generation = Some(generation);
                }
                Ok(LogLine::Header { .. }) => out.corrupt.push(CorruptLine {
                    offset,
                    reason: "header line after start of log".to_string(),
                    raw: raw.to_vec(),
                }),
                Ok(LogLine::Job(job)) => out.entries.push(LogEntry {
                    offset,
                    len: (end - pos) as u64,
                    job,
                }),
                Err(e) => out.corrupt.push(CorruptLine {
                    offset,
                    reason: e.to_string(),
                    raw: raw.to_vec(),
                }),
            }
        }
        pos = end;
    }

    out.valid_len = pos as u64;
    out
}

/// Read the job line at `offset` from an open log file.
pub(crate) async fn read_job_at(file: &mut tokio::fs::File, offset: u64, len: u64) -> Result<Job> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    match serde_json::from_slice::<LogLine>(buf.trim_ascii_end()) {
        Ok(LogLine::Job(job)) => Ok(job),
        Ok(LogLine::Header { .. }) => Err(Error::CorruptLogEntry {
            offset,
            reason: "expected a job, found a header".to_string(),
        }),
        Err(e) => Err(Error::CorruptLogEntry {
            offset,
            reason: e.to_string(),
        }),
    }
}

/// Open `path` for durable appends.
pub(crate) async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use chrono::Utc;

    fn job(kind: &str) -> Job {
        Job {
            id: JobId::new(),
            kind: kind.to_string(),
            payload: serde_json::json!({"n": 1}),
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: 3,
        }
    }

    #[test]
    fn scan_reads_header_and_jobs_with_offsets() {
        let mut bytes = encode_line(&LogLine::Header { generation: 4 }).unwrap();
        let header_len = bytes.len() as u64;
        let first = job("a");
        let first_line = encode_line(&LogLine::Job(first.clone())).unwrap();
        bytes.extend_from_slice(&first_line);
        bytes.extend_from_slice(&encode_line(&LogLine::Job(job("b"))).unwrap());

        let scan = scan(&bytes);
        assert_eq!(scan.generation, Some(4));
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[0].offset, header_len);
        assert_eq!(scan.entries[0].len, first_line.len() as u64);
        assert_eq!(scan.entries[0].job, first);
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert!(!scan.torn_tail);
    }

    #[test]
    fn scan_detects_torn_tail() {
        let mut bytes = encode_line(&LogLine::Header { generation: 0 }).unwrap();
        bytes.extend_from_slice(&encode_line(&LogLine::Job(job("a"))).unwrap());
        let complete = bytes.len() as u64;
        bytes.extend_from_slice(br#"{"type":"job","id":"#);

        let scan = scan(&bytes);
        assert!(scan.torn_tail);
        assert_eq!(scan.valid_len, complete);
        assert_eq!(scan.entries.len(), 1);
    }

    #[test]
    fn scan_isolates_corrupt_lines() {
        let mut bytes = encode_line(&LogLine::Header { generation: 0 }).unwrap();
        bytes.extend_from_slice(b"not json at all\n");
        bytes.extend_from_slice(&encode_line(&LogLine::Job(job("a"))).unwrap());

        let scan = scan(&bytes);
        assert_eq!(scan.corrupt.len(), 1);
        assert_eq!(scan.corrupt[0].raw, b"not json at all");
        assert_eq!(scan.entries.len(), 1);
    }
}
