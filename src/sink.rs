use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use eyre::{eyre, Result};
use serde::Serialize;

/// One comment as emitted to the per-note output stream. `_level` and
/// `parent_id` are set by the walker, not the wire; level 1 is a direct
/// reply to the note.
#[derive(Debug, Clone, Serialize)]
pub struct CommentRecord {
    pub comment_id: String,
    pub parent_id: String,
    pub note_id: String,
    #[serde(rename = "_level")]
    pub level: u32,
    pub body: String,
    pub author: String,
    pub author_id: String,
    pub timestamp: i64,
    pub sub_comment_count: u64,
}

/// Append-only destination for walked comments. Downstream consumers must
/// dedup by `comment_id`: an interrupted page may be re-emitted on resume.
pub trait CommentSink: Send {
    fn emit(&mut self, record: &CommentRecord) -> Result<()>;
    fn count(&self) -> u64;
}

/// Line-delimited JSON file sink, one record per line, flushed per line so a
/// crash loses at most the record being written.
pub struct JsonlSink {
    file: File,
    count: u64,
}

impl JsonlSink {
    /// Open the sink. `resume` appends to an existing file; a fresh walk
    /// truncates whatever a previous failed run left behind.
    pub fn open(path: &Path, resume: bool) -> Result<Self> {
        let file = if resume {
            OpenOptions::new().create(true).append(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(|e| eyre!("failed to open comment sink {}: {e}", path.display()))?;
        Ok(Self { file, count: 0 })
    }
}

impl CommentSink for JsonlSink {
    fn emit(&mut self, record: &CommentRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| eyre!("failed to serialize comment {}: {e}", record.comment_id))?;
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
            .map_err(|e| eyre!("failed to write comment {}: {e}", record.comment_id))?;
        self.count += 1;
        Ok(())
    }

    fn count(&self) -> u64 {
        self.count
    }
}

/// In-memory sink for tests: keeps every record in emission order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<CommentRecord>,
}

#[cfg(test)]
impl CommentSink for MemorySink {
    fn emit(&mut self, record: &CommentRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn count(&self) -> u64 {
        self.records.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> CommentRecord {
        CommentRecord {
            comment_id: id.to_string(),
            parent_id: String::new(),
            note_id: "n1".to_string(),
            level: 1,
            body: "text".to_string(),
            author: "alice".to_string(),
            author_id: "u1".to_string(),
            timestamp: 1_730_000_000_000,
            sub_comment_count: 0,
        }
    }

    #[test]
    fn jsonl_sink_writes_one_object_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("comments.jsonl");
        {
            let mut sink = JsonlSink::open(&path, false).unwrap();
            sink.emit(&record("c1")).unwrap();
            sink.emit(&record("c2")).unwrap();
            assert_eq!(sink.count(), 2);
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["comment_id"], "c1");
        assert_eq!(first["_level"], 1);
        assert_eq!(first["parent_id"], "");
    }

    #[test]
    fn resume_appends_fresh_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("comments.jsonl");
        {
            let mut sink = JsonlSink::open(&path, false).unwrap();
            sink.emit(&record("c1")).unwrap();
        }
        {
            let mut sink = JsonlSink::open(&path, true).unwrap();
            sink.emit(&record("c2")).unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);

        {
            let mut sink = JsonlSink::open(&path, false).unwrap();
            sink.emit(&record("c3")).unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }
}
