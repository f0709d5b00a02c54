//! Run transcript: one JSON object per line under a caller-chosen path.
//!
//! The transcript is a product artifact, separate from `tracing` output. It
//! is always appended to, so several runs can share one file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Append-only JSONL writer.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: File,
}

#[derive(Serialize)]
struct Line<'a, T> {
    at: String,
    kind: &'a str,
    #[serde(flatten)]
    record: &'a T,
}

impl Transcript {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open transcript {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record tagged with `kind` and a UTC timestamp.
    pub fn append<T: Serialize>(&mut self, kind: &str, record: &T) -> Result<()> {
        let line = Line {
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
            record,
        };
        let mut buf = serde_json::to_string(&line).context("serialize transcript line")?;
        buf.push('\n');
        self.file
            .write_all(buf.as_bytes())
            .with_context(|| format!("append transcript {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn appends_tagged_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs/transcript.jsonl");
        let mut transcript = Transcript::open(&path).expect("open");
        transcript
            .append("step", &json!({"step": 1, "stage": "planner"}))
            .expect("append");
        transcript
            .append("output", &json!({"status": "success"}))
            .expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "step");
        assert_eq!(lines[0]["stage"], "planner");
        assert_eq!(lines[1]["status"], "success");
        assert!(lines[1]["at"].as_str().expect("timestamp").ends_with('Z'));
    }

    #[test]
    fn reopening_keeps_earlier_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript.jsonl");
        Transcript::open(&path)
            .expect("open")
            .append("step", &json!({"step": 1}))
            .expect("append");
        Transcript::open(&path)
            .expect("reopen")
            .append("step", &json!({"step": 2}))
            .expect("append");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
    }
}
