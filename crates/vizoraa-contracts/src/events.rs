use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// JSONL log of session activity: one self-describing object per line.
///
/// Each line carries `event`, `session_id`, and `ts`; caller fields are laid
/// down first and win on collision, so a replay tool can relabel a line. The
/// file is opened on first emit and the handle kept for the session.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    session_id: String,
    sink: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
            sink: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends one event line and returns the record as written.
    pub fn emit(&self, event: &str, fields: Value) -> Result<Value> {
        let mut record = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        record
            .entry("event")
            .or_insert_with(|| Value::String(event.to_string()));
        record
            .entry("session_id")
            .or_insert_with(|| Value::String(self.session_id.clone()));
        record.entry("ts").or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false))
        });

        let line = serde_json::to_string(&record)?;
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log poisoned"))?;
        let file = match sink.as_mut() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let opened = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .with_context(|| format!("opening {}", self.path.display()))?;
                sink.insert(opened)
            }
        };
        writeln!(file, "{line}")
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(Value::Object(record))
    }
}
