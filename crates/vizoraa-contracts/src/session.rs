use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use thiserror::Error;
use uuid::Uuid;

use crate::analysis::{AnalysisResult, Approach};
use crate::columns::media_type_for_path;

/// Submit validation failures, raised before any network call. The messages
/// are user-facing notices.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Please upload a file first.")]
    NoFile,
    #[error("Please enter a query for analysis.")]
    EmptyQuery,
}

/// A local dataset chosen for upload but not yet submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub name: String,
    pub media_type: String,
    pub size_label: String,
}

impl StagedFile {
    pub fn from_path(path: &Path) -> Result<StagedFile> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("reading file metadata for {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        Ok(StagedFile {
            path: path.to_path_buf(),
            name,
            media_type: media_type_for_path(path).to_string(),
            size_label: size_label(metadata.len()),
        })
    }
}

/// Which dataset the next submit targets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveFile {
    #[default]
    NoFile,
    Staged(StagedFile),
    Active {
        file_id: String,
        name: String,
    },
}

/// A dataset known to the session, keyed by its server-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub file_id: String,
    pub name: String,
    pub media_type: String,
    pub size_label: String,
    pub uploaded_at: String,
    pub summary: Option<String>,
    pub key_points: Vec<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Response,
}

/// One transcript line. User entries stay pending (correlation id set)
/// until a response backfills their approach tag; response entries carry the
/// full result they summarize.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub kind: EntryKind,
    pub text: String,
    pub file_name: Option<String>,
    pub approach: Option<Approach>,
    pub correlation_id: Option<String>,
    pub result: Option<AnalysisResult>,
    pub timestamp: String,
}

impl ConversationEntry {
    pub fn is_pending(&self) -> bool {
        self.correlation_id.is_some()
    }
}

/// What a validated submit should send.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitPlan {
    Upload {
        path: PathBuf,
        file_name: String,
        instruction: Option<String>,
    },
    Query {
        file_id: String,
        instruction: String,
    },
}

/// Session state: the transcript, the document collection, the active-file
/// state machine, and the cached column list for the current target.
///
/// All mutation goes through methods. Invariants: at most one response entry
/// per result id, and "selected document" is exactly the `Active` state.
#[derive(Debug, Default)]
pub struct Session {
    entries: Vec<ConversationEntry>,
    documents: IndexMap<String, Document>,
    active: ActiveFile,
    columns: Vec<String>,
    last_result_id: Option<String>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn document(&self, file_id: &str) -> Option<&Document> {
        self.documents.get(file_id)
    }

    pub fn active(&self) -> &ActiveFile {
        &self.active
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The most recent reconciled result, if any.
    pub fn last_result(&self) -> Option<&AnalysisResult> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| entry.result.as_ref())
    }

    /// Stages a local file as the submit target, replacing any previous
    /// staged or active selection. Sniffed columns are an optimistic preview;
    /// the backend's list supersedes them on reconcile.
    pub fn stage_file(&mut self, file: StagedFile, sniffed_columns: Vec<String>) {
        self.columns = sniffed_columns;
        self.active = ActiveFile::Staged(file);
    }

    /// Makes a known document the active target, discarding any staged file.
    pub fn select_document(&mut self, file_id: &str) -> Option<Document> {
        let document = self.documents.get(file_id)?.clone();
        self.columns = document.columns.clone();
        self.active = ActiveFile::Active {
            file_id: document.file_id.clone(),
            name: document.name.clone(),
        };
        Some(document)
    }

    /// Targets a server-side file id the session has never seen, for
    /// follow-up queries started from the command line.
    pub fn activate_remote(&mut self, file_id: &str) {
        if self.select_document(file_id).is_some() {
            return;
        }
        self.columns.clear();
        self.active = ActiveFile::Active {
            file_id: file_id.to_string(),
            name: file_id.to_string(),
        };
    }

    /// Removes a document. Removing the active one resets the state machine
    /// and drops the cached columns.
    pub fn remove_document(&mut self, file_id: &str) -> Option<Document> {
        let removed = self.documents.shift_remove(file_id)?;
        let was_active = matches!(
            &self.active,
            ActiveFile::Active { file_id: active, .. } if active == file_id
        );
        if was_active {
            self.active = ActiveFile::NoFile;
            self.columns.clear();
        }
        Some(removed)
    }

    /// Validates a submit and decides what to send. Never touches the
    /// network and never mutates state.
    pub fn plan_submit(&self, instruction: &str) -> Result<SubmitPlan, SubmitError> {
        let instruction = instruction.trim();
        match &self.active {
            ActiveFile::Staged(file) => Ok(SubmitPlan::Upload {
                path: file.path.clone(),
                file_name: file.name.clone(),
                instruction: (!instruction.is_empty()).then(|| instruction.to_string()),
            }),
            ActiveFile::Active { file_id, .. } => {
                if instruction.is_empty() {
                    return Err(SubmitError::EmptyQuery);
                }
                Ok(SubmitPlan::Query {
                    file_id: file_id.clone(),
                    instruction: instruction.to_string(),
                })
            }
            ActiveFile::NoFile => Err(SubmitError::NoFile),
        }
    }

    /// Appends the user's side of a submit and returns the correlation id
    /// its eventual response will consume.
    pub fn push_user_entry(&mut self, text: &str, file_name: Option<String>) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        self.entries.push(ConversationEntry {
            kind: EntryKind::User,
            text: text.to_string(),
            file_name,
            approach: None,
            correlation_id: Some(correlation_id.clone()),
            result: None,
            timestamp: now_utc_iso(),
        });
        correlation_id
    }

    /// Merges one backend response into the session. Returns `false` when
    /// the result id matches the last reconciled one (re-delivery), in which
    /// case nothing changes.
    ///
    /// Otherwise, in order: backfill the approach onto the most recent
    /// pending user entry (consuming its correlation id), append exactly one
    /// response entry, upsert the document for the result's file id, make it
    /// the active file, and refresh the cached columns when the result
    /// carries any.
    pub fn reconcile(&mut self, result: &AnalysisResult) -> bool {
        if self.last_result_id.as_deref() == Some(result.result_id.as_str()) {
            return false;
        }
        self.last_result_id = Some(result.result_id.clone());

        let staged = match &self.active {
            ActiveFile::Staged(file) => Some(file.clone()),
            _ => None,
        };

        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| entry.kind == EntryKind::User && entry.is_pending())
        {
            entry.approach = result.approach;
            entry.correlation_id = None;
        }

        self.entries.push(ConversationEntry {
            kind: EntryKind::Response,
            text: result.status_line().to_string(),
            file_name: None,
            approach: result.approach,
            correlation_id: None,
            result: Some(result.clone()),
            timestamp: now_utc_iso(),
        });

        let Some(file_id) = result.file_id.clone() else {
            return true;
        };
        let name = self.upsert_document(&file_id, result, staged.as_ref());
        self.active = ActiveFile::Active { file_id, name };
        if !result.columns.is_empty() {
            self.columns = result.columns.clone();
        }
        true
    }

    /// Update in place when the id is known, insert otherwise. Updates
    /// refresh the analysis attributes (summary, key points, columns) but
    /// preserve identity attributes; the name changes only when the result
    /// or the staged file supplies a real one. Returns the document's name.
    fn upsert_document(
        &mut self,
        file_id: &str,
        result: &AnalysisResult,
        staged: Option<&StagedFile>,
    ) -> String {
        let name_hint = result
            .file_name
            .clone()
            .or_else(|| staged.map(|file| file.name.clone()));
        let summary = result.short_summary();
        let key_points = result.key_points();
        if let Some(document) = self.documents.get_mut(file_id) {
            if let Some(name) = name_hint {
                document.name = name;
            }
            if summary.is_some() {
                document.summary = summary;
            }
            if !key_points.is_empty() {
                document.key_points = key_points;
            }
            if !result.columns.is_empty() {
                document.columns = result.columns.clone();
            }
            return document.name.clone();
        }
        let document = Document {
            file_id: file_id.to_string(),
            name: name_hint.unwrap_or_else(|| "Unknown File".to_string()),
            media_type: staged
                .map(|file| file.media_type.clone())
                .unwrap_or_else(|| "application/csv".to_string()),
            size_label: staged
                .map(|file| file.size_label.clone())
                .unwrap_or_else(|| "n/a".to_string()),
            uploaded_at: now_utc_iso(),
            summary,
            key_points,
            columns: result.columns.clone(),
        };
        let name = document.name.clone();
        self.documents.insert(file_id.to_string(), document);
        name
    }
}

/// `12595` bytes formats as `"12.3 KB"`.
pub fn size_label(bytes: u64) -> String {
    format!("{:.1} KB", bytes as f64 / 1024.0)
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
