use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use vizoraa_contracts::analysis::AnalysisResult;
use vizoraa_contracts::columns::{media_type_for_path, sniff_columns};
use vizoraa_contracts::events::EventLog;
use vizoraa_contracts::export::write_rows_csv;
use vizoraa_contracts::session::{Session, SubmitPlan};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

// The service runs an LLM pipeline per upload; responses routinely take
// minutes.
const REQUEST_TIMEOUT_S: f64 = 600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExtract {
    pub columns: Vec<String>,
    pub filename: String,
}

/// The analysis service seen through one seam: multipart upload, follow-up
/// query, and column extraction, each answering with a raw JSON envelope.
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &str;
    fn analyze_upload(&self, path: &Path, instruction: Option<&str>) -> Result<Value>;
    fn analyze_query(&self, file_id: &str, instruction: &str) -> Result<Value>;
    fn extract_columns(&self, path: &Path) -> Result<ColumnExtract>;
}

pub fn resolve_backend(
    name: Option<&str>,
    api_base: Option<&str>,
) -> Result<Box<dyn AnalysisBackend>> {
    let resolved = name
        .map(str::to_string)
        .or_else(|| non_empty_env("VIZORAA_BACKEND"))
        .unwrap_or_else(|| "http".to_string());
    match resolved.trim().to_ascii_lowercase().as_str() {
        "http" => Ok(Box::new(HttpBackend::new(api_base))),
        "dryrun" => Ok(Box::new(DryrunBackend::new())),
        other => bail!("unknown backend '{other}' (expected 'http' or 'dryrun')"),
    }
}

pub struct HttpBackend {
    api_base: String,
    http: HttpClient,
}

impl HttpBackend {
    pub fn new(api_base: Option<&str>) -> Self {
        Self {
            api_base: api_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| {
                    non_empty_env("VIZORAA_API_BASE")
                        .map(|value| value.trim_end_matches('/').to_string())
                })
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}/", self.api_base)
    }

    fn dataset_part(path: &Path) -> Result<MultipartPart> {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = media_type_for_path(path);
        MultipartPart::bytes(bytes)
            .file_name(file_name_of(path))
            .mime_str(mime)
            .with_context(|| format!("invalid mime '{mime}' for {}", path.display()))
    }

    fn post_form(&self, endpoint: &str, form: MultipartForm) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
            .multipart(form)
            .send()
            .with_context(|| format!("analysis request failed ({endpoint})"))?;
        response_json_or_error(response)
    }
}

impl AnalysisBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn analyze_upload(&self, path: &Path, instruction: Option<&str>) -> Result<Value> {
        let mut form = MultipartForm::new().part("file", Self::dataset_part(path)?);
        if let Some(instruction) = instruction {
            form = form.text("instruction", instruction.to_string());
        }
        self.post_form(&self.endpoint("two_agent"), form)
    }

    fn analyze_query(&self, file_id: &str, instruction: &str) -> Result<Value> {
        let form = MultipartForm::new()
            .text("file_id", file_id.to_string())
            .text("instruction", instruction.to_string());
        self.post_form(&self.endpoint("two_agent_query"), form)
    }

    fn extract_columns(&self, path: &Path) -> Result<ColumnExtract> {
        let form = MultipartForm::new().part("file", Self::dataset_part(path)?);
        let payload = self.post_form(&self.endpoint("extract_columns"), form)?;
        Ok(ColumnExtract {
            columns: payload
                .get("columns")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            filename: payload
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Offline stand-in for the analysis service. Fabricates a deterministic
/// envelope from the local file alone, in the same wire shape the real
/// service uses (packed-buffer bar axis, inline scatter, PNG data-URI
/// raster), so the whole pipeline runs without a server.
#[derive(Default)]
pub struct DryrunBackend {
    uploads: AtomicU64,
}

impl DryrunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_file_id(&self) -> String {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        format!("file_{n}_{ts}")
    }

    fn fabricate_result(
        &self,
        file_id: &str,
        file_name: Option<&str>,
        columns: &[String],
        instruction: Option<&str>,
        approach: &str,
    ) -> Result<Value> {
        let subject = file_name.unwrap_or(file_id).to_string();
        let questions = instruction
            .map(split_instruction_queries)
            .filter(|questions| !questions.is_empty())
            .unwrap_or_else(|| {
                vec![
                    "Which category leads the dataset?".to_string(),
                    "How do values trend across rows?".to_string(),
                    "Where are the largest outliers?".to_string(),
                ]
            });
        let label_column = columns
            .first()
            .cloned()
            .unwrap_or_else(|| "category".to_string());
        let value_column = columns
            .get(1)
            .cloned()
            .unwrap_or_else(|| "value".to_string());

        let goals: Vec<Value> = questions
            .iter()
            .enumerate()
            .map(|(index, question)| {
                json!({
                    "index": index,
                    "question": question,
                    "visualization": match index % 3 {
                        0 => "bar chart",
                        1 => "scatter plot",
                        _ => "static chart image",
                    },
                    "rationale": format!("Synthesized offline for '{subject}'."),
                })
            })
            .collect();
        let charts = questions
            .iter()
            .enumerate()
            .map(|(index, question)| {
                self.fabricate_chart(index, question, &label_column, &value_column, &subject)
            })
            .collect::<Result<Vec<Value>>>()?;

        let summary_text = if columns.is_empty() {
            format!(
                "Offline dry run for '{subject}': {} goal(s) synthesized.",
                questions.len()
            )
        } else {
            format!(
                "Offline dry run of '{subject}': {} column(s) detected ({}).",
                columns.len(),
                columns.join(", ")
            )
        };

        let mut envelope = json!({
            "file_id": file_id,
            "summary_text": summary_text,
            "summary_json": {"name": subject, "field_names": columns},
            "personas": [
                {"persona": "Data analyst", "rationale": "Default reviewer for tabular uploads"},
                {"persona": "Operations lead", "rationale": "Owns the processes behind the numbers"},
                {"persona": "Executive sponsor", "rationale": "Needs the headline trend"},
            ],
            "selected_persona": {"persona": "Data analyst", "rationale": "Default reviewer for tabular uploads"},
            "goals": goals,
            "charts": charts,
            "approach": approach,
            "columns": columns,
        });
        if let Some(name) = file_name {
            envelope["filename"] = json!(name);
        }
        Ok(envelope)
    }

    fn fabricate_chart(
        &self,
        index: usize,
        question: &str,
        label_column: &str,
        value_column: &str,
        subject: &str,
    ) -> Result<Value> {
        let labels = ["north", "south", "east", "west"];
        let values = [5.0, 3.0, 8.0, 2.0];
        match index % 3 {
            0 => Ok(json!({
                "goal": {"index": index, "question": question},
                "chart_spec": {"type": "bar", "x": label_column, "y": value_column},
                "chart_data_plotly": {
                    "data": [{
                        "type": "bar",
                        "name": value_column,
                        "x": labels,
                        "y": {"dtype": "f8", "bdata": pack_doubles(&values)},
                    }],
                    "layout": {"title": {"text": format!("{value_column} by {label_column}")}},
                },
                "processed_df": label_rows(label_column, value_column, &labels, &values),
            })),
            1 => Ok(json!({
                "goal": {"index": index, "question": question},
                "chart_spec": {"type": "scatter", "x": "row", "y": value_column},
                "chart_data_plotly": {
                    "data": [{
                        "type": "scatter",
                        "name": value_column,
                        "x": [1, 2, 3, 4],
                        "y": [2.0, 4.5, 3.0, 5.5],
                    }],
                    "layout": {"title": "Row trend"},
                },
                "processed_df": point_rows(value_column, &[1, 2, 3, 4], &[2.0, 4.5, 3.0, 5.5]),
            })),
            _ => {
                let png = render_chart_png(subject)?;
                Ok(json!({
                    "goal": {"index": index, "question": question},
                    "chart_spec": {"type": "image"},
                    "chart_data_matplotlib":
                        format!("data:image/png;base64,{}", BASE64.encode(png)),
                }))
            }
        }
    }
}

impl AnalysisBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze_upload(&self, path: &Path, instruction: Option<&str>) -> Result<Value> {
        let columns = sniff_columns(path).unwrap_or_default();
        let file_name = file_name_of(path);
        let approach = if instruction.is_some() {
            "agent_upload_with_instruction"
        } else {
            "agent_upload_no_instruction"
        };
        self.fabricate_result(
            &self.next_file_id(),
            Some(&file_name),
            &columns,
            instruction,
            approach,
        )
    }

    fn analyze_query(&self, file_id: &str, instruction: &str) -> Result<Value> {
        self.fabricate_result(
            file_id,
            None,
            &[],
            Some(instruction),
            "agent_query_with_instruction",
        )
    }

    fn extract_columns(&self, path: &Path) -> Result<ColumnExtract> {
        Ok(ColumnExtract {
            columns: sniff_columns(path)?,
            filename: file_name_of(path),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubmitReport {
    pub result: AnalysisResult,
    pub raw_path: PathBuf,
    pub reconciled: bool,
}

/// Drives one submit end to end: validate, record the user entry, call the
/// backend, persist the raw envelope, reconcile, and log events along the
/// way.
pub struct AnalysisEngine {
    backend: Box<dyn AnalysisBackend>,
    events: EventLog,
    out_dir: PathBuf,
}

impl AnalysisEngine {
    pub fn new(
        backend: Box<dyn AnalysisBackend>,
        events: EventLog,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            events,
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn backend(&self) -> &dyn AnalysisBackend {
        self.backend.as_ref()
    }

    pub fn emit_event(&self, event: &str, fields: Value) -> Result<Value> {
        self.events.emit(event, fields)
    }

    /// A validation failure returns before any backend call and leaves the
    /// session untouched. A backend failure leaves the user entry pending
    /// and the staged file staged, so the user can retry.
    pub fn submit(&self, session: &mut Session, instruction: &str) -> Result<SubmitReport> {
        let plan = session.plan_submit(instruction)?;
        let (text, file_name) = match &plan {
            SubmitPlan::Upload {
                file_name,
                instruction,
                ..
            } => (
                instruction
                    .clone()
                    .unwrap_or_else(|| format!("Uploaded {file_name}")),
                Some(file_name.clone()),
            ),
            SubmitPlan::Query { instruction, .. } => (instruction.clone(), None),
        };
        let correlation_id = session.push_user_entry(&text, file_name);

        let submitted = match &plan {
            SubmitPlan::Upload {
                file_name,
                instruction,
                ..
            } => json!({
                "correlation_id": correlation_id,
                "mode": "upload",
                "file": file_name,
                "has_instruction": instruction.is_some(),
            }),
            SubmitPlan::Query { file_id, .. } => json!({
                "correlation_id": correlation_id,
                "mode": "query",
                "file_id": file_id,
            }),
        };
        self.emit_event("request_submitted", submitted)?;

        let raw = match self.dispatch(&plan) {
            Ok(raw) => raw,
            Err(err) => {
                self.emit_event(
                    "request_failed",
                    json!({
                        "correlation_id": correlation_id,
                        "error": format!("{err:#}"),
                    }),
                )?;
                return Err(err);
            }
        };

        let result = AnalysisResult::from_value(&raw);
        let raw_path = self.save_raw_result(&raw)?;
        let reconciled = session.reconcile(&result);
        self.emit_event(
            "analysis_received",
            json!({
                "result_id": result.result_id,
                "file_id": result.file_id,
                "goals": result.goals.len(),
                "reconciled": reconciled,
                "raw_path": raw_path.display().to_string(),
            }),
        )?;
        Ok(SubmitReport {
            result,
            raw_path,
            reconciled,
        })
    }

    fn dispatch(&self, plan: &SubmitPlan) -> Result<Value> {
        match plan {
            SubmitPlan::Upload {
                path, instruction, ..
            } => self.backend.analyze_upload(path, instruction.as_deref()),
            SubmitPlan::Query {
                file_id,
                instruction,
            } => self.backend.analyze_query(file_id, instruction),
        }
    }

    fn save_raw_result(&self, raw: &Value) -> Result<PathBuf> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("creating {}", self.out_dir.display()))?;
        let path = self
            .out_dir
            .join(format!("result-{}.json", chrono::Utc::now().timestamp_millis()));
        fs::write(&path, serde_json::to_string_pretty(raw)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct SavedChart {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Decodes an image data-URI into `chart-{stamp}-{NN}.{ext}` under `out_dir`
/// and probes its pixel dimensions (zero when the payload is not a readable
/// image).
pub fn save_chart_image(out_dir: &Path, index: usize, source: &str) -> Result<SavedChart> {
    let (ext, payload) = split_data_uri(source)?;
    let bytes = BASE64
        .decode(payload.trim())
        .context("chart image payload is not valid base64")?;
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let stamp = chrono::Utc::now().timestamp_millis();
    let path = out_dir.join(format!("chart-{}-{:02}.{}", stamp, index, ext));
    fs::write(&path, &bytes).with_context(|| format!("failed to save {}", path.display()))?;
    let (width, height) = match image::load_from_memory(&bytes) {
        Ok(decoded) => {
            let rgb = decoded.to_rgb8();
            (rgb.width(), rgb.height())
        }
        Err(_) => (0, 0),
    };
    Ok(SavedChart {
        path,
        width,
        height,
    })
}

/// Writes each goal's plotted rows as `chart_{i}_data.csv` (1-based) and
/// returns the paths written; goals without rows are skipped.
pub fn export_goal_rows(result: &AnalysisResult, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (index, report) in result.goal_reports().iter().enumerate() {
        if report.rows.is_empty() {
            continue;
        }
        let path = dir.join(format!("chart_{}_data.csv", index + 1));
        if write_rows_csv(&report.rows, &path)? {
            written.push(path);
        }
    }
    Ok(written)
}

fn split_data_uri(source: &str) -> Result<(&str, &str)> {
    let trimmed = source.trim();
    let Some(rest) = trimmed.strip_prefix("data:image/") else {
        bail!("not an image data URI");
    };
    let Some((ext, payload)) = rest.split_once(";base64,") else {
        bail!("image data URI is missing a base64 payload");
    };
    if ext.is_empty() || !ext.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        bail!("image data URI declares an unusable format '{ext}'");
    }
    Ok((ext, payload))
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("analysis response body read failed")?;
    if !status.is_success() {
        if let Some(message) = declared_body_error(&body) {
            bail!("{message}");
        }
        bail!(
            "analysis request failed with status {code}: {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value =
        serde_json::from_str(&body).context("analysis service returned invalid JSON payload")?;
    Ok(parsed)
}

fn declared_body_error(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("dataset.csv")
        .to_string()
}

fn split_instruction_queries(instruction: &str) -> Vec<String> {
    instruction
        .split(['\n', ','])
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(str::to_string)
        .collect()
}

fn pack_doubles(values: &[f64]) -> String {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn label_rows(label_column: &str, value_column: &str, labels: &[&str], values: &[f64]) -> Value {
    let rows: Vec<Value> = labels
        .iter()
        .zip(values)
        .map(|(label, value)| {
            let mut row = Map::new();
            row.insert(label_column.to_string(), json!(label));
            row.insert(value_column.to_string(), json!(value));
            Value::Object(row)
        })
        .collect();
    Value::Array(rows)
}

fn point_rows(value_column: &str, xs: &[i64], ys: &[f64]) -> Value {
    let rows: Vec<Value> = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let mut row = Map::new();
            row.insert("row".to_string(), json!(x));
            row.insert(value_column.to_string(), json!(y));
            Value::Object(row)
        })
        .collect();
    Value::Array(rows)
}

fn render_chart_png(subject: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_subject(subject);
    let mut canvas = RgbImage::new(320, 200);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Cursor::new(Vec::new());
    canvas
        .write_to(&mut bytes, image::ImageFormat::Png)
        .context("encoding dry run chart image")?;
    Ok(bytes.into_inner())
}

fn color_from_subject(subject: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use vizoraa_contracts::analysis::Approach;
    use vizoraa_contracts::charts::{ChartOutcome, RenderableChart};
    use vizoraa_contracts::session::{ActiveFile, EntryKind, StagedFile, SubmitError};

    use super::*;

    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
        response: Value,
    }

    impl AnalysisBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        fn analyze_upload(&self, path: &Path, instruction: Option<&str>) -> Result<Value> {
            self.calls.lock().unwrap().push(format!(
                "upload {} instruction={instruction:?}",
                path.display()
            ));
            Ok(self.response.clone())
        }

        fn analyze_query(&self, file_id: &str, instruction: &str) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("query file_id={file_id} instruction={instruction}"));
            Ok(self.response.clone())
        }

        fn extract_columns(&self, path: &Path) -> Result<ColumnExtract> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("columns {}", path.display()));
            Ok(ColumnExtract {
                columns: Vec::new(),
                filename: String::new(),
            })
        }
    }

    struct FailingBackend;

    impl AnalysisBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn analyze_upload(&self, _path: &Path, _instruction: Option<&str>) -> Result<Value> {
            bail!("service unavailable")
        }

        fn analyze_query(&self, _file_id: &str, _instruction: &str) -> Result<Value> {
            bail!("service unavailable")
        }

        fn extract_columns(&self, _path: &Path) -> Result<ColumnExtract> {
            bail!("service unavailable")
        }
    }

    fn engine_with(backend: Box<dyn AnalysisBackend>, dir: &Path) -> AnalysisEngine {
        let events = EventLog::new(dir.join("events.jsonl"), "session-test");
        AnalysisEngine::new(backend, events, dir)
    }

    #[test]
    fn validation_error_makes_no_backend_call() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            Box::new(RecordingBackend {
                calls: Arc::clone(&calls),
                response: json!({}),
            }),
            dir.path(),
        );
        let mut session = Session::new();

        let err = engine.submit(&mut session, "show sales").unwrap_err();
        assert_eq!(err.downcast_ref::<SubmitError>(), Some(&SubmitError::NoFile));
        assert_eq!(err.to_string(), "Please upload a file first.");
        assert!(calls.lock().unwrap().is_empty());
        assert!(session.entries().is_empty());
        Ok(())
    }

    #[test]
    fn query_plan_carries_file_id_and_instruction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            Box::new(RecordingBackend {
                calls: Arc::clone(&calls),
                response: json!({
                    "file_id": "doc1",
                    "summary_text": "Sales hold steady.",
                    "approach": "agent_query_with_instruction",
                }),
            }),
            dir.path(),
        );
        let mut session = Session::new();
        session.activate_remote("doc1");

        let report = engine.submit(&mut session, "show sales")?;
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["query file_id=doc1 instruction=show sales"]
        );
        assert!(report.reconciled);
        assert_eq!(session.entries().len(), 2);

        let log = fs::read_to_string(dir.path().join("events.jsonl"))?;
        let events: Vec<Value> = log
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], json!("request_submitted"));
        assert_eq!(events[0]["mode"], json!("query"));
        assert_eq!(events[1]["event"], json!("analysis_received"));
        Ok(())
    }

    #[test]
    fn upload_plan_sends_the_staged_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("sales.csv");
        fs::write(&data, "region,total\nnorth,5\n")?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            Box::new(RecordingBackend {
                calls: Arc::clone(&calls),
                response: json!({"file_id": "doc1", "summary_text": "ok"}),
            }),
            dir.path(),
        );
        let mut session = Session::new();
        session.stage_file(StagedFile::from_path(&data)?, Vec::new());

        engine.submit(&mut session, "")?;
        let recorded = calls.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].starts_with("upload"));
        assert!(recorded[0].ends_with("instruction=None"));
        Ok(())
    }

    #[test]
    fn backend_failure_keeps_the_entry_pending() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("sales.csv");
        fs::write(&data, "region,total\nnorth,5\n")?;
        let engine = engine_with(Box::new(FailingBackend), dir.path());
        let mut session = Session::new();
        session.stage_file(StagedFile::from_path(&data)?, Vec::new());

        let err = engine.submit(&mut session, "trend").unwrap_err();
        assert!(err.to_string().contains("service unavailable"));

        let last = session.entries().last().unwrap();
        assert_eq!(last.kind, EntryKind::User);
        assert!(last.is_pending());
        assert!(matches!(session.active(), ActiveFile::Staged(_)));

        let log = fs::read_to_string(dir.path().join("events.jsonl"))?;
        assert!(log.lines().any(|line| line.contains("request_failed")));
        Ok(())
    }

    #[test]
    fn dryrun_runs_the_whole_pipeline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("sales.csv");
        fs::write(&data, "region,total\nnorth,5\nsouth,3\n")?;
        let engine = engine_with(Box::new(DryrunBackend::new()), dir.path());
        let mut session = Session::new();
        let columns = sniff_columns(&data)?;
        session.stage_file(StagedFile::from_path(&data)?, columns);

        let report = engine.submit(&mut session, "")?;
        assert!(report.reconciled);
        assert!(report.raw_path.exists());

        let document = session.documents().next().unwrap();
        assert!(document.file_id.starts_with("file_1_"));
        assert_eq!(document.name, "sales.csv");
        assert_eq!(session.columns(), ["region", "total"]);

        let reports = report.result.goal_reports();
        assert_eq!(reports.len(), 3);
        let ChartOutcome::Rendered(RenderableChart::Bar { values, .. }) = &reports[0].outcome
        else {
            panic!("expected a bar chart, got {:?}", reports[0].outcome);
        };
        assert_eq!(values, &vec![5.0, 3.0, 8.0, 2.0]);
        assert!(matches!(
            &reports[1].outcome,
            ChartOutcome::Rendered(RenderableChart::Scatter { points, .. }) if points.len() == 4
        ));
        let ChartOutcome::Rendered(RenderableChart::Image { source }) = &reports[2].outcome
        else {
            panic!("expected an image chart, got {:?}", reports[2].outcome);
        };
        assert!(source.starts_with("data:image/png;base64,"));

        let saved = save_chart_image(dir.path(), 2, source)?;
        assert!(saved.path.exists());
        assert_eq!((saved.width, saved.height), (320, 200));

        let written = export_goal_rows(&report.result, dir.path())?;
        let names: Vec<_> = written
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, ["chart_1_data.csv", "chart_2_data.csv"]);
        Ok(())
    }

    #[test]
    fn dryrun_goals_follow_the_instruction() -> anyhow::Result<()> {
        let backend = DryrunBackend::new();
        let raw = backend.analyze_query("doc1", "show sales, compare regions")?;
        let result = AnalysisResult::from_value(&raw);
        assert_eq!(result.goals.len(), 2);
        assert_eq!(result.goals[0].question, "show sales");
        assert_eq!(result.goals[1].question, "compare regions");
        assert_eq!(result.approach, Some(Approach::QueryExisting));
        assert_eq!(result.file_id.as_deref(), Some("doc1"));
        assert_eq!(result.file_name, None);
        Ok(())
    }

    #[test]
    fn api_base_flag_overrides_and_trims() {
        let backend = HttpBackend::new(Some("http://localhost:9000/"));
        assert_eq!(backend.api_base(), "http://localhost:9000");
        assert_eq!(
            backend.endpoint("two_agent"),
            "http://localhost:9000/two_agent/"
        );
    }

    #[test]
    fn save_chart_image_rejects_non_image_sources() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(save_chart_image(dir.path(), 0, "hello").is_err());
        assert!(save_chart_image(dir.path(), 0, "data:text/plain;base64,AAAA").is_err());
        assert!(save_chart_image(dir.path(), 0, "data:image/png;base64").is_err());
        Ok(())
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        assert!(resolve_backend(Some("carrier-pigeon"), None).is_err());
    }
}
