use serde_json::{Map, Value};
use uuid::Uuid;

use crate::charts::{normalize, ChartFailure, ChartOutcome};

/// Which request pattern produced an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approach {
    Upload,
    UploadWithQuery,
    QueryExisting,
}

impl Approach {
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag.trim() {
            "agent_upload_no_instruction" => Some(Approach::Upload),
            "agent_upload_with_instruction" => Some(Approach::UploadWithQuery),
            "agent_query_with_instruction" => Some(Approach::QueryExisting),
            _ => None,
        }
    }

    pub fn wire_tag(self) -> &'static str {
        match self {
            Approach::Upload => "agent_upload_no_instruction",
            Approach::UploadWithQuery => "agent_upload_with_instruction",
            Approach::QueryExisting => "agent_query_with_instruction",
        }
    }

    /// Short label shown next to transcript entries.
    pub fn badge(self) -> &'static str {
        match self {
            Approach::Upload => "File Analysis",
            Approach::UploadWithQuery => "File + Queries",
            Approach::QueryExisting => "New Query",
        }
    }
}

/// Fixed status line per approach tag, with a generic fallback for
/// unrecognized tags.
pub fn status_line(approach: Option<Approach>) -> &'static str {
    match approach {
        Some(Approach::Upload) => "File uploaded and analyzed successfully!",
        Some(Approach::UploadWithQuery) => "File uploaded and analyzed with your queries!",
        Some(Approach::QueryExisting) => "Analysis completed for your queries!",
        None => "Analysis completed!",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub name: String,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Goal {
    pub index: u64,
    pub question: String,
    pub visualization: String,
    pub rationale: String,
}

/// One entry of the result's `charts` array: the raw materials for a single
/// goal's rendering, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalChart {
    pub question: Option<String>,
    pub chart_spec: Option<Value>,
    pub preprocess_error: Option<String>,
    pub plotly_data: Option<Value>,
    pub plotly_error: Option<String>,
    pub raster_data: Option<String>,
    pub raster_error: Option<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl GoalChart {
    fn from_value(value: &Value) -> GoalChart {
        let question = match value.get("goal") {
            Some(Value::String(text)) => non_empty(text),
            Some(goal) => goal
                .get("question")
                .and_then(Value::as_str)
                .and_then(non_empty),
            None => None,
        };
        GoalChart {
            question,
            chart_spec: present(value.get("chart_spec")),
            preprocess_error: value
                .get("preprocess_error")
                .and_then(Value::as_str)
                .and_then(non_empty),
            plotly_data: present(value.get("chart_data_plotly")),
            plotly_error: value
                .get("chart_error_plotly")
                .and_then(Value::as_str)
                .and_then(non_empty),
            raster_data: value
                .get("chart_data_matplotlib")
                .and_then(Value::as_str)
                .and_then(non_empty),
            raster_error: value
                .get("chart_error_matplotlib")
                .and_then(Value::as_str)
                .and_then(non_empty),
            rows: value
                .get("processed_df")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// First error wins: preprocessing, then the structured renderer, then
    /// the raster fallback.
    pub fn first_error(&self) -> Option<&str> {
        self.preprocess_error
            .as_deref()
            .or(self.plotly_error.as_deref())
            .or(self.raster_error.as_deref())
    }

    /// The payload handed to the normalizer: structured data preferred, the
    /// raster data URI as fallback.
    pub fn payload(&self) -> Option<Value> {
        if let Some(data) = &self.plotly_data {
            return Some(data.clone());
        }
        self.raster_data
            .as_ref()
            .map(|source| Value::String(source.clone()))
    }

    pub fn outcome(&self) -> ChartOutcome {
        if let Some(error) = self.first_error() {
            return ChartOutcome::Failed(ChartFailure::declared(error));
        }
        match self.payload() {
            Some(payload) => normalize(&payload),
            None => ChartOutcome::Empty,
        }
    }
}

/// One goal joined with its rendering outcome. Success and failure are a
/// strict either/or through [`ChartOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct GoalReport {
    pub question: String,
    pub visualization: String,
    pub rationale: String,
    pub outcome: ChartOutcome,
    pub rows: Vec<Map<String, Value>>,
}

/// The backend's structured response to an upload or query.
///
/// Decoding is tolerant: unknown fields are ignored and missing fields
/// degrade to empty defaults. Every decoded result carries a `result_id`
/// (the wire value when the backend sends one, else a locally assigned
/// UUID), which is what reconciliation keys its idempotence guard on.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub result_id: String,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub summary_text: String,
    pub summary_json: Option<Value>,
    pub personas: Vec<Persona>,
    pub selected_persona: Option<Persona>,
    pub goals: Vec<Goal>,
    pub charts: Vec<GoalChart>,
    pub approach: Option<Approach>,
    pub columns: Vec<String>,
}

impl AnalysisResult {
    pub fn from_value(value: &Value) -> AnalysisResult {
        let result_id = value
            .get("result_id")
            .and_then(Value::as_str)
            .and_then(non_empty)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        AnalysisResult {
            result_id,
            file_id: value.get("file_id").and_then(Value::as_str).and_then(non_empty),
            file_name: value
                .get("filename")
                .and_then(Value::as_str)
                .and_then(non_empty),
            summary_text: value
                .get("summary_text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            summary_json: present(value.get("summary_json")),
            personas: value
                .get("personas")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(persona_from_value).collect())
                .unwrap_or_default(),
            selected_persona: value.get("selected_persona").and_then(persona_from_value),
            goals: value
                .get("goals")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .enumerate()
                        .map(|(position, goal)| goal_from_value(goal, position))
                        .collect()
                })
                .unwrap_or_default(),
            charts: value
                .get("charts")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(GoalChart::from_value).collect())
                .unwrap_or_default(),
            approach: value
                .get("approach")
                .and_then(Value::as_str)
                .and_then(Approach::from_wire),
            columns: string_items(value.get("columns")),
        }
    }

    pub fn status_line(&self) -> &'static str {
        status_line(self.approach)
    }

    /// Summary shortened for document listings: the first 150 characters
    /// with an unconditional trailing ellipsis.
    pub fn short_summary(&self) -> Option<String> {
        let trimmed = self.summary_text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let prefix: String = trimmed.chars().take(150).collect();
        Some(format!("{prefix}..."))
    }

    /// The first three goal questions, used as document key points.
    pub fn key_points(&self) -> Vec<String> {
        self.goals
            .iter()
            .map(|goal| goal.question.clone())
            .filter(|question| !question.is_empty())
            .take(3)
            .collect()
    }

    /// Joins goals with their positionally aligned chart entries. A goal
    /// without a chart entry reports `Empty`; a chart entry without a goal
    /// falls back to the question echoed inside the entry.
    pub fn goal_reports(&self) -> Vec<GoalReport> {
        let count = self.goals.len().max(self.charts.len());
        (0..count)
            .map(|index| {
                let goal = self.goals.get(index);
                let chart = self.charts.get(index);
                let question = goal
                    .map(|goal| goal.question.clone())
                    .filter(|question| !question.is_empty())
                    .or_else(|| chart.and_then(|chart| chart.question.clone()))
                    .unwrap_or_default();
                GoalReport {
                    question,
                    visualization: goal.map(|goal| goal.visualization.clone()).unwrap_or_default(),
                    rationale: goal.map(|goal| goal.rationale.clone()).unwrap_or_default(),
                    outcome: chart.map(GoalChart::outcome).unwrap_or(ChartOutcome::Empty),
                    rows: chart.map(|chart| chart.rows.clone()).unwrap_or_default(),
                }
            })
            .collect()
    }
}

fn goal_from_value(value: &Value, position: usize) -> Goal {
    // Some backend builds name the chart suggestion `suggested_chart`.
    let mut visualization = text_field(value, "visualization");
    if visualization.is_empty() {
        visualization = text_field(value, "suggested_chart");
    }
    Goal {
        index: value
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(position as u64),
        question: text_field(value, "question"),
        visualization,
        rationale: text_field(value, "rationale"),
    }
}

fn persona_from_value(value: &Value) -> Option<Persona> {
    match value {
        Value::String(name) => non_empty(name).map(|name| Persona {
            name,
            rationale: None,
        }),
        Value::Object(fields) => {
            let name = fields
                .get("persona")
                .or_else(|| fields.get("name"))
                .and_then(Value::as_str)
                .and_then(non_empty)?;
            Some(Persona {
                name,
                rationale: fields
                    .get("rationale")
                    .and_then(Value::as_str)
                    .and_then(non_empty),
            })
        }
        _ => None,
    }
}

fn text_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn present(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| !value.is_null()).cloned()
}

fn string_items(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::charts::RenderableChart;

    use super::*;

    fn sample_envelope() -> Value {
        json!({
            "file_id": "file_1_1719000000",
            "summary_text": "Sales per region for the last four quarters.",
            "summary_json": {"name": "sales", "field_names": ["region", "total"]},
            "personas": [
                {"persona": "CFO", "rationale": "Owns revenue targets"},
                {"persona": "Regional manager"},
            ],
            "selected_persona": {"persona": "CFO", "rationale": "Owns revenue targets"},
            "goals": [
                {"index": 0, "question": "Which region sells most?",
                 "visualization": "Bar chart of total by region",
                 "rationale": "Compares totals across regions."},
                {"index": 1, "question": "How do totals trend?",
                 "visualization": "Line chart of total by quarter",
                 "rationale": "Shows the trajectory."},
            ],
            "charts": [
                {
                    "goal": {"index": 0, "question": "Which region sells most?"},
                    "chart_spec": {"type": "bar", "x": "region", "y": "total"},
                    "preprocess_error": null,
                    "chart_data_plotly": {"data": [{"type": "bar", "x": ["north"], "y": [5]}]},
                    "chart_error_plotly": null,
                    "chart_data_matplotlib": null,
                    "chart_error_matplotlib": null,
                    "processed_df": [{"region": "north", "total": 5}],
                },
                {
                    "goal": {"index": 1, "question": "How do totals trend?"},
                    "preprocess_error": "Column 'quarter' not found in dataset",
                },
            ],
            "approach": "agent_upload_no_instruction",
            "columns": ["region", "total"],
        })
    }

    #[test]
    fn decodes_the_full_envelope() {
        let result = AnalysisResult::from_value(&sample_envelope());
        assert_eq!(result.file_id.as_deref(), Some("file_1_1719000000"));
        assert_eq!(result.approach, Some(Approach::Upload));
        assert_eq!(result.personas.len(), 2);
        assert_eq!(result.personas[0].name, "CFO");
        assert_eq!(
            result.personas[0].rationale.as_deref(),
            Some("Owns revenue targets")
        );
        assert_eq!(result.personas[1].rationale, None);
        assert_eq!(
            result.selected_persona.as_ref().map(|p| p.name.as_str()),
            Some("CFO")
        );
        assert_eq!(result.goals.len(), 2);
        assert_eq!(result.goals[1].index, 1);
        assert_eq!(result.columns, vec!["region", "total"]);
        assert_eq!(result.status_line(), "File uploaded and analyzed successfully!");
    }

    #[test]
    fn assigns_a_local_result_id_when_the_wire_has_none() {
        let first = AnalysisResult::from_value(&sample_envelope());
        let second = AnalysisResult::from_value(&sample_envelope());
        assert!(!first.result_id.is_empty());
        assert_ne!(first.result_id, second.result_id);
    }

    #[test]
    fn keeps_the_wire_result_id_when_present() {
        let mut envelope = sample_envelope();
        envelope["result_id"] = json!("res-42");
        let result = AnalysisResult::from_value(&envelope);
        assert_eq!(result.result_id, "res-42");
    }

    #[test]
    fn goal_visualization_falls_back_to_suggested_chart() {
        let envelope = json!({
            "goals": [
                {"question": "A?", "visualization": "Bar chart of totals"},
                {"question": "B?", "suggested_chart": "Pie chart of share"},
            ],
        });
        let result = AnalysisResult::from_value(&envelope);
        assert_eq!(result.goals[0].visualization, "Bar chart of totals");
        assert_eq!(result.goals[1].visualization, "Pie chart of share");
    }

    #[test]
    fn error_precedence_is_preprocess_then_plotly_then_raster() {
        let chart = GoalChart {
            preprocess_error: Some("preprocess failed".to_string()),
            plotly_error: Some("plotly failed".to_string()),
            raster_error: Some("raster failed".to_string()),
            ..GoalChart::default()
        };
        assert_eq!(chart.first_error(), Some("preprocess failed"));

        let chart = GoalChart {
            plotly_error: Some("plotly failed".to_string()),
            raster_error: Some("raster failed".to_string()),
            ..GoalChart::default()
        };
        assert_eq!(chart.first_error(), Some("plotly failed"));
        assert_eq!(
            chart.outcome(),
            ChartOutcome::Failed(ChartFailure::declared("plotly failed"))
        );
    }

    #[test]
    fn structured_payload_is_preferred_over_raster() {
        let chart = GoalChart {
            plotly_data: Some(json!({"data": [{"type": "bar", "x": ["a"], "y": [1]}]})),
            raster_data: Some("data:image/png;base64,AAAA".to_string()),
            ..GoalChart::default()
        };
        assert!(matches!(
            chart.outcome(),
            ChartOutcome::Rendered(RenderableChart::Bar { .. })
        ));

        let raster_only = GoalChart {
            raster_data: Some("data:image/png;base64,AAAA".to_string()),
            ..GoalChart::default()
        };
        assert_eq!(
            raster_only.outcome(),
            ChartOutcome::Rendered(RenderableChart::Image {
                source: "data:image/png;base64,AAAA".to_string(),
            })
        );
    }

    #[test]
    fn chart_without_payload_or_error_is_empty() {
        assert_eq!(GoalChart::default().outcome(), ChartOutcome::Empty);
    }

    #[test]
    fn goal_reports_align_goals_with_charts() {
        let result = AnalysisResult::from_value(&sample_envelope());
        let reports = result.goal_reports();
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            reports[0].outcome,
            ChartOutcome::Rendered(RenderableChart::Bar { .. })
        ));
        assert_eq!(reports[0].rows.len(), 1);
        assert_eq!(
            reports[1].outcome,
            ChartOutcome::Failed(ChartFailure::declared(
                "Column 'quarter' not found in dataset"
            ))
        );
    }

    #[test]
    fn goal_reports_tolerate_length_mismatch() {
        let envelope = json!({
            "goals": [
                {"question": "One?"},
                {"question": "Two?"},
            ],
            "charts": [],
        });
        let reports = AnalysisResult::from_value(&envelope).goal_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].outcome, ChartOutcome::Empty);

        let envelope = json!({
            "goals": [],
            "charts": [{"goal": {"question": "Echoed?"}}],
        });
        let reports = AnalysisResult::from_value(&envelope).goal_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].question, "Echoed?");
    }

    #[test]
    fn short_summary_truncates_with_ellipsis() {
        let mut envelope = sample_envelope();
        envelope["summary_text"] = json!("x".repeat(200));
        let result = AnalysisResult::from_value(&envelope);
        let summary = result.short_summary().unwrap();
        assert_eq!(summary.chars().count(), 153);
        assert!(summary.ends_with("..."));

        envelope["summary_text"] = json!("");
        assert_eq!(AnalysisResult::from_value(&envelope).short_summary(), None);
    }

    #[test]
    fn key_points_are_the_first_three_questions() {
        let envelope = json!({
            "goals": [
                {"question": "A?"},
                {"question": "B?"},
                {"question": "C?"},
                {"question": "D?"},
            ],
        });
        let result = AnalysisResult::from_value(&envelope);
        assert_eq!(result.key_points(), vec!["A?", "B?", "C?"]);
    }

    #[test]
    fn approach_round_trips_and_badges() {
        for approach in [
            Approach::Upload,
            Approach::UploadWithQuery,
            Approach::QueryExisting,
        ] {
            assert_eq!(Approach::from_wire(approach.wire_tag()), Some(approach));
        }
        assert_eq!(Approach::from_wire("something_else"), None);
        assert_eq!(Approach::UploadWithQuery.badge(), "File + Queries");
        assert_eq!(status_line(None), "Analysis completed!");
    }
}
