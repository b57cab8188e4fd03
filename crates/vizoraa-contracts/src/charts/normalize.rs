use serde_json::Value;
use thiserror::Error;

use super::packed::decode_packed_doubles;

/// A chart description ready for a renderer, with all axis data decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderableChart {
    Image {
        source: String,
    },
    Bar {
        title: Option<String>,
        label: String,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    Line {
        title: Option<String>,
        label: String,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    Pie {
        title: Option<String>,
        label: String,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    Scatter {
        title: Option<String>,
        label: String,
        points: Vec<(f64, f64)>,
    },
}

impl RenderableChart {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderableChart::Image { .. } => "image",
            RenderableChart::Bar { .. } => "bar",
            RenderableChart::Line { .. } => "line",
            RenderableChart::Pie { .. } => "pie",
            RenderableChart::Scatter { .. } => "scatter",
        }
    }
}

/// Why a chart payload could not be turned into a [`RenderableChart`].
///
/// `UnsupportedKind` means the payload was well formed but the renderer has
/// no such primitive; `Malformed` means the payload itself is unusable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChartFailure {
    #[error("{message}")]
    Declared { message: String },
    #[error("{kind} chart has no usable '{axis}' data")]
    MissingAxis { kind: String, axis: String },
    #[error("Unsupported chart type: {kind}")]
    UnsupportedKind { kind: String },
    #[error("{message}")]
    Malformed { message: String },
}

impl ChartFailure {
    pub fn declared(message: impl Into<String>) -> Self {
        ChartFailure::Declared {
            message: message.into(),
        }
    }

    fn missing_axis(kind: &str, axis: &str) -> Self {
        ChartFailure::MissingAxis {
            kind: kind.to_string(),
            axis: axis.to_string(),
        }
    }

    fn length_mismatch(kind: &str, first: &str, second: &str) -> Self {
        ChartFailure::Malformed {
            message: format!("{kind} chart '{first}' and '{second}' lengths differ"),
        }
    }
}

/// Outcome of normalizing one chart payload.
///
/// `Empty` is a distinguished non-error: an analysis goal may legitimately
/// produce nothing to render.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartOutcome {
    Rendered(RenderableChart),
    Empty,
    Failed(ChartFailure),
}

/// Normalizes one raw chart payload into a renderer-ready description.
///
/// Accepts the heterogeneous shapes the backend emits: a data-URI string for
/// a pre-rendered raster, or a Plotly-style `{data, layout}` object whose
/// axes may be inline arrays or packed base64 buffers. Total function: never
/// panics, never mutates the payload.
pub fn normalize(payload: &Value) -> ChartOutcome {
    if let Some(message) = declared_error(payload) {
        return ChartOutcome::Failed(ChartFailure::Declared { message });
    }
    if let Value::String(source) = payload {
        if source.trim().is_empty() {
            return ChartOutcome::Empty;
        }
        return ChartOutcome::Rendered(RenderableChart::Image {
            source: source.clone(),
        });
    }
    let Some(trace) = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|traces| traces.first())
    else {
        return ChartOutcome::Empty;
    };
    let title = chart_title(payload.get("layout"));
    match structured_chart(trace, title) {
        Ok(chart) => ChartOutcome::Rendered(chart),
        Err(failure) => ChartOutcome::Failed(failure),
    }
}

fn structured_chart(
    trace: &Value,
    title: Option<String>,
) -> Result<RenderableChart, ChartFailure> {
    let kind = trace
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    match kind {
        "bar" | "line" => categorical_chart(trace, kind, title),
        "pie" => pie_chart(trace, title),
        "scatter" | "scattergl" => scatter_chart(trace, title),
        "" => Err(ChartFailure::Malformed {
            message: "trace declares no chart type".to_string(),
        }),
        other => Err(ChartFailure::UnsupportedKind {
            kind: other.to_string(),
        }),
    }
}

fn categorical_chart(
    trace: &Value,
    kind: &str,
    title: Option<String>,
) -> Result<RenderableChart, ChartFailure> {
    let labels = extract_axis(trace, "x")?
        .as_ref()
        .map(axis_labels)
        .unwrap_or_default();
    if labels.is_empty() {
        return Err(ChartFailure::missing_axis(kind, "x"));
    }
    let values = extract_axis(trace, "y")?
        .as_ref()
        .and_then(axis_numbers)
        .unwrap_or_default();
    if values.is_empty() {
        return Err(ChartFailure::missing_axis(kind, "y"));
    }
    if labels.len() != values.len() {
        return Err(ChartFailure::length_mismatch(kind, "x", "y"));
    }
    let label = series_label(trace, "Dataset");
    Ok(if kind == "bar" {
        RenderableChart::Bar {
            title,
            label,
            labels,
            values,
        }
    } else {
        RenderableChart::Line {
            title,
            label,
            labels,
            values,
        }
    })
}

fn pie_chart(trace: &Value, title: Option<String>) -> Result<RenderableChart, ChartFailure> {
    // Fall back to the generic axes only when the pie fields are absent; an
    // empty `labels` array is still the pie fields, and fails validation.
    let label_axis = match extract_axis(trace, "labels")? {
        Some(axis) => Some(axis),
        None => extract_axis(trace, "x")?,
    };
    let value_axis = match extract_axis(trace, "values")? {
        Some(axis) => Some(axis),
        None => extract_axis(trace, "y")?,
    };
    let labels = label_axis.as_ref().map(axis_labels).unwrap_or_default();
    if labels.is_empty() {
        return Err(ChartFailure::missing_axis("pie", "labels"));
    }
    let values = value_axis.as_ref().and_then(axis_numbers).unwrap_or_default();
    if values.is_empty() {
        return Err(ChartFailure::missing_axis("pie", "values"));
    }
    if labels.len() != values.len() {
        return Err(ChartFailure::length_mismatch("pie", "labels", "values"));
    }
    Ok(RenderableChart::Pie {
        title,
        label: series_label(trace, "Dataset"),
        labels,
        values,
    })
}

fn scatter_chart(trace: &Value, title: Option<String>) -> Result<RenderableChart, ChartFailure> {
    let xs = extract_axis(trace, "x")?
        .as_ref()
        .and_then(axis_numbers)
        .unwrap_or_default();
    if xs.is_empty() {
        return Err(ChartFailure::missing_axis("scatter", "x"));
    }
    let ys = extract_axis(trace, "y")?
        .as_ref()
        .and_then(axis_numbers)
        .unwrap_or_default();
    if ys.is_empty() {
        return Err(ChartFailure::missing_axis("scatter", "y"));
    }
    if xs.len() != ys.len() {
        return Err(ChartFailure::length_mismatch("scatter", "x", "y"));
    }
    Ok(RenderableChart::Scatter {
        title,
        label: series_label(trace, "Scatter Dataset"),
        points: xs.into_iter().zip(ys).collect(),
    })
}

enum Axis {
    Inline(Vec<Value>),
    Packed(Vec<f64>),
}

fn extract_axis(trace: &Value, key: &str) -> Result<Option<Axis>, ChartFailure> {
    match trace.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(Axis::Inline(items.clone()))),
        Some(Value::Object(fields)) => match fields.get("bdata").and_then(Value::as_str) {
            Some(encoded) => decode_packed_doubles(encoded)
                .map(|values| Some(Axis::Packed(values)))
                .map_err(|_| ChartFailure::Malformed {
                    message: format!("malformed packed data on '{key}' axis"),
                }),
            None => Ok(None),
        },
        // Scalars are treated as absent, not coerced.
        Some(_) => Ok(None),
    }
}

fn axis_labels(axis: &Axis) -> Vec<String> {
    match axis {
        Axis::Inline(items) => items.iter().map(label_text).collect(),
        Axis::Packed(values) => values.iter().map(|value| value.to_string()).collect(),
    }
}

fn axis_numbers(axis: &Axis) -> Option<Vec<f64>> {
    match axis {
        Axis::Packed(values) => Some(values.clone()),
        Axis::Inline(items) => items.iter().map(Value::as_f64).collect(),
    }
}

fn label_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn series_label(trace: &Value, fallback: &str) -> String {
    trace
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

fn chart_title(layout: Option<&Value>) -> Option<String> {
    let title = layout?.get("title")?;
    let text = match title {
        Value::String(text) => text.as_str(),
        other => other.get("text").and_then(Value::as_str)?,
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn declared_error(payload: &Value) -> Option<String> {
    payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}
