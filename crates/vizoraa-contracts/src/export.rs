use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

pub const DEFAULT_EXPORT_FILE_NAME: &str = "processed_data.csv";

/// Serializes row objects to CSV text. The header row is the first row's
/// keys in their original order; every value is JSON-encoded, so strings
/// stay quoted and embedded commas survive a round trip. `null` and missing
/// values become the empty JSON string `""`. Returns `None` for no rows.
pub fn rows_to_csv(rows: &[Map<String, Value>]) -> Option<String> {
    let first = rows.first()?;
    let headers: Vec<String> = first.keys().cloned().collect();
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(headers.join(","));
    for row in rows {
        let fields: Vec<String> = headers
            .iter()
            .map(|header| csv_field(row.get(header)))
            .collect();
        lines.push(fields.join(","));
    }
    Some(lines.join("\n"))
}

/// Writes `rows_to_csv` output to `path`, creating parent directories.
/// Returns `false` (and writes nothing) when there are no rows.
pub fn write_rows_csv(rows: &[Map<String, Value>], path: &Path) -> Result<bool> {
    let Some(csv) = rows_to_csv(rows) else {
        return Ok(false);
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, csv).with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

fn csv_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "\"\"".to_string(),
        Some(value) => value.to_string(),
    }
}
