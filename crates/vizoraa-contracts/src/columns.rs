use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Best-effort local column preview, shown at attach time. CSV reads the
/// header line; JSON reads the keys of the first element (or of the document
/// itself). Everything else, Excel included, has no local preview and goes
/// through the backend's column-extraction endpoint instead.
pub fn sniff_columns(path: &Path) -> Result<Vec<String>> {
    match extension_of(path).as_str() {
        "csv" => sniff_csv(path),
        "json" => sniff_json(path),
        other if other.is_empty() => bail!("no local column preview for {}", path.display()),
        other => bail!("no local column preview for '{other}' files"),
    }
}

/// Dataset extensions the service accepts.
pub fn is_supported_dataset(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "csv" | "json" | "xlsx" | "xls")
}

/// Media type declared when uploading a dataset. Unknown extensions upload
/// as CSV, matching the service's default.
pub fn media_type_for_path(path: &Path) -> &'static str {
    match extension_of(path).as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        _ => "application/csv",
    }
}

// Reads only the header line, so attaching a large dataset does not buffer
// the whole file a second time ahead of the multipart upload.
fn sniff_csv(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut header = String::new();
    BufReader::new(file)
        .read_line(&mut header)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(header
        .trim_end_matches(['\n', '\r'])
        .split(',')
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect())
}

fn sniff_json(path: &Path) -> Result<Vec<String>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let fields = match &value {
        Value::Array(items) => items.first().and_then(Value::as_object),
        Value::Object(fields) => Some(fields),
        _ => None,
    };
    Ok(fields
        .map(|fields| fields.keys().cloned().collect())
        .unwrap_or_default())
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn csv_header_is_split_and_trimmed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sales.csv");
        fs::write(&path, "region , total,\nnorth,5,\n")?;
        assert_eq!(sniff_columns(&path)?, vec!["region", "total"]);
        Ok(())
    }

    #[test]
    fn csv_sniff_stops_at_the_header_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mixed.csv");
        // Bytes past the header are never read, so they may be anything,
        // including invalid UTF-8.
        let mut bytes = b"region,total\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, 0x00]);
        fs::write(&path, bytes)?;
        assert_eq!(sniff_columns(&path)?, vec!["region", "total"]);
        Ok(())
    }

    #[test]
    fn json_array_uses_the_first_element_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sales.json");
        fs::write(&path, r#"[{"region": "north", "total": 5}, {"region": "south"}]"#)?;
        assert_eq!(sniff_columns(&path)?, vec!["region", "total"]);
        Ok(())
    }

    #[test]
    fn json_object_uses_its_own_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("totals.json");
        fs::write(&path, r#"{"north": 5, "south": 3}"#)?;
        assert_eq!(sniff_columns(&path)?, vec!["north", "south"]);
        Ok(())
    }

    #[test]
    fn json_scalar_has_no_columns() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("count.json");
        fs::write(&path, "42")?;
        assert!(sniff_columns(&path)?.is_empty());
        Ok(())
    }

    #[test]
    fn excel_has_no_local_preview() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sales.xlsx");
        fs::write(&path, b"not actually a workbook")?;
        let err = sniff_columns(&path).unwrap_err();
        assert!(err.to_string().contains("xlsx"));
        Ok(())
    }

    #[test]
    fn media_types_cover_the_dataset_extensions() {
        assert_eq!(media_type_for_path(Path::new("a.csv")), "text/csv");
        assert_eq!(media_type_for_path(Path::new("a.JSON")), "application/json");
        assert_eq!(media_type_for_path(Path::new("a.parquet")), "application/csv");
        // Only extensions the attach path accepts get a dedicated type.
        assert_eq!(media_type_for_path(Path::new("notes.txt")), "application/csv");
    }

    #[test]
    fn only_dataset_extensions_are_supported() {
        assert!(is_supported_dataset(Path::new("sales.csv")));
        assert!(is_supported_dataset(Path::new("sales.XLSX")));
        assert!(!is_supported_dataset(Path::new("notes.txt")));
        assert!(!is_supported_dataset(Path::new("archive")));
    }
}
