use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use trellis_core::value::Page;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

fn headers_of(page: &Page) -> Vec<String> {
    page.schema()
        .columns
        .iter()
        .map(|column| column.name.clone())
        .collect()
}

/// Export the resident page as CSV, one line per row plus a header line.
pub fn export_page_to_csv(path: &Path, page: &Page) -> Result<usize, ExportError> {
    let headers = headers_of(page);
    let mut content = String::new();
    content.push_str(
        &headers
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in page.rows() {
        let rendered = row
            .values
            .iter()
            .map(|value| csv_escape(&value.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        content.push_str(&rendered);
        content.push('\n');
    }

    fs::write(path, content).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(page.len())
}

fn page_to_json_records(page: &Page) -> Vec<JsonValue> {
    let headers = headers_of(page);
    let mut records = Vec::with_capacity(page.len());
    for row in page.rows() {
        let mut object = Map::with_capacity(headers.len());
        for (column_index, header) in headers.iter().enumerate() {
            let value = row
                .values
                .get(column_index)
                .map_or(JsonValue::Null, |value| {
                    if value.is_null() {
                        JsonValue::Null
                    } else {
                        json!(value.to_string())
                    }
                });
            object.insert(header.clone(), value);
        }
        records.push(JsonValue::Object(object));
    }
    records
}

/// Export the resident page as a JSON array of objects keyed by column
/// name.
pub fn export_page_to_json(path: &Path, page: &Page) -> Result<usize, ExportError> {
    let payload = serde_json::to_string_pretty(&page_to_json_records(page))?;
    fs::write(path, payload).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(page.len())
}

/// Gzip-compressed JSON export for large pages.
pub fn export_page_to_json_gz(path: &Path, page: &Page) -> Result<usize, ExportError> {
    let payload = serde_json::to_vec(&page_to_json_records(page))?;

    let write_error = |source| ExportError::Write {
        path: path.display().to_string(),
        source,
    };
    let file = File::create(path).map_err(write_error)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&payload).map_err(write_error)?;
    encoder.finish().map_err(write_error)?;
    Ok(page.len())
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;
    use std::sync::Arc;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;
    use trellis_core::value::{Column, Page, Row, TableSchema, Value};

    use super::{export_page_to_csv, export_page_to_json, export_page_to_json_gz};

    fn sample_page() -> Page {
        let schema = Arc::new(TableSchema::new(vec![
            Column::new("id", "bigint").primary_key(),
            Column::new("name", "varchar(64)"),
        ]));
        Page::new(
            schema,
            0,
            vec![
                Row::new(vec![Value::Integer(1), Value::Text("alpha".to_string())]),
                Row::new(vec![
                    Value::Integer(2),
                    Value::Text("quote \"name\"".to_string()),
                ]),
                Row::new(vec![Value::Integer(3), Value::Null]),
            ],
        )
        .expect("page should build")
    }

    #[test]
    fn exports_page_to_csv_with_header_and_escaping() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.csv");

        let written = export_page_to_csv(&path, &sample_page()).expect("csv export failed");
        assert_eq!(written, 3);
        let output = fs::read_to_string(path).expect("failed to read csv output");
        assert!(output.starts_with("id,name\n"));
        assert!(output.contains("2,\"quote \"\"name\"\"\""));
        assert!(output.contains("3,NULL"));
    }

    #[test]
    fn exports_page_to_json_objects_by_column_name() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.json");

        let written = export_page_to_json(&path, &sample_page()).expect("json export failed");
        assert_eq!(written, 3);
        let output = fs::read_to_string(path).expect("failed to read json output");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(parsed[0]["id"], "1");
        assert_eq!(parsed[0]["name"], "alpha");
        assert_eq!(parsed[2]["name"], serde_json::Value::Null);
    }

    #[test]
    fn gzip_export_roundtrips_through_a_decoder() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.json.gz");

        let written = export_page_to_json_gz(&path, &sample_page()).expect("gz export failed");
        assert_eq!(written, 3);

        let compressed = fs::File::open(path).expect("failed to open gz output");
        let mut decoder = GzDecoder::new(compressed);
        let mut output = String::new();
        decoder
            .read_to_string(&mut output)
            .expect("failed to decompress");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(parsed[1]["id"], "2");
    }
}
