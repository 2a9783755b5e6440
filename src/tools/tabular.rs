//! Tabular file ingestion: CSV and Excel.

use std::io::Cursor;

use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use serde_json::{json, Map, Value};

use super::{fetch_bytes, Tool};

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Infer a JSON scalar from a CSV field. Empty fields become `null`.
fn infer_value(field: &str) -> Value {
    let field = field.trim();
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = field.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = field.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(field.to_string())
}

/// Parse CSV bytes into records keyed by the header row.
pub fn csv_records(bytes: &[u8], delimiter: u8) -> anyhow::Result<Vec<Map<String, Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = Map::new();
        for (idx, header) in headers.iter().enumerate() {
            record.insert(header.clone(), row.get(idx).map_or(Value::Null, infer_value));
        }
        records.push(record);
    }
    Ok(records)
}

/// Read a CSV file from a path or URL.
pub struct CsvToJson {
    client: reqwest::Client,
}

impl CsvToJson {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for CsvToJson {
    fn name(&self) -> &str {
        "csv_to_json_string"
    }

    fn description(&self) -> &str {
        "Read a CSV file (local path or http(s) URL) and return its rows as a JSON array of records keyed by column name. The separator defaults to ';'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path or URL of the CSV file"
                },
                "sep": {
                    "type": "string",
                    "description": "Single-character field separator (default: ';')"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let location = args["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'file_path' argument"))?;
        let sep = args["sep"].as_str().unwrap_or(";");

        let delimiter = match sep.as_bytes() {
            [b] => *b,
            _ => {
                return Err(anyhow::anyhow!(
                    "sep must be a single ASCII character, got '{}'",
                    sep
                ))
            }
        };

        let bytes = if is_url(location) {
            fetch_bytes(&self.client, location).await?
        } else {
            tokio::fs::read(location)
                .await
                .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", location, e))?
        };

        let records = csv_records(&bytes, delimiter)?;
        tracing::debug!("Parsed {} CSV records from {}", records.len(), location);
        Ok(serde_json::to_string(&records)?)
    }
}

fn cell_to_json(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::String(String::new()),
        Data::Int(i) => json!(i),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(String::new())),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

/// Rows of a sheet as arrays of cells, header row included.
pub fn range_to_rows(range: &Range<Data>) -> Vec<Value> {
    range
        .rows()
        .map(|row| Value::Array(row.iter().map(cell_to_json).collect()))
        .collect()
}

/// First sheet of a workbook, as row arrays.
pub fn first_sheet_rows(bytes: Vec<u8>) -> anyhow::Result<Vec<Value>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| anyhow::anyhow!("Not a readable spreadsheet: {}", e))?;
    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("The workbook has no sheets"))?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| anyhow::anyhow!("Cannot read sheet '{}': {}", first, e))?;
    Ok(range_to_rows(&range))
}

/// Download a spreadsheet and return its first sheet.
pub struct FirstSheetToJson {
    client: reqwest::Client,
}

impl FirstSheetToJson {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for FirstSheetToJson {
    fn name(&self) -> &str {
        "process_first_sheet_to_json_from_url"
    }

    fn description(&self) -> &str {
        "Download an Excel workbook (.xlsx/.xls/.ods) from a URL and return its first sheet as a JSON array of rows, the first row being the header. Empty cells are returned as empty strings."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "URL of the workbook"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;

        let result = async {
            let bytes = fetch_bytes(&self.client, url).await?;
            let rows = tokio::task::spawn_blocking(move || first_sheet_rows(bytes)).await??;
            anyhow::Ok(Value::Array(rows).to_string())
        }
        .await;

        result.map_err(|e| anyhow::anyhow!("Error processing file from URL '{}': {}", url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn csv_fields_are_typed() {
        let data = b"Country;Score;Note\nEgypt;378;\nIreland;577.5;top ten\n";
        let records = csv_records(data, b';').unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Country"], "Egypt");
        assert_eq!(records[0]["Score"], 378);
        assert_eq!(records[0]["Note"], Value::Null);
        assert_eq!(records[1]["Score"], 577.5);
        assert_eq!(records[1]["Note"], "top ten");
    }

    #[test]
    fn short_rows_are_padded_with_null() {
        let records = csv_records(b"a,b\n1\n", b',').unwrap();
        assert_eq!(records[0]["b"], Value::Null);
    }

    #[test]
    fn sheet_cells_map_to_json() {
        let mut range: Range<Data> = Range::new((0, 0), (1, 2));
        range.set_value((0, 0), Data::String("Country".into()));
        range.set_value((0, 1), Data::String("Score".into()));
        range.set_value((0, 2), Data::String("Passed".into()));
        range.set_value((1, 0), Data::String("Brazil".into()));
        range.set_value((1, 1), Data::Float(419.5));
        range.set_value((1, 2), Data::Bool(true));

        let rows = range_to_rows(&range);
        assert_eq!(
            Value::Array(rows),
            json!([["Country", "Score", "Passed"], ["Brazil", 419.5, true]])
        );

        let mut sparse: Range<Data> = Range::new((0, 0), (0, 1));
        sparse.set_value((0, 0), Data::Int(7));
        assert_eq!(range_to_rows(&sparse), vec![json!([7, ""])]);
    }

    #[test]
    fn garbage_is_not_a_workbook() {
        assert!(first_sheet_rows(b"not a spreadsheet".to_vec()).is_err());
    }

    #[tokio::test]
    async fn csv_from_url_and_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scores.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("c|n\nIRL|577\n"))
            .mount(&server)
            .await;

        let tool = CsvToJson::new(reqwest::Client::new());
        let out = tool
            .execute(json!({"file_path": format!("{}/scores.csv", server.uri()), "sep": "|"}))
            .await
            .unwrap();
        assert_eq!(out, r#"[{"c":"IRL","n":577}]"#);

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("local.csv");
        std::fs::write(&file, "x;y\n1;2\n").unwrap();
        let out = tool
            .execute(json!({"file_path": file.to_str().unwrap()}))
            .await
            .unwrap();
        assert_eq!(out, r#"[{"x":1,"y":2}]"#);
    }

    #[tokio::test]
    async fn multi_character_separator_is_rejected() {
        let tool = CsvToJson::new(reqwest::Client::new());
        let err = tool
            .execute(json!({"file_path": "x.csv", "sep": "::"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("single"));
    }

    #[tokio::test]
    async fn sheet_download_errors_name_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"plain text".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/data.xlsx", server.uri());
        let tool = FirstSheetToJson::new(reqwest::Client::new());
        let err = tool.execute(json!({ "url": &url })).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with(&format!("Error processing file from URL '{}'", url)));
    }
}
