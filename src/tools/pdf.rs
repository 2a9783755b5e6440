//! PDF retrieval: relevant paragraphs and layout tables.
//!
//! Text extraction shells out to poppler's `pdftotext`, which must be on PATH.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{fetch_bytes, Tool};

const PDFTOTEXT: &str = "pdftotext";
const DEFAULT_TOP_N: usize = 2;

/// Page selection for `pdftotext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pages {
    All,
    Single(u32),
}

impl Pages {
    fn from_arg(value: &Value) -> anyhow::Result<Self> {
        match value {
            Value::Null => Ok(Pages::All),
            Value::String(s) if s.trim().eq_ignore_ascii_case("all") => Ok(Pages::All),
            Value::String(s) => s
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .map(Pages::Single)
                .ok_or_else(|| anyhow::anyhow!("pages must be 'all' or a page number, got '{}'", s)),
            Value::Number(n) => n
                .as_u64()
                .filter(|n| *n > 0)
                .and_then(|n| u32::try_from(n).ok())
                .map(Pages::Single)
                .ok_or_else(|| anyhow::anyhow!("pages must be a positive page number")),
            _ => Err(anyhow::anyhow!("pages must be 'all' or a page number")),
        }
    }
}

/// Extract text from PDF bytes. Pages are separated by form feeds.
pub(crate) async fn pdf_to_text(bytes: &[u8], layout: bool, pages: Pages) -> anyhow::Result<String> {
    let dir = tempfile::tempdir()?;
    let pdf_path = dir.path().join("document.pdf");
    tokio::fs::write(&pdf_path, bytes).await?;

    let mut cmd = Command::new(PDFTOTEXT);
    cmd.arg("-q").arg("-enc").arg("UTF-8");
    if layout {
        cmd.arg("-layout");
    }
    if let Pages::Single(page) = pages {
        cmd.arg("-f").arg(page.to_string()).arg("-l").arg(page.to_string());
    }

    let output = cmd
        .arg(&pdf_path)
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("{} is not available: {}", PDFTOTEXT, e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "Could not extract text from PDF: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split extracted text into trimmed, non-empty paragraphs.
///
/// Paragraphs end at blank lines and at page breaks; line wraps inside a
/// paragraph are joined with spaces.
pub fn split_into_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    for page in text.split('\u{c}') {
        let mut current: Vec<&str> = Vec::new();
        for line in page.lines() {
            let line = line.trim();
            if line.is_empty() {
                if !current.is_empty() {
                    paragraphs.push(current.join(" "));
                    current.clear();
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join(" "));
        }
    }
    paragraphs
}

fn term_counts(text: &str) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        *counts.entry(word.to_lowercase()).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm = |v: &HashMap<String, f64>| v.values().map(|x| x * x).sum::<f64>().sqrt();
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// The `top_n` paragraphs most similar to `query`, best first.
///
/// Ties keep document order.
pub fn rank_paragraphs<'a>(paragraphs: &'a [String], query: &str, top_n: usize) -> Vec<&'a str> {
    let query_terms = term_counts(query);
    let mut scored: Vec<(f64, &str)> = paragraphs
        .iter()
        .map(|p| (cosine(&query_terms, &term_counts(p)), p.as_str()))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(top_n).map(|(_, p)| p).collect()
}

/// Split a layout line into cells separated by runs of two or more spaces.
fn split_cells(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut spaces = 0;
    for c in line.trim().chars() {
        if c == ' ' {
            spaces += 1;
            continue;
        }
        if spaces >= 2 && !current.is_empty() {
            cells.push(std::mem::take(&mut current));
        } else if spaces == 1 {
            current.push(' ');
        }
        spaces = 0;
        current.push(c);
    }
    if !current.is_empty() {
        cells.push(current);
    }
    cells
}

/// Detect tables in layout-preserved text.
///
/// A table is a run of at least two consecutive lines that each split into
/// two or more cells. Rows shorter than the widest row are padded with `""`.
pub fn detect_tables(text: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    let mut flush = |current: &mut Vec<Vec<String>>| {
        if current.len() >= 2 {
            let width = current.iter().map(Vec::len).max().unwrap_or(0);
            let mut table = std::mem::take(current);
            for row in &mut table {
                row.resize(width, String::new());
            }
            tables.push(table);
        } else {
            current.clear();
        }
    };

    for line in text.lines() {
        let line = line.trim_start_matches('\u{c}');
        let cells = split_cells(line);
        if cells.len() >= 2 {
            current.push(cells);
        } else {
            flush(&mut current);
        }
    }
    flush(&mut current);
    tables
}

fn required_str<'a>(args: &'a Value, name: &str) -> anyhow::Result<&'a str> {
    args[name]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
}

/// Most relevant paragraphs of a PDF for a query.
pub struct TopParagraphsFromPdf {
    client: reqwest::Client,
}

impl TopParagraphsFromPdf {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for TopParagraphsFromPdf {
    fn name(&self) -> &str {
        "extract_top_paragraphs_from_url"
    }

    fn description(&self) -> &str {
        "Download a PDF (e.g. a PIRLS 2021 report chapter) and return the paragraphs most relevant to a query. Use to ground answers in the published reports."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pdf_url": {
                    "type": "string",
                    "description": "URL of the PDF document"
                },
                "user_input": {
                    "type": "string",
                    "description": "Text to match paragraphs against"
                },
                "top_n": {
                    "type": "integer",
                    "description": "Number of paragraphs to return (default: 2)"
                }
            },
            "required": ["pdf_url", "user_input"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let pdf_url = required_str(&args, "pdf_url")?;
        let query = required_str(&args, "user_input")?;
        let top_n = args["top_n"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_TOP_N);

        tracing::info!("Extracting paragraphs from {}", pdf_url);
        let bytes = fetch_bytes(&self.client, pdf_url).await?;
        let text = pdf_to_text(&bytes, false, Pages::All).await?;

        let paragraphs = split_into_paragraphs(&text);
        if paragraphs.is_empty() {
            return Err(anyhow::anyhow!("No text could be extracted from {}", pdf_url));
        }

        let top = rank_paragraphs(&paragraphs, query, top_n);
        Ok(serde_json::to_string(&top)?)
    }
}

/// Tables found in a PDF's page layout.
pub struct TablesFromPdf {
    client: reqwest::Client,
}

impl TablesFromPdf {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for TablesFromPdf {
    fn name(&self) -> &str {
        "extract_tables_from_pdf_url"
    }

    fn description(&self) -> &str {
        "Download a PDF and extract its tables as JSON (a list of tables, each a list of rows of cell strings). Restrict to one page when the document is large."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pdf_url": {
                    "type": "string",
                    "description": "URL of the PDF document"
                },
                "pages": {
                    "type": "string",
                    "description": "'all' (default) or a single page number"
                }
            },
            "required": ["pdf_url"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let pdf_url = required_str(&args, "pdf_url")?;
        let pages = Pages::from_arg(&args["pages"])?;

        let bytes = fetch_bytes(&self.client, pdf_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to download PDF: {}", e))?;
        let text = pdf_to_text(&bytes, true, pages).await?;

        let tables = detect_tables(&text);
        if tables.is_empty() {
            return Ok("No tables found in the PDF.".to_string());
        }
        tracing::debug!("Found {} tables in {}", tables.len(), pdf_url);
        Ok(super::truncate_output(&serde_json::to_string(&tables)?, 20_000))
    }
}
