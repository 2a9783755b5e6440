//! Plots rendered with matplotlib/seaborn and uploaded to object storage.
//!
//! SECURITY: `custom_plot_from_string_to_s3` executes arbitrary code supplied
//! by the model with the privileges of the agent process. It is bounded by a
//! timeout only and is not sandboxed. Only register it in environments where
//! that is acceptable. `flexible_plot_from_dict_to_s3` runs a fixed script on
//! validated parameters instead.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::storage::ObjectStore;
use super::Tool;
use crate::config::PlotConfig;

/// Exit codes of the runner scripts. Script errors exit with 2.
const EXIT_NO_FIG: i32 = 3;
const EXIT_SAVE_FAILED: i32 = 4;

/// Runs the user code in a fresh namespace and saves its `fig` as PNG.
/// argv: runner.py <output.png> <code.py>
const CODE_RUNNER: &str = r#"import sys

import matplotlib
matplotlib.use("Agg")

scope = {"__name__": "__plot__"}
try:
    with open(sys.argv[2], encoding="utf-8") as source:
        exec(compile(source.read(), "plot_code", "exec"), scope)
except Exception as exc:
    print(f"{type(exc).__name__}: {exc}", file=sys.stderr)
    sys.exit(2)

fig = scope.get("fig")
if fig is None:
    sys.exit(3)

try:
    fig.savefig(sys.argv[1], format="png")
except Exception as exc:
    print(f"{type(exc).__name__}: {exc}", file=sys.stderr)
    sys.exit(4)
"#;

/// Draws a validated `PlotSpec` with seaborn and saves it as PNG.
/// argv: runner.py <output.png> <spec.json>
const SPEC_RUNNER: &str = r#"import json
import sys

import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt
import pandas as pd
import seaborn as sns

try:
    with open(sys.argv[2], encoding="utf-8") as source:
        spec = json.load(source)
    df = pd.DataFrame(spec["data"])
    kind, x, y, hue = spec["plot_type"], spec["x"], spec["y"], spec.get("hue")

    sns.set_palette("pastel")
    fig, ax = plt.subplots(figsize=(10, 6))
    if kind == "heatmap":
        sns.heatmap(df.pivot(index=y, columns=x), ax=ax)
    elif kind == "bar":
        if spec["horizontal"]:
            sns.barplot(data=df, x=y, y=x, hue=hue, ax=ax)
        else:
            sns.barplot(data=df, x=x, y=y, hue=hue, ax=ax)
    elif kind == "scatter":
        sns.scatterplot(data=df, x=x, y=y, hue=hue, ax=ax)
    elif kind == "line":
        sns.lineplot(data=df, x=x, y=y, hue=hue, ax=ax)
    elif kind == "box":
        sns.boxplot(data=df, x=x, y=y, hue=hue, ax=ax)
    elif kind == "violin":
        sns.violinplot(data=df, x=x, y=y, hue=hue, ax=ax)
    elif kind == "hist":
        sns.histplot(data=df, x=x, hue=hue, ax=ax)

    labels = spec.get("labels")
    if labels and kind in ("scatter", "line"):
        for _, row in df.iterrows():
            ax.annotate(str(row[labels]), (row[x], row[y]),
                        textcoords="offset points", xytext=(4, 4), fontsize=8)

    if spec.get("title"):
        ax.set_title(spec["title"])
    if spec.get("xlabel"):
        ax.set_xlabel(spec["xlabel"])
    if spec.get("ylabel"):
        ax.set_ylabel(spec["ylabel"])
    if spec["rotate_labels"]:
        plt.setp(ax.get_xticklabels(), rotation=spec["rotate_labels"], ha="right")
    if spec["adjust_labels"]:
        fig.autofmt_xdate()
    fig.tight_layout()
except Exception as exc:
    print(f"{type(exc).__name__}: {exc}", file=sys.stderr)
    sys.exit(2)

try:
    fig.savefig(sys.argv[1], format="png")
except Exception as exc:
    print(f"{type(exc).__name__}: {exc}", file=sys.stderr)
    sys.exit(4)
"#;

/// Python interpreter running one runner script per plot.
struct PythonRenderer {
    program: String,
    program_args: Vec<String>,
    timeout: Duration,
}

impl PythonRenderer {
    /// `config.python` may carry leading arguments, e.g. `uv run python`.
    fn new(config: &PlotConfig) -> Self {
        let mut parts = config.python.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "python3".to_string());
        Self {
            program,
            program_args: parts.collect(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Run `script` on `input` in a temp dir and return the PNG it wrote.
    /// `stage` names the step in execution error messages.
    async fn render(&self, script: &str, input: &str, stage: &str) -> anyhow::Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let runner_path = dir.path().join("runner.py");
        let input_path = dir.path().join("plot_input");
        let output_path = dir.path().join("figure.png");

        tokio::fs::write(&runner_path, script).await?;
        tokio::fs::write(&input_path, input).await?;

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.program_args)
                .arg(&runner_path)
                .arg(&output_path)
                .arg(&input_path)
                .current_dir(dir.path())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Error during {}: timed out after {} seconds",
                stage,
                self.timeout.as_secs()
            )
        })?
        .map_err(|e| anyhow::anyhow!("Failed to start {}: {}", self.program, e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = super::truncate_output(stderr.trim(), 2000);

        match output.status.code() {
            Some(0) => {}
            Some(EXIT_NO_FIG) => {
                return Err(anyhow::anyhow!("The code did not produce a 'fig' object."))
            }
            Some(EXIT_SAVE_FAILED) => {
                return Err(anyhow::anyhow!("Error during plot saving: {}", detail))
            }
            _ => return Err(anyhow::anyhow!("Error during {}: {}", stage, detail)),
        }

        tokio::fs::read(&output_path)
            .await
            .map_err(|_| anyhow::anyhow!("Error during plot saving: no image was written"))
    }
}

async fn upload_png(store: &dyn ObjectStore, prefix: &str, png: Vec<u8>) -> anyhow::Result<String> {
    let key = format!("{}/{}.png", prefix, uuid::Uuid::new_v4());
    let url = store
        .put(&key, png, "image/png")
        .await
        .map_err(|e| anyhow::anyhow!("Error during S3 upload: {}", e))?;
    tracing::info!("Plot uploaded to {}", url);
    Ok(url)
}

/// Execute plotting code and upload the resulting figure.
pub struct CustomPlotToS3 {
    store: Arc<dyn ObjectStore>,
    renderer: PythonRenderer,
}

impl CustomPlotToS3 {
    pub fn new(store: Arc<dyn ObjectStore>, config: &PlotConfig) -> Self {
        Self {
            store,
            renderer: PythonRenderer::new(config),
        }
    }
}

/// Strip the common leading whitespace from every non-blank line.
fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    code.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for CustomPlotToS3 {
    fn name(&self) -> &str {
        "custom_plot_from_string_to_s3"
    }

    fn description(&self) -> &str {
        "Execute Python plotting code (matplotlib/seaborn/pandas) and upload the figure, returning its public URL. The code must assign the figure to a variable named 'fig' (a matplotlib Figure or seaborn grid). Embed the data directly in the code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plot_code_string": {
                    "type": "string",
                    "description": "Python code that builds the plot and assigns it to 'fig'"
                }
            },
            "required": ["plot_code_string"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let code = args["plot_code_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'plot_code_string' argument"))?;

        tracing::info!("Executing plot code ({} bytes)", code.len());
        let png = self
            .renderer
            .render(CODE_RUNNER, &dedent(code), "plot code execution")
            .await?;
        upload_png(self.store.as_ref(), "seaborn_charts", png).await
    }
}

const PLOT_TYPES: [&str; 7] = ["scatter", "line", "bar", "hist", "box", "violin", "heatmap"];

/// Validated parameters of a structured plot.
#[derive(Debug, Serialize)]
struct PlotSpec {
    plot_type: String,
    data: Map<String, Value>,
    x: String,
    y: String,
    hue: Option<String>,
    labels: Option<String>,
    rotate_labels: i64,
    adjust_labels: bool,
    horizontal: bool,
    title: Option<String>,
    xlabel: Option<String>,
    ylabel: Option<String>,
}

fn optional_string(params: &Map<String, Value>, name: &str) -> anyhow::Result<Option<String>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(anyhow::anyhow!("'{}' must be a string.", name)),
    }
}

impl PlotSpec {
    /// Accepts the parameters directly, under `plot_params`, or JSON-encoded.
    fn from_args(args: Value) -> anyhow::Result<Self> {
        let mut input = args;
        let params = loop {
            input = match input {
                Value::Object(mut map) if map.contains_key("plot_params") => {
                    map.remove("plot_params").unwrap_or(Value::Null)
                }
                Value::String(s) => serde_json::from_str(&s).map_err(|_| {
                    anyhow::anyhow!("plot_params string could not be parsed as a dictionary.")
                })?,
                Value::Object(map) => break map,
                _ => return Err(anyhow::anyhow!("plot_params must be a dictionary.")),
            };
        };

        let plot_type = match params.get("plot_type") {
            None | Some(Value::Null) => "scatter".to_string(),
            Some(Value::String(s)) => s.trim().to_lowercase(),
            Some(_) => return Err(anyhow::anyhow!("'plot_type' must be a string.")),
        };
        if !PLOT_TYPES.contains(&plot_type.as_str()) {
            return Err(anyhow::anyhow!(
                "Unsupported plot_type '{}'. Use one of: {}.",
                plot_type,
                PLOT_TYPES.join(", ")
            ));
        }

        let data = match params.get("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(_) => return Err(anyhow::anyhow!("'data' must be a dictionary of column lists.")),
        };
        let mut lengths = data.values().map(|column| match column {
            Value::Array(values) => Ok(values.len()),
            _ => Err(anyhow::anyhow!("Every 'data' column must be a list of values.")),
        });
        if let Some(first) = lengths.next().transpose()? {
            for len in lengths {
                if len? != first {
                    return Err(anyhow::anyhow!("All 'data' columns must have the same length."));
                }
            }
        }

        let (x, y) = match (params.get("x"), params.get("y")) {
            (Some(x), Some(y)) if !x.is_null() && !y.is_null() => (x, y),
            _ => return Err(anyhow::anyhow!("'x' and 'y' columns must be provided.")),
        };
        let (x, y) = match (x, y) {
            (Value::String(x), Value::String(y)) => (x.clone(), y.clone()),
            _ if plot_type == "heatmap" => {
                return Err(anyhow::anyhow!(
                    "'x' and 'y' for heatmap must be single column names, not lists."
                ))
            }
            _ => return Err(anyhow::anyhow!("'x' and 'y' must be column names.")),
        };
        if !data.contains_key(&x) || !data.contains_key(&y) {
            return Err(anyhow::anyhow!(
                "The column '{}' or '{}' does not exist in the data.",
                x,
                y
            ));
        }

        let hue = optional_string(&params, "hue")?;
        let labels = optional_string(&params, "labels")?;
        for column in hue.iter().chain(labels.iter()) {
            if !data.contains_key(column) {
                return Err(anyhow::anyhow!(
                    "The column '{}' does not exist in the data.",
                    column
                ));
            }
        }

        let horizontal = params
            .get("horizontal")
            .and_then(Value::as_bool)
            .unwrap_or(plot_type == "bar");

        Ok(Self {
            data,
            x,
            y,
            hue,
            labels,
            rotate_labels: params.get("rotate_labels").and_then(Value::as_i64).unwrap_or(0),
            adjust_labels: params
                .get("adjust_labels")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            horizontal,
            title: optional_string(&params, "title")?,
            xlabel: optional_string(&params, "xlabel")?,
            ylabel: optional_string(&params, "ylabel")?,
            plot_type,
        })
    }
}

/// Draw a plot from column data and parameters, then upload it.
pub struct FlexiblePlotToS3 {
    store: Arc<dyn ObjectStore>,
    renderer: PythonRenderer,
}

impl FlexiblePlotToS3 {
    pub fn new(store: Arc<dyn ObjectStore>, config: &PlotConfig) -> Self {
        Self {
            store,
            renderer: PythonRenderer::new(config),
        }
    }
}

#[async_trait]
impl Tool for FlexiblePlotToS3 {
    fn name(&self) -> &str {
        "flexible_plot_from_dict_to_s3"
    }

    fn description(&self) -> &str {
        "Draw a seaborn plot from column data and upload it, returning its public URL. Supported plot types: scatter, line, bar, hist, box, violin, heatmap. Bar charts are horizontal unless 'horizontal' is false. Prefer this over custom plotting code for standard charts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plot_params": {
                    "type": "object",
                    "description": "Plot parameters",
                    "properties": {
                        "plot_type": {"type": "string", "enum": PLOT_TYPES, "description": "Plot type (default: scatter)"},
                        "data": {"type": "object", "description": "Column name to list of values, all lists of equal length"},
                        "x": {"type": "string", "description": "Column for the x-axis"},
                        "y": {"type": "string", "description": "Column for the y-axis"},
                        "hue": {"type": "string", "description": "Column for color grouping"},
                        "labels": {"type": "string", "description": "Column used to label points (scatter and line)"},
                        "rotate_labels": {"type": "integer", "description": "Rotation of x-axis labels in degrees"},
                        "adjust_labels": {"type": "boolean", "description": "Auto-adjust x-axis label spacing"},
                        "horizontal": {"type": "boolean", "description": "Horizontal bars (default: true for bar)"},
                        "title": {"type": "string"},
                        "xlabel": {"type": "string"},
                        "ylabel": {"type": "string"}
                    },
                    "required": ["plot_type", "data", "x", "y"]
                }
            },
            "required": ["plot_params"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let spec = PlotSpec::from_args(args)?;
        tracing::info!(
            "Rendering {} plot of {} by {}",
            spec.plot_type,
            spec.y,
            spec.x
        );

        let input = serde_json::to_string(&spec)?;
        let png = self
            .renderer
            .render(SPEC_RUNNER, &input, "plot rendering")
            .await?;
        upload_png(self.store.as_ref(), "flexible_charts", png).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::storage::StorageError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            _content_type: &str,
        ) -> Result<String, StorageError> {
            self.objects.lock().unwrap().push((key.to_string(), body));
            Ok(format!("https://bucket.example/{}", key))
        }
    }

    fn tool(python: &str, store: Arc<MemoryStore>) -> CustomPlotToS3 {
        CustomPlotToS3::new(
            store,
            &PlotConfig {
                python: python.to_string(),
                timeout_secs: 10,
            },
        )
    }

    /// A stand-in interpreter: `sh <script> runner.py out.png code.py`.
    fn fake_interpreter(dir: &tempfile::TempDir, body: &str) -> String {
        let script = dir.path().join("fake_python.sh");
        std::fs::write(&script, body).unwrap();
        format!("sh {}", script.display())
    }

    #[test]
    fn dedent_strips_common_indent() {
        let code = "\n    import seaborn as sns\n\n    if True:\n        fig = 1\n";
        assert_eq!(dedent(code), "\nimport seaborn as sns\n\nif True:\n    fig = 1");
    }

    #[tokio::test]
    async fn uploads_rendered_png() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(&dir, "printf 'PNGDATA' > \"$2\"\n");
        let store = Arc::new(MemoryStore::default());

        let url = tool(&python, store.clone())
            .execute(json!({"plot_code_string": "fig = make_plot()"}))
            .await
            .unwrap();

        assert!(url.starts_with("https://bucket.example/seaborn_charts/"));
        assert!(url.ends_with(".png"));
        let objects = store.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].1, b"PNGDATA".to_vec());
    }

    #[tokio::test]
    async fn missing_fig_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(&dir, "exit 3\n");
        let store = Arc::new(MemoryStore::default());

        let err = tool(&python, store.clone())
            .execute(json!({"plot_code_string": "x = 1"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The code did not produce a 'fig' object.");
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_code_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(&dir, "echo 'NameError: name sns is not defined' >&2\nexit 2\n");

        let err = tool(&python, Arc::new(MemoryStore::default()))
            .execute(json!({"plot_code_string": "fig = sns.plot()"}))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error during plot code execution: NameError: name sns is not defined"
        );
    }

    #[tokio::test]
    async fn success_without_image_is_a_save_error() {
        let err = tool("true", Arc::new(MemoryStore::default()))
            .execute(json!({"plot_code_string": "fig = 1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Error during plot saving"));
    }

    fn flexible(python: &str, store: Arc<MemoryStore>) -> FlexiblePlotToS3 {
        FlexiblePlotToS3::new(
            store,
            &PlotConfig {
                python: python.to_string(),
                timeout_secs: 10,
            },
        )
    }

    fn scores() -> Value {
        json!({"Country": ["EGY", "IRL"], "Score": [378, 577], "Year": [2021, 2021]})
    }

    #[test]
    fn plot_spec_defaults() {
        let spec = PlotSpec::from_args(json!({
            "plot_params": {"plot_type": "Bar", "data": scores(), "x": "Country", "y": "Score"}
        }))
        .unwrap();
        assert_eq!(spec.plot_type, "bar");
        assert!(spec.horizontal);
        assert_eq!(spec.rotate_labels, 0);

        let encoded = json!({"data": scores(), "x": "Country", "y": "Score"}).to_string();
        let spec = PlotSpec::from_args(json!({"plot_params": encoded})).unwrap();
        assert_eq!(spec.plot_type, "scatter");
        assert!(!spec.horizontal);
    }

    #[test]
    fn plot_spec_requires_x_and_y() {
        let err = PlotSpec::from_args(json!({"plot_params": {"data": scores(), "x": "Country"}}))
            .unwrap_err();
        assert_eq!(err.to_string(), "'x' and 'y' columns must be provided.");
    }

    #[test]
    fn heatmap_rejects_column_lists() {
        let err = PlotSpec::from_args(json!({"plot_params": {
            "plot_type": "heatmap", "data": scores(), "x": ["Country", "Year"], "y": "Score"
        }}))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "'x' and 'y' for heatmap must be single column names, not lists."
        );
    }

    #[test]
    fn plot_spec_checks_columns_and_types() {
        let err = PlotSpec::from_args(json!({"plot_params": {
            "plot_type": "line", "data": scores(), "x": "Year", "y": "Mean"
        }}))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The column 'Year' or 'Mean' does not exist in the data."
        );

        let err = PlotSpec::from_args(json!({"plot_params": {
            "plot_type": "pie", "data": scores(), "x": "Country", "y": "Score"
        }}))
        .unwrap_err();
        assert!(err.to_string().starts_with("Unsupported plot_type 'pie'"));

        let err = PlotSpec::from_args(json!({"plot_params": {
            "data": {"Country": ["EGY"], "Score": [378, 577]}, "x": "Country", "y": "Score"
        }}))
        .unwrap_err();
        assert_eq!(err.to_string(), "All 'data' columns must have the same length.");
    }

    #[tokio::test]
    async fn flexible_plot_uploads_rendered_spec() {
        let dir = tempfile::tempdir().unwrap();
        // Echo the spec back as the "image" so the upload shows what was rendered.
        let python = fake_interpreter(&dir, "cp \"$3\" \"$2\"\n");
        let store = Arc::new(MemoryStore::default());

        let url = flexible(&python, store.clone())
            .execute(json!({"plot_params": {
                "plot_type": "bar", "data": scores(), "x": "Country", "y": "Score",
                "horizontal": false, "title": "Average reading score"
            }}))
            .await
            .unwrap();

        assert!(url.starts_with("https://bucket.example/flexible_charts/"));
        let objects = store.objects.lock().unwrap();
        let rendered: Value = serde_json::from_slice(&objects[0].1).unwrap();
        assert_eq!(rendered["plot_type"], "bar");
        assert_eq!(rendered["horizontal"], false);
        assert_eq!(rendered["data"]["Score"], json!([378, 577]));
        assert_eq!(rendered["title"], "Average reading score");
    }

    #[tokio::test]
    async fn invalid_plot_params_skip_rendering() {
        let store = Arc::new(MemoryStore::default());
        let err = flexible("false", store.clone())
            .execute(json!({"plot_params": {"plot_type": "bar", "data": scores()}}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "'x' and 'y' columns must be provided.");
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rendering_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(&dir, "echo 'KeyError: Score' >&2\nexit 2\n");

        let err = flexible(&python, Arc::new(MemoryStore::default()))
            .execute(json!({"plot_params": {"data": scores(), "x": "Country", "y": "Score"}}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error during plot rendering: KeyError: Score");
    }

    #[tokio::test]
    async fn missing_argument_is_an_error() {
        let err = tool("true", Arc::new(MemoryStore::default()))
            .execute(json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("plot_code_string"));
    }
}
