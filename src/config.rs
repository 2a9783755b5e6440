//! Configuration management for the PIRLS agent.
//!
//! Configuration is read from environment variables (a `.env` file is loaded
//! by the binary before this runs):
//! - `OPENROUTER_API_KEY` - Required. API key for the model endpoint.
//! - `LLM_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to OpenRouter.
//! - `DEFAULT_MODEL` - Optional. Model identifier. Defaults to `anthropic/claude-3.5-sonnet`.
//! - `LLM_TEMPERATURE` - Optional. Defaults to `0`.
//! - `LLM_MAX_TOKENS` - Optional. Defaults to `8192`.
//! - `MAX_ITERATIONS` - Optional. Agent loop ceiling. Defaults to `50`.
//! - `MAX_ROWS` - Optional. Row cap for database queries. Defaults to `200`.
//! - `PIRLS_DATABASE_PATH` - Optional. SQLite database file. Defaults to `pirls.db`.
//! - `QUICKCHART_URL` - Optional. Chart creation endpoint.
//! - `UNESCO_API_URL` - Optional. UNESCO UIS indicator endpoint.
//! - `HTTP_TIMEOUT_SECS` - Optional. Timeout for tool HTTP calls. Defaults to `30`.
//! - `INCLUDE_SYSTEM_PROMPT` - Optional. Seed the system prompt. Defaults to `true`.
//! - `S3_BUCKET` - Optional. Enables the plot upload tool.
//! - `AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`,
//!   `S3_ENDPOINT` - Object storage credentials (required when `S3_BUCKET` is set).
//! - `PLOT_PYTHON` - Optional. Interpreter for plot code. Defaults to `python3`.
//! - `PLOT_TIMEOUT_SECS` - Optional. Defaults to `60`.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";
pub const DEFAULT_QUICKCHART_URL: &str = "https://quickchart.io/chart/create";
pub const DEFAULT_UNESCO_API_URL: &str = "https://api.uis.unesco.org/api/public/data/indicators";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Object storage settings for uploaded plots.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,

    /// Path-style endpoint override (e.g. a MinIO server). `None` uses AWS.
    pub endpoint: Option<String>,
}

/// Settings for the code-executing plot tool.
#[derive(Debug, Clone)]
pub struct PlotConfig {
    pub python: String,
    pub timeout_secs: u64,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the model endpoint
    pub api_key: String,

    /// OpenAI-compatible base URL
    pub llm_base_url: String,

    /// Model identifier
    pub default_model: String,

    /// Sampling temperature, passed through unchanged
    pub temperature: f32,

    /// Output token limit, passed through unchanged
    pub max_tokens: u32,

    /// Maximum model invocations per run
    pub max_iterations: usize,

    /// Row cap for `query_database`
    pub max_rows: usize,

    /// SQLite file holding the PIRLS 2021 tables
    pub database_path: PathBuf,

    pub quickchart_url: String,

    pub unesco_api_url: String,

    /// Timeout applied by every HTTP-backed tool
    pub http_timeout_secs: u64,

    /// Whether the run is seeded with the system prompt
    pub include_system_prompt: bool,

    /// Plot uploads are disabled when this is `None`
    pub storage: Option<StorageConfig>,

    pub plot: PlotConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// or if `S3_BUCKET` is set without credentials.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let llm_base_url =
            std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string());

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let include_system_prompt = std::env::var("INCLUDE_SYSTEM_PROMPT")
            .ok()
            .map(|v| {
                parse_bool(&v)
                    .map_err(|e| ConfigError::InvalidValue("INCLUDE_SYSTEM_PROMPT".to_string(), e))
            })
            .transpose()?
            .unwrap_or(true);

        let plot = PlotConfig {
            python: std::env::var("PLOT_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            timeout_secs: env_or("PLOT_TIMEOUT_SECS", 60)?,
        };

        Ok(Self {
            api_key,
            llm_base_url,
            default_model,
            temperature: env_or("LLM_TEMPERATURE", 0.0)?,
            max_tokens: env_or("LLM_MAX_TOKENS", 8192)?,
            max_iterations: env_or("MAX_ITERATIONS", 50)?,
            max_rows: env_or("MAX_ROWS", 200)?,
            database_path: std::env::var("PIRLS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("pirls.db")),
            quickchart_url: std::env::var("QUICKCHART_URL")
                .unwrap_or_else(|_| DEFAULT_QUICKCHART_URL.to_string()),
            unesco_api_url: std::env::var("UNESCO_API_URL")
                .unwrap_or_else(|_| DEFAULT_UNESCO_API_URL.to_string()),
            http_timeout_secs: env_or("HTTP_TIMEOUT_SECS", 30)?,
            include_system_prompt,
            storage: storage_from_env()?,
            plot,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, database_path: PathBuf) -> Self {
        Self {
            api_key,
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            default_model,
            temperature: 0.0,
            max_tokens: 8192,
            max_iterations: 50,
            max_rows: 200,
            database_path,
            quickchart_url: DEFAULT_QUICKCHART_URL.to_string(),
            unesco_api_url: DEFAULT_UNESCO_API_URL.to_string(),
            http_timeout_secs: 30,
            include_system_prompt: true,
            storage: None,
            plot: PlotConfig::default(),
        }
    }
}

fn storage_from_env() -> Result<Option<StorageConfig>, ConfigError> {
    let Ok(bucket) = std::env::var("S3_BUCKET") else {
        return Ok(None);
    };

    let required = |name: &str| {
        std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
    };

    Ok(Some(StorageConfig {
        bucket,
        region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        access_key_id: required("AWS_ACCESS_KEY_ID")?,
        secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
        session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        endpoint: std::env::var("S3_ENDPOINT").ok(),
    }))
}

/// Parse an optional variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("Yes"), Ok(true));
        assert_eq!(parse_bool(" off "), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn parse_value_reports_variable_name() {
        let err = parse_value::<usize>("MAX_ROWS", "lots").unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for MAX_ROWS"));
        assert_eq!(parse_value::<usize>("MAX_ROWS", " 300 ").unwrap(), 300);
    }

    #[test]
    fn new_uses_documented_defaults() {
        let config = Config::new("key".into(), "model".into(), PathBuf::from("db.sqlite"));
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.max_rows, 200);
        assert_eq!(config.temperature, 0.0);
        assert!(config.include_system_prompt);
        assert!(config.storage.is_none());
        assert_eq!(config.plot.python, "python3");
    }
}
