//! Run configuration.
//!
//! Everything a run needs is gathered here once, validated before any file is
//! touched, and then passed down explicitly. Only `main` looks at the
//! environment.

use std::path::PathBuf;

use crate::error::ConfigError;

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Which kind of input files the coordinator enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// `.xlsx`/`.xls` workbooks, searched recursively.
    Spreadsheet,
    /// Pre-converted `.csv` tables, top level of the directory only.
    Csv,
}

/// What to do when a chunk's model output violates the record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorPolicy {
    /// Record the failure and keep the other chunks of the file.
    SkipChunk,
    /// Fail the whole file; no records are validated for it.
    AbortFile,
}

/// Connection settings for the extraction model.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_retries: usize,
    pub timeout_seconds: u64,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            max_retries: 3,
            timeout_seconds: 120,
        }
    }
}

/// Numeric knobs of the validator.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Absolute tolerance for numeric cross-reference comparison.
    pub tolerance: f64,
    /// Magnitude above which an extracted value is reported as implausible.
    pub sanity_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            sanity_threshold: 1e12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub input_kind: InputKind,
    pub kpis: Vec<String>,
    pub chunk_rows: usize,
    pub max_chunk_chars: usize,
    pub concurrency: usize,
    pub on_schema_error: SchemaErrorPolicy,
    pub export_csv: bool,
    pub show_progress: bool,
    pub validator: ValidatorConfig,
}

impl RunConfig {
    pub fn new(input_dir: impl Into<PathBuf>, kpis: Vec<String>) -> Self {
        Self {
            input_dir: input_dir.into(),
            input_kind: InputKind::Spreadsheet,
            kpis,
            chunk_rows: 40,
            max_chunk_chars: 10_000,
            concurrency: 1,
            on_schema_error: SchemaErrorPolicy::SkipChunk,
            export_csv: false,
            show_progress: false,
            validator: ValidatorConfig::default(),
        }
    }

    /// Checks the settings that must hold before the pipeline starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kpis.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::EmptyKpiList);
        }
        if !self.input_dir.is_dir() {
            return Err(ConfigError::InputDirMissing(self.input_dir.clone()));
        }
        if self.chunk_rows == 0 {
            return Err(ConfigError::ZeroValue("chunk rows"));
        }
        if self.max_chunk_chars == 0 {
            return Err(ConfigError::ZeroValue("max chunk chars"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroValue("concurrency"));
        }
        Ok(())
    }
}

/// Splits a comma separated KPI argument, dropping blanks.
pub fn parse_kpi_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves the API key from an already loaded environment value.
pub fn require_api_key(value: Option<String>) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingCredential(API_KEY_VAR))
}
