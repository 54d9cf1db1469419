//! kpi-extract
//! -----------
//! Extracts named financial KPIs from folders of spreadsheets with an LLM
//! (Structured Outputs, strict JSON Schema) and cross-validates every claimed
//! value against the literal source cell it was said to come from.
//!
//! Pipeline, per file:
//!   workbook/csv -> normalize -> chunk -> call LLM -> dedup -> validate -> report
//!
//! Row and column numbers are 1-based everywhere the model or the report sees
//! them: data row 1 is the first row below the header.

pub mod chunk;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod table;
pub mod validate;
pub mod visibility;

pub use config::{InputKind, LlmConfig, RunConfig, SchemaErrorPolicy, ValidatorConfig};
pub use error::{ConfigError, ExtractError, KpiError, Result};
pub use extract::{KpiExtractor, OpenAiExtractor};
pub use pipeline::{discover_files, render_chunks, Pipeline, Stage};
pub use report::{FileReport, FileStatus, FlatRecord, Report, ValidatedRecord, ValidationStatus};
