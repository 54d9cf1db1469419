use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, normalizing or exporting source tables.
#[derive(Error, Debug)]
pub enum KpiError {
    #[error("cannot open spreadsheet '{path}': {source}")]
    Spreadsheet {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },

    #[error("unsupported input file '{0}'")]
    UnsupportedFile(PathBuf),

    #[error("workbook structure: {0}")]
    Workbook(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("{0}")]
    Glob(#[from] glob::GlobError),

    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Failures of a single extraction call.
///
/// The coordinator treats each variant differently: `ContractNotInvoked`
/// degrades to an empty chunk, `Schema` follows the configured policy, and
/// transport/API failures are recorded against the chunk.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model API returned {status} after {attempts} attempts: {body}")]
    Api {
        status: u16,
        attempts: usize,
        body: String,
    },

    #[error("model did not answer through the structured output contract: {0}")]
    ContractNotInvoked(String),

    #[error("model output violates the record schema: {0}")]
    Schema(String),

    #[error("runtime: {0}")]
    Runtime(String),
}

/// Unrecoverable configuration problems detected before any processing starts.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("the target KPI list is empty")]
    EmptyKpiList,

    #[error("input directory '{0}' does not exist or is not a directory")]
    InputDirMissing(PathBuf),

    #[error("missing credential: set {0} (a .env file works too)")]
    MissingCredential(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

pub type Result<T> = std::result::Result<T, KpiError>;
