//! Report model and writers.
//!
//! `report.json` is the nested per-file view; `records.jsonl` and
//! `records.parquet` carry the flattened view, one row per validated record,
//! ready for DuckDB/Polars.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::record::CandidateRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationStatus {
    Valid,
    #[serde(rename = "INVALID_STRUCTURE")]
    InvalidStructure,
    #[serde(rename = "LOCATION_NOT_FOUND_IN_SOURCE")]
    LocationNotFound,
    #[serde(rename = "VALUE_MISSING_IN_SOURCE")]
    ValueMissing,
    #[serde(rename = "VALUE_MISMATCH")]
    ValueMismatch,
    #[serde(rename = "SOURCE_LOAD_ERROR")]
    SourceLoadError,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "Valid",
            Self::InvalidStructure => "INVALID_STRUCTURE",
            Self::LocationNotFound => "LOCATION_NOT_FOUND_IN_SOURCE",
            Self::ValueMissing => "VALUE_MISSING_IN_SOURCE",
            Self::ValueMismatch => "VALUE_MISMATCH",
            Self::SourceLoadError => "SOURCE_LOAD_ERROR",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the source cell was located: through the record's own sheet, or by
/// scanning every sheet of the file for the first cell at that address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

/// A candidate record plus its verdict. Never modified after validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedRecord {
    #[serde(flatten)]
    pub record: CandidateRecord,
    pub validation_status: ValidationStatus,
    pub notes: Vec<String>,
    pub validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

impl ValidatedRecord {
    pub fn new(record: CandidateRecord, status: ValidationStatus, notes: Vec<String>) -> Self {
        Self {
            record,
            validated: status == ValidationStatus::Valid,
            validation_status: status,
            notes,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub status: FileStatus,
    pub error: Option<String>,
    pub validated_kpis: Vec<ValidatedRecord>,
    pub unextracted_numbers: Vec<String>,
    pub issues: Vec<String>,
    pub extraction_failures: Vec<String>,
}

impl FileReport {
    pub fn failed(error: impl Into<String>, extraction_failures: Vec<String>) -> Self {
        Self {
            status: FileStatus::Failed,
            error: Some(error.into()),
            validated_kpis: Vec::new(),
            unextracted_numbers: Vec::new(),
            issues: Vec::new(),
            extraction_failures,
        }
    }
}

/// Whole-run report keyed by file path relative to the input directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: String,
    pub model: String,
    pub kpis: Vec<String>,
    pub files: BTreeMap<String, FileReport>,
}

/// One row of the flattened view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRecord {
    pub file: String,
    pub kpi: Option<String>,
    pub value: Option<String>,
    pub header: Option<String>,
    pub row: Option<i64>,
    pub column: Option<i64>,
    pub sheet: Option<String>,
    pub status: String,
    pub validated: bool,
    pub notes: String,
}

impl Report {
    pub fn new(model: impl Into<String>, kpis: Vec<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            kpis,
            files: BTreeMap::new(),
        }
    }

    /// Every validated record of every file, whatever its status, in file order.
    pub fn flatten(&self) -> Vec<FlatRecord> {
        self.files
            .iter()
            .flat_map(|(file, report)| {
                report.validated_kpis.iter().map(move |v| FlatRecord {
                    file: file.clone(),
                    kpi: v.record.name.clone(),
                    value: v.record.value_text(),
                    header: v.record.header.clone(),
                    row: v.record.row,
                    column: v.record.column,
                    sheet: v.record.sheet.clone(),
                    status: v.validation_status.to_string(),
                    validated: v.validated,
                    notes: v.notes.join("; "),
                })
            })
            .collect()
    }

    /// `(valid, total)` record counts across all files.
    pub fn totals(&self) -> (usize, usize) {
        self.files
            .values()
            .flat_map(|f| f.validated_kpis.iter())
            .fold((0, 0), |(valid, total), v| (valid + usize::from(v.validated), total + 1))
    }
}

pub fn write_json<P: AsRef<Path>>(report: &Report, path: P) -> Result<()> {
    info!("📝 Writing report: {}", path.as_ref().display());
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush()?;
    Ok(())
}

pub fn write_jsonl<P: AsRef<Path>>(records: &[FlatRecord], path: P) -> Result<()> {
    info!("🧾 Writing JSONL: {}", path.as_ref().display());
    let mut f = BufWriter::new(File::create(path)?);
    for r in records {
        writeln!(f, "{}", serde_json::to_string(r)?)?;
    }
    f.flush()?;
    Ok(())
}

pub fn write_parquet<P: AsRef<Path>>(records: &[FlatRecord], path: P) -> anyhow::Result<()> {
    use arrow2::array::{BooleanArray, Int64Array, Utf8Array};
    use arrow2::chunk::Chunk;
    use arrow2::datatypes::{DataType, Field, Schema};
    use arrow2::io::parquet::write as pq;

    info!("💾 Writing {} records to Parquet: {}", records.len(), path.as_ref().display());

    let schema = Schema::from(vec![
        Field::new("file", DataType::Utf8, false),
        Field::new("kpi", DataType::Utf8, true),
        Field::new("value", DataType::Utf8, true),
        Field::new("header", DataType::Utf8, true),
        Field::new("row", DataType::Int64, true),
        Field::new("column", DataType::Int64, true),
        Field::new("sheet", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new("validated", DataType::Boolean, false),
        Field::new("notes", DataType::Utf8, false),
    ]);

    let columns: Vec<Box<dyn arrow2::array::Array>> = vec![
        Box::new(Utf8Array::<i32>::from_iter_values(records.iter().map(|r| r.file.as_str()))),
        Box::new(Utf8Array::<i32>::from(records.iter().map(|r| r.kpi.clone()).collect::<Vec<_>>())),
        Box::new(Utf8Array::<i32>::from(records.iter().map(|r| r.value.clone()).collect::<Vec<_>>())),
        Box::new(Utf8Array::<i32>::from(records.iter().map(|r| r.header.clone()).collect::<Vec<_>>())),
        Box::new(Int64Array::from(records.iter().map(|r| r.row).collect::<Vec<_>>())),
        Box::new(Int64Array::from(records.iter().map(|r| r.column).collect::<Vec<_>>())),
        Box::new(Utf8Array::<i32>::from(records.iter().map(|r| r.sheet.clone()).collect::<Vec<_>>())),
        Box::new(Utf8Array::<i32>::from_iter_values(records.iter().map(|r| r.status.as_str()))),
        Box::new(BooleanArray::from_slice(records.iter().map(|r| r.validated).collect::<Vec<_>>())),
        Box::new(Utf8Array::<i32>::from_iter_values(records.iter().map(|r| r.notes.as_str()))),
    ];
    let chunk = Chunk::try_new(columns)?;

    let options = pq::WriteOptions {
        write_statistics: true,
        compression: pq::CompressionOptions::Zstd(None),
        version: pq::Version::V2,
        data_pagesize_limit: None,
    };

    // Flat schema: one encoding per column
    let encodings: Vec<Vec<pq::Encoding>> = schema
        .fields
        .iter()
        .map(|_| vec![pq::Encoding::Plain])
        .collect();

    let row_groups = pq::RowGroupIterator::try_new(std::iter::once(Ok(chunk)), &schema, options, encodings)?;

    let mut file = File::create(path)?;
    let mut writer = pq::FileWriter::try_new(&mut file, schema, options)?;
    for rg in row_groups {
        writer.write(rg?)?;
    }
    writer.end(None)?;
    info!("✅ Parquet write complete");
    Ok(())
}
