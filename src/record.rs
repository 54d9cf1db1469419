//! Candidate KPI records as returned by the extraction model, and the numeric
//! normalisation shared by every stage that compares values.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A value claimed by the model: a JSON number or a string such as `"1,200"` or `"12.5%"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum KpiValue {
    Number(f64),
    Text(String),
}

impl KpiValue {
    /// String form used in comparisons and reports; numbers are rendered canonically.
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(n) => canonical_number(*n),
            Self::Text(s) => s.clone(),
        }
    }

    /// Numeric reading after stripping thousands separators and a trailing `%`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_number(s),
        }
    }
}

/// One KPI claim from the extraction model.
///
/// Every field the model provides is optional at this level so that a missing
/// or null field reaches structural validation instead of being defaulted.
/// Wrongly typed fields and unknown keys fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CandidateRecord {
    /// KPI name exactly as labelled in the table.
    #[serde(alias = "kpi")]
    pub name: Option<String>,
    /// Cell value as shown in the table.
    pub value: Option<KpiValue>,
    /// Column header or period the value belongs to.
    #[serde(alias = "period")]
    pub header: Option<String>,
    /// Number shown in the `row` column of the table.
    pub row: Option<i64>,
    /// 1-based column number as labelled in the table header.
    #[serde(alias = "col")]
    pub column: Option<i64>,
    /// Sheet the record was extracted from; stamped by the client, never by the model.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub sheet: Option<String>,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub source_file: String,
}

impl CandidateRecord {
    pub fn new(name: &str, value: KpiValue, header: &str, row: i64, column: i64) -> Self {
        Self {
            name: Some(name.to_string()),
            value: Some(value),
            header: Some(header.to_string()),
            row: Some(row),
            column: Some(column),
            sheet: None,
            source_file: String::new(),
        }
    }

    pub fn with_sheet(mut self, sheet: &str) -> Self {
        self.sheet = Some(sheet.to_string());
        self
    }

    /// `(lower-cased name, verbatim header)`, the identity used by dedup and the duplicate check.
    pub fn identity(&self) -> (String, String) {
        (
            self.name.as_deref().unwrap_or_default().to_lowercase(),
            self.header.clone().unwrap_or_default(),
        )
    }

    pub fn value_text(&self) -> Option<String> {
        self.value.as_ref().map(KpiValue::as_text)
    }
}

/// Renders a float without exponent or trailing `.0`; `-0` becomes `0`.
pub fn canonical_number(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        format!("{value}")
    }
}

/// Removes thousands separators, currency symbols and surrounding whitespace.
pub fn strip_separators(text: &str) -> String {
    text.trim()
        .chars()
        .filter(|c| *c != ',' && *c != '$')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parses `text` as a number after [`strip_separators`]; a trailing `%` divides by 100.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned = strip_separators(text);
    let (body, percent) = match cleaned.strip_suffix('%') {
        Some(body) => (body.trim(), true),
        None => (cleaned.as_str(), false),
    };
    if body.is_empty() {
        return None;
    }
    let value: f64 = body.parse().ok()?;
    Some(if percent { value / 100.0 } else { value })
}

/// Like [`parse_number`] but without currency stripping: the coercion rule for
/// extracted values, which may only carry thousands separators and a `%`.
pub fn parse_extracted_number(text: &str) -> Option<f64> {
    if text.contains('$') {
        return None;
    }
    parse_number(text)
}

/// Key used to decide whether a number seen in the source was extracted:
/// the canonical numeric form when the text parses, the stripped text otherwise.
pub fn value_key(text: &str) -> String {
    match parse_number(text) {
        Some(n) => canonical_number(n),
        None => strip_separators(text),
    }
}
