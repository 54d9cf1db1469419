//! Validator: checks every deduplicated record against the source tables and
//! reports what the model missed.
//!
//! Tier 1 is structural and needs no source. Only records that pass it are
//! looked up in the source tables (tier 2). Independently, each target KPI's
//! label row is scanned for numbers that never made it into the extraction.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ValidatorConfig;
use crate::dedup::find_collisions;
use crate::error::Result;
use crate::record::{parse_extracted_number, parse_number, strip_separators, value_key, CandidateRecord, KpiValue};
use crate::report::{Confidence, ValidatedRecord, ValidationStatus};
use crate::table::SourceTable;

lazy_static! {
    /// A plain decimal number once thousands separators are removed
    static ref NUMERIC_CELL: Regex = Regex::new(r"^-?\d+(\.\d+)?$").unwrap();
}

/// Validator output for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileValidation {
    pub validated_kpis: Vec<ValidatedRecord>,
    pub unextracted_numbers: Vec<String>,
    pub issues: Vec<String>,
}

pub struct Validator<'a> {
    kpis: &'a [String],
    config: ValidatorConfig,
}

impl<'a> Validator<'a> {
    pub fn new(kpis: &'a [String], config: ValidatorConfig) -> Self {
        Self { kpis, config }
    }

    /// Validates the records of one file.
    ///
    /// `extracted` is the raw extraction set in emission order and `unique`
    /// its deduplicated form. `source` is the file's reloaded tables or the
    /// error that prevented loading them.
    pub fn validate_file(
        &self,
        extracted: &[CandidateRecord],
        unique: &[CandidateRecord],
        source: Result<Vec<SourceTable>>,
    ) -> FileValidation {
        let mut issues = Vec::new();
        let mut slots: Vec<Option<ValidatedRecord>> = Vec::with_capacity(unique.len());

        for record in unique {
            let problems = structural_problems(record);
            if problems.is_empty() {
                slots.push(None);
            } else {
                issues.push(format!(
                    "Invalid record structure ({}): {}",
                    describe(record),
                    problems.join("; ")
                ));
                slots.push(Some(ValidatedRecord::new(
                    record.clone(),
                    ValidationStatus::InvalidStructure,
                    problems,
                )));
            }
        }

        let unextracted_numbers = match source {
            Ok(tables) => {
                for (slot, record) in slots.iter_mut().zip(unique) {
                    if slot.is_none() {
                        *slot = Some(self.cross_reference(record, &tables));
                    }
                }
                self.unextracted_numbers(extracted, &tables)
            }
            Err(e) => {
                warn!("⚠️ Source could not be reloaded for validation: {e}");
                issues.insert(0, format!("Source could not be reloaded: {e}"));
                for (slot, record) in slots.iter_mut().zip(unique) {
                    if slot.is_none() {
                        *slot = Some(ValidatedRecord::new(
                            record.clone(),
                            ValidationStatus::SourceLoadError,
                            vec![format!("source load error: {e}")],
                        ));
                    }
                }
                Vec::new()
            }
        };

        issues.extend(self.missing_kpis(unique));
        issues.extend(duplicate_issues(extracted));
        issues.extend(self.implausible_values(unique));

        let validated_kpis: Vec<ValidatedRecord> = slots.into_iter().flatten().collect();
        info!(
            "🔎 Validated {} records: {} valid, {} unextracted numbers, {} issues",
            validated_kpis.len(),
            validated_kpis.iter().filter(|v| v.validated).count(),
            unextracted_numbers.len(),
            issues.len()
        );
        FileValidation {
            validated_kpis,
            unextracted_numbers,
            issues,
        }
    }

    /// Tier 2 for one structurally valid record.
    fn cross_reference(&self, record: &CandidateRecord, tables: &[SourceTable]) -> ValidatedRecord {
        let (Some(row), Some(column), Some(value)) = (record.row, record.column, record.value.as_ref()) else {
            return ValidatedRecord::new(
                record.clone(),
                ValidationStatus::InvalidStructure,
                vec!["record changed after structural validation".into()],
            );
        };
        let (row, column) = (row as usize, column as usize);

        let (cell, confidence, mut notes) = match record.sheet.as_deref() {
            Some(sheet) => match tables.iter().find(|t| t.sheet_id == sheet) {
                Some(table) => (table.cell(row, column), Confidence::High, Vec::new()),
                None => (None, Confidence::High, vec![format!("sheet '{sheet}' not found in source")]),
            },
            None => {
                let found = tables
                    .iter()
                    .find_map(|t| t.cell(row, column).map(|cell| (t.sheet_id.as_str(), cell)));
                match found {
                    Some((sheet, cell)) => (
                        Some(cell),
                        Confidence::Low,
                        vec![format!("no sheet on record; matched first cell at this address in sheet '{sheet}'")],
                    ),
                    None => (None, Confidence::Low, Vec::new()),
                }
            }
        };

        let Some(cell) = cell else {
            notes.push(format!("no cell at row {row}, column {column}"));
            return ValidatedRecord::new(record.clone(), ValidationStatus::LocationNotFound, notes)
                .with_confidence(confidence);
        };

        let status = compare(cell, value, self.config.tolerance);
        match status {
            ValidationStatus::ValueMissing => notes.push(format!("source cell at row {row}, column {column} is empty")),
            ValidationStatus::ValueMismatch => notes.push(format!(
                "expected '{}' at row {row}, column {column}, got '{}'",
                cell.trim(),
                value.as_text()
            )),
            _ => {}
        }
        debug!("{} -> {status}", describe(record));
        ValidatedRecord::new(record.clone(), status, notes).with_confidence(confidence)
    }

    /// Numbers in each target KPI's label row that no extracted value accounts for, sorted.
    fn unextracted_numbers(&self, extracted: &[CandidateRecord], tables: &[SourceTable]) -> Vec<String> {
        let extracted_keys: BTreeSet<String> = extracted
            .iter()
            .filter_map(CandidateRecord::value_text)
            .map(|v| value_key(&v))
            .collect();

        let mut potential = BTreeSet::new();
        for table in tables {
            for kpi in self.kpis {
                let label = kpi.trim().to_lowercase();
                // the promoted header counts as a row when it carries the label
                let Some(row) = std::iter::once(&table.header)
                    .chain(table.rows.iter().map(|r| &r.cells))
                    .find(|cells| cells.iter().any(|c| c.trim().to_lowercase() == label))
                else {
                    continue;
                };
                for cell in row {
                    let compact: String = cell.trim().chars().filter(|c| *c != ',').collect();
                    if NUMERIC_CELL.is_match(&compact) {
                        potential.insert(value_key(&compact));
                    }
                }
            }
        }

        potential
            .into_iter()
            .filter(|v| !extracted_keys.contains(v))
            .collect()
    }

    fn missing_kpis(&self, records: &[CandidateRecord]) -> Vec<String> {
        let found: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.name.as_deref())
            .map(|n| n.trim().to_lowercase())
            .collect();
        self.kpis
            .iter()
            .filter(|k| !found.contains(&k.trim().to_lowercase()))
            .map(|k| format!("Missing KPI: {k}"))
            .collect()
    }

    fn implausible_values(&self, records: &[CandidateRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| {
                let number = r.value.as_ref()?.as_number()?;
                (number.is_nan() || number.abs() > self.config.sanity_threshold)
                    .then(|| format!("Implausible value for {}: {}", describe(r), r.value_text().unwrap_or_default()))
            })
            .collect()
    }
}

fn duplicate_issues(records: &[CandidateRecord]) -> Vec<String> {
    find_collisions(records)
        .into_iter()
        .map(|((name, header), count)| format!("Duplicate KPI entry: {name} / {header} ({count} records)"))
        .collect()
}

fn describe(record: &CandidateRecord) -> String {
    format!(
        "{} / {}",
        record.name.as_deref().filter(|n| !n.trim().is_empty()).unwrap_or("<unnamed>"),
        record.header.as_deref().unwrap_or("<no header>")
    )
}

/// Tier 1: every reason the record is malformed, empty when it is well-formed.
pub fn structural_problems(record: &CandidateRecord) -> Vec<String> {
    let mut notes = Vec::new();
    if record.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
        notes.push("KPI name is missing".to_string());
    }
    match &record.value {
        None => notes.push("value is missing".to_string()),
        Some(KpiValue::Text(text)) if parse_extracted_number(text).is_none() => {
            notes.push(format!("value '{text}' is not numeric"));
        }
        Some(_) => {}
    }
    if record.header.as_deref().map_or(true, |h| h.trim().is_empty()) {
        notes.push("header/period is missing".to_string());
    }
    match record.row {
        None => notes.push("row number is missing".to_string()),
        Some(row) if row <= 0 => notes.push(format!("invalid row number {row}")),
        Some(_) => {}
    }
    match record.column {
        None => notes.push("column number is missing".to_string()),
        Some(column) if column <= 0 => notes.push(format!("invalid column number {column}")),
        Some(_) => {}
    }
    notes
}

/// Tier 2 comparison of a source cell with an extracted value.
pub fn compare(cell: &str, value: &KpiValue, tolerance: f64) -> ValidationStatus {
    if cell.trim().is_empty() {
        return ValidationStatus::ValueMissing;
    }
    let expected = strip_separators(cell);
    if expected == strip_separators(&value.as_text()) {
        return ValidationStatus::Valid;
    }
    let got = match value {
        KpiValue::Number(n) => Some(*n),
        KpiValue::Text(t) => parse_extracted_number(t),
    };
    match (parse_number(cell), got) {
        (Some(a), Some(b)) if a.is_nan() && b.is_nan() => ValidationStatus::Valid,
        (Some(a), Some(b)) if (a - b).abs() <= tolerance => ValidationStatus::Valid,
        _ => ValidationStatus::ValueMismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KpiError;

    fn kpis(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn scenario_table() -> SourceTable {
        SourceTable::from_rows(
            "P&L",
            vec!["KPI".into(), "2023Q1".into(), "2023Q2".into()],
            vec![vec!["Revenue".into(), "100000".into(), "110000".into()]],
        )
    }

    fn revenue_q1() -> CandidateRecord {
        CandidateRecord::new("Revenue", KpiValue::Number(100000.0), "2023Q1", 1, 2).with_sheet("P&L")
    }

    #[test]
    fn scenario_a_valid_record_and_unextracted_neighbour() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![revenue_q1()];
        let out = validator.validate_file(&records, &records, Ok(vec![scenario_table()]));

        assert_eq!(out.validated_kpis.len(), 1);
        let v = &out.validated_kpis[0];
        assert_eq!(v.validation_status, ValidationStatus::Valid);
        assert!(v.validated);
        assert_eq!(v.confidence, Some(Confidence::High));
        assert_eq!(out.unextracted_numbers, vec!["110000"]);
        assert!(out.issues.is_empty());
    }

    #[test]
    fn scenario_b_negative_row_is_structural_and_never_looked_up() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![CandidateRecord::new("Revenue", KpiValue::Number(100000.0), "2023Q1", -1, 2)];
        // A broken source would turn any looked-up record into SOURCE_LOAD_ERROR.
        let out = validator.validate_file(
            &records,
            &records,
            Err(KpiError::Workbook("corrupt".into())),
        );
        let v = &out.validated_kpis[0];
        assert_eq!(v.validation_status, ValidationStatus::InvalidStructure);
        assert!(!v.validated);
        assert!(v.notes.iter().any(|n| n.contains("invalid row number")));
        assert_eq!(v.confidence, None);
        assert!(out.issues.iter().any(|i| i.starts_with("Invalid record structure")));
    }

    #[test]
    fn scenario_c_address_outside_every_table() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![CandidateRecord::new("Revenue", KpiValue::Number(1.0), "2023Q1", 7, 9)];
        let out = validator.validate_file(&records, &records, Ok(vec![scenario_table()]));
        assert_eq!(out.validated_kpis[0].validation_status, ValidationStatus::LocationNotFound);
    }

    #[test]
    fn scenario_d_collision_is_reported_after_dedup() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let extracted = vec![
            revenue_q1(),
            CandidateRecord::new("Revenue", KpiValue::Number(99.0), "2023Q1", 1, 2).with_sheet("P&L"),
        ];
        let unique = crate::dedup::dedup(&extracted);
        let out = validator.validate_file(&extracted, &unique, Ok(vec![scenario_table()]));
        assert_eq!(out.validated_kpis.len(), 1);
        assert_eq!(out.validated_kpis[0].validation_status, ValidationStatus::Valid);
        assert!(out.issues.contains(&"Duplicate KPI entry: revenue / 2023Q1 (2 records)".to_string()));
    }

    #[test]
    fn scenario_e_missing_kpi_is_an_issue_not_a_failure() {
        let targets = kpis(&["Revenue", "EBITDA"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![revenue_q1()];
        let out = validator.validate_file(&records, &records, Ok(vec![scenario_table()]));
        assert_eq!(out.issues, vec!["Missing KPI: EBITDA"]);
        assert!(out.validated_kpis[0].validated);
    }

    #[test]
    fn numeric_tolerance() {
        let tol = ValidatorConfig::default().tolerance;
        assert_eq!(compare("100,000.0000000001", &KpiValue::Number(100000.0), tol), ValidationStatus::Valid);
        assert_eq!(compare("100001", &KpiValue::Number(100000.0), tol), ValidationStatus::ValueMismatch);
        assert_eq!(compare("100000", &KpiValue::Text("100,000".into()), tol), ValidationStatus::Valid);
    }

    #[test]
    fn percentages_compare_by_value() {
        let tol = ValidatorConfig::default().tolerance;
        assert_eq!(compare("12.5%", &KpiValue::Number(0.125), tol), ValidationStatus::Valid);
        assert_eq!(compare("12.5%", &KpiValue::Text("12.5%".into()), tol), ValidationStatus::Valid);
        assert_eq!(compare("12.5%", &KpiValue::Number(12.5), tol), ValidationStatus::ValueMismatch);
    }

    #[test]
    fn nan_only_matches_nan() {
        let tol = ValidatorConfig::default().tolerance;
        assert_eq!(compare("NaN", &KpiValue::Text("nan".into()), tol), ValidationStatus::Valid);
        assert_eq!(compare("NaN", &KpiValue::Number(1.0), tol), ValidationStatus::ValueMismatch);
    }

    #[test]
    fn empty_and_textual_cells() {
        let tol = ValidatorConfig::default().tolerance;
        assert_eq!(compare("  ", &KpiValue::Number(1.0), tol), ValidationStatus::ValueMissing);
        assert_eq!(compare("n/a", &KpiValue::Number(1.0), tol), ValidationStatus::ValueMismatch);
        assert_eq!(compare("$1,200", &KpiValue::Number(1200.0), tol), ValidationStatus::Valid);
    }

    #[test]
    fn mismatch_and_empty_cell_notes_name_the_coordinate() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let table = SourceTable::from_rows(
            "P&L",
            vec!["KPI".into(), "2023Q1".into(), "2023Q2".into()],
            vec![vec!["Revenue".into(), "100000".into(), "".into()]],
        );
        let records = vec![
            CandidateRecord::new("Revenue", KpiValue::Number(5.0), "2023Q1", 1, 2).with_sheet("P&L"),
            CandidateRecord::new("Revenue", KpiValue::Number(5.0), "2023Q2", 1, 3).with_sheet("P&L"),
        ];
        let out = validator.validate_file(&records, &records, Ok(vec![table]));
        assert_eq!(out.validated_kpis[0].validation_status, ValidationStatus::ValueMismatch);
        assert_eq!(out.validated_kpis[0].notes, vec!["expected '100000' at row 1, column 2, got '5'"]);
        assert_eq!(out.validated_kpis[1].validation_status, ValidationStatus::ValueMissing);
    }

    #[test]
    fn records_without_sheet_use_the_first_matching_table_with_low_confidence() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let other = SourceTable::from_rows(
            "Notes",
            vec!["a".into(), "b".into()],
            vec![vec!["x".into(), "100000".into()]],
        );
        let records = vec![CandidateRecord::new("Revenue", KpiValue::Number(100000.0), "2023Q1", 1, 2)];
        let out = validator.validate_file(&records, &records, Ok(vec![other, scenario_table()]));
        let v = &out.validated_kpis[0];
        assert_eq!(v.validation_status, ValidationStatus::Valid);
        assert_eq!(v.confidence, Some(Confidence::Low));
        assert!(v.notes[0].contains("'Notes'"));
    }

    #[test]
    fn records_bound_to_a_sheet_are_not_matched_elsewhere() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![revenue_q1().with_sheet("Balance")];
        let out = validator.validate_file(&records, &records, Ok(vec![scenario_table()]));
        let v = &out.validated_kpis[0];
        assert_eq!(v.validation_status, ValidationStatus::LocationNotFound);
        assert!(v.notes[0].contains("sheet 'Balance' not found"));
    }

    #[test]
    fn load_error_marks_pending_records_only() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![
            revenue_q1(),
            CandidateRecord::new("", KpiValue::Number(1.0), "2023Q2", 1, 3),
        ];
        let out = validator.validate_file(&records, &records, Err(KpiError::Workbook("corrupt".into())));
        assert_eq!(out.validated_kpis[0].validation_status, ValidationStatus::SourceLoadError);
        assert!(out.validated_kpis[0].notes[0].contains("corrupt"));
        assert_eq!(out.validated_kpis[1].validation_status, ValidationStatus::InvalidStructure);
        assert!(out.unextracted_numbers.is_empty());
        assert!(out.issues[0].starts_with("Source could not be reloaded"));
    }

    #[test]
    fn structural_checks_collect_every_problem() {
        let record = CandidateRecord {
            name: Some(" ".into()),
            value: Some(KpiValue::Text("$5".into())),
            header: None,
            row: Some(0),
            column: None,
            sheet: None,
            source_file: String::new(),
        };
        assert_eq!(
            structural_problems(&record),
            vec![
                "KPI name is missing",
                "value '$5' is not numeric",
                "header/period is missing",
                "invalid row number 0",
                "column number is missing",
            ]
        );
        assert!(structural_problems(&revenue_q1()).is_empty());
        let percent = CandidateRecord::new("Margin", KpiValue::Text("12.5%".into()), "Q1", 1, 2);
        assert!(structural_problems(&percent).is_empty());
    }

    #[test]
    fn unextracted_numbers_accept_separators_and_ignore_extracted_spellings() {
        let targets = kpis(&["revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let table = SourceTable::from_rows(
            "P&L",
            vec!["KPI".into(), "Q1".into(), "Q2".into(), "Q3".into(), "Note".into()],
            vec![
                vec!["Cost".into(), "7".into(), "8".into(), "9".into(), "".into()],
                vec![" Revenue ".into(), "1,000".into(), "2,500.5".into(), "-3".into(), "est.".into()],
                vec!["Revenue".into(), "42".into(), "".into(), "".into(), "".into()],
            ],
        );
        let extracted = vec![CandidateRecord::new("Revenue", KpiValue::Text("1000".into()), "Q1", 2, 2)];
        let out = validator.validate_file(&extracted, &extracted, Ok(vec![table]));
        assert_eq!(out.unextracted_numbers, vec!["-3", "2500.5"]);
    }

    #[test]
    fn unextracted_numbers_include_a_label_in_the_header_row() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let table = SourceTable::from_rows(
            "Summary",
            vec!["Revenue".into(), "100".into(), "200".into()],
            vec![vec!["Revenue".into(), "300".into(), "".into()]],
        );
        let extracted = vec![CandidateRecord::new("Revenue", KpiValue::Number(100.0), "Revenue", 1, 1)];
        let out = validator.validate_file(&extracted, &extracted, Ok(vec![table]));
        assert_eq!(out.unextracted_numbers, vec!["200"]);
    }

    #[test]
    fn implausible_values_are_flagged() {
        let targets = kpis(&["Revenue"]);
        let validator = Validator::new(&targets, ValidatorConfig::default());
        let records = vec![
            CandidateRecord::new("Revenue", KpiValue::Number(5e12), "2023Q1", 1, 2).with_sheet("P&L"),
            CandidateRecord::new("Revenue", KpiValue::Text("NaN".into()), "2023Q2", 1, 3).with_sheet("P&L"),
        ];
        let out = validator.validate_file(&records, &records, Ok(vec![scenario_table()]));
        assert_eq!(
            out.issues,
            vec![
                "Implausible value for Revenue / 2023Q1: 5000000000000",
                "Implausible value for Revenue / 2023Q2: NaN",
            ]
        );
    }
}
