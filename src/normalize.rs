//! Table normalizer: turns workbook sheets and CSV files into [`SourceTable`]s.
//!
//! Hidden rows and columns are removed first, then rows and columns that are
//! entirely blank, then the first remaining row becomes the header.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader, SheetType, SheetVisible};
use tracing::{debug, info, warn};

use crate::error::{KpiError, Result};
use crate::record::canonical_number;
use crate::table::SourceTable;
use crate::visibility::{load_xlsx_visibility, SheetVisibility};

/// Directory, next to the source workbook, that receives per-sheet CSV exports.
pub const EXPORT_DIR: &str = "converted_csvs";

/// Sheet name assumed when a workbook reports no sheets at all.
const FALLBACK_SHEET: &str = "Sheet1";

/// Tables read from one input file, plus sheets that could not be read.
#[derive(Debug, Default)]
pub struct LoadedFile {
    pub tables: Vec<SourceTable>,
    pub sheet_errors: Vec<String>,
}

/// Loads every visible sheet of `path` as a normalized table.
///
/// Fails only when the file itself cannot be opened; individual sheets that
/// fail to parse are listed in [`LoadedFile::sheet_errors`].
pub fn load_tables(path: &Path) -> Result<LoadedFile> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "xlsx" | "xlsm" | "xlsb" | "xls" => load_workbook(path, extension == "xlsx" || extension == "xlsm"),
        "csv" => load_csv(path),
        _ => Err(KpiError::UnsupportedFile(path.to_path_buf())),
    }
}

fn load_workbook(path: &Path, has_xml_parts: bool) -> Result<LoadedFile> {
    let mut workbook = open_workbook_auto(path).map_err(|source| KpiError::Spreadsheet {
        path: path.to_path_buf(),
        source,
    })?;

    let visibility = if has_xml_parts {
        match load_xlsx_visibility(path) {
            Ok(visibility) => visibility,
            Err(e) => {
                warn!(
                    "⚠️ Could not read row/column visibility of {}: {e}; treating every row and column as visible",
                    path.display()
                );
                HashMap::new()
            }
        }
    } else {
        debug!("No row/column visibility data for {}; treating every row and column as visible", path.display());
        HashMap::new()
    };

    let mut names = Vec::new();
    for sheet in workbook.sheets_metadata() {
        if sheet.typ != SheetType::WorkSheet {
            debug!("Skipping non-worksheet '{}'", sheet.name);
        } else if sheet.visible != SheetVisible::Visible {
            info!("🙈 Skipping hidden sheet '{}'", sheet.name);
        } else {
            names.push(sheet.name.clone());
        }
    }
    if workbook.sheets_metadata().is_empty() {
        warn!(
            "⚠️ {} reports no sheets; falling back to '{FALLBACK_SHEET}'",
            path.display()
        );
        names.push(FALLBACK_SHEET.to_string());
    }

    let mut loaded = LoadedFile::default();
    for name in names {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                warn!("⚠️ Skipping sheet '{name}' of {}: {e}", path.display());
                loaded.sheet_errors.push(format!("sheet '{name}': {e}"));
                continue;
            }
        };
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let grid: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        let sheet_visibility = visibility.get(&name).cloned().unwrap_or_default();
        let (hidden_rows, hidden_cols) = hidden_grid_positions(&sheet_visibility, start_row, start_col, &grid);

        let table = normalize_grid(&name, &grid, &hidden_rows, &hidden_cols);
        debug!(
            "Sheet '{name}': {} data rows x {} columns after normalization",
            table.rows.len(),
            table.width()
        );
        loaded.tables.push(table);
    }
    Ok(loaded)
}

/// Maps 1-based sheet coordinates onto 0-based positions in a range that starts at `(start_row, start_col)`.
fn hidden_grid_positions(
    visibility: &SheetVisibility,
    start_row: u32,
    start_col: u32,
    grid: &[Vec<String>],
) -> (BTreeSet<usize>, BTreeSet<usize>) {
    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    let rows = (0..grid.len())
        .filter(|i| visibility.row_hidden(start_row + *i as u32 + 1))
        .collect();
    let cols = (0..width)
        .filter(|j| visibility.col_hidden(start_col + *j as u32 + 1))
        .collect();
    (rows, cols)
}

fn load_csv(path: &Path) -> Result<LoadedFile> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut grid = Vec::new();
    for record in reader.records() {
        grid.push(record?.iter().map(str::to_string).collect::<Vec<_>>());
    }
    let sheet_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(FALLBACK_SHEET);
    let table = normalize_grid(sheet_id, &grid, &BTreeSet::new(), &BTreeSet::new());
    Ok(LoadedFile {
        tables: vec![table],
        sheet_errors: Vec::new(),
    })
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => canonical_number(*f),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            let pattern = if serial.fract() == 0.0 { "%Y-%m-%d" } else { "%Y-%m-%d %H:%M:%S" };
            dt.as_datetime()
                .map(|d| d.format(pattern).to_string())
                .unwrap_or_else(|| canonical_number(serial))
        }
        Data::Error(e) => format!("#{e:?}"),
    }
}

fn is_blank(cell: &str) -> bool {
    cell.trim().is_empty()
}

/// Applies the normalization rules to a raw grid.
///
/// `hidden_rows`/`hidden_cols` are 0-based positions in `grid`. Ragged rows are
/// padded with empty cells.
pub fn normalize_grid(
    sheet_id: &str,
    grid: &[Vec<String>],
    hidden_rows: &BTreeSet<usize>,
    hidden_cols: &BTreeSet<usize>,
) -> SourceTable {
    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    let visible_cols: Vec<usize> = (0..width).filter(|c| !hidden_cols.contains(c)).collect();

    let rows: Vec<Vec<&str>> = grid
        .iter()
        .enumerate()
        .filter(|(i, _)| !hidden_rows.contains(i))
        .map(|(_, row)| {
            visible_cols
                .iter()
                .map(|c| row.get(*c).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.iter().all(|cell| is_blank(cell)))
        .collect();

    let kept_cols: Vec<usize> = (0..visible_cols.len())
        .filter(|c| rows.iter().any(|row| !is_blank(row[*c])))
        .collect();

    let mut rows = rows
        .into_iter()
        .map(|row| kept_cols.iter().map(|c| row[*c].to_string()).collect::<Vec<_>>());

    match rows.next() {
        Some(header) => SourceTable::from_rows(sheet_id, header, rows.collect()),
        None => SourceTable::from_rows(sheet_id, Vec::new(), Vec::new()),
    }
}

/// Writes each table to `<dir of source>/converted_csvs/<stem>_<sheet>.csv`.
pub fn export_csv(source: &Path, tables: &[SourceTable]) -> Result<Vec<PathBuf>> {
    let dir = source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(EXPORT_DIR);
    fs::create_dir_all(&dir)?;
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table");

    let mut written = Vec::with_capacity(tables.len());
    for table in tables {
        let path = dir.join(format!("{stem}_{}.csv", table.sheet_id));
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&path)?;
        for row in table.to_grid() {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("💾 Exported '{}' to {}", table.sheet_id, path.display());
        written.push(path);
    }
    Ok(written)
}
