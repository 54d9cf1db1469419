//! Normalized tables and the row windows cut from them.
//!
//! Row and column numbers are 1-based everywhere they leave this module: data
//! row 1 is the first row after the header, column 1 is the first retained
//! column. [`SourceTable::cell`] is the only place that converts to 0-based
//! storage offsets.

use serde::Serialize;

/// One data row of a normalized table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    /// 1-based position among the data rows of the normalized table.
    pub index: usize,
    pub cells: Vec<String>,
}

/// A normalized sheet: visible, non-blank rows and columns with the first
/// remaining row promoted to header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTable {
    pub sheet_id: String,
    pub header: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl SourceTable {
    /// Builds a table from a header and data rows, numbering the rows from 1.
    pub fn from_rows(sheet_id: impl Into<String>, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, cells)| TableRow { index: i + 1, cells })
            .collect();
        Self {
            sheet_id: sheet_id.into(),
            header,
            rows,
        }
    }

    pub fn width(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.cells.len())
            .chain(std::iter::once(self.header.len()))
            .max()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&TableRow> {
        self.rows
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.rows[pos])
    }

    /// Literal cell at a 1-based (row, column) address.
    ///
    /// `None` means the address does not exist in this table; `Some("")` means
    /// the cell exists but is empty.
    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        if column == 0 || column > self.width() {
            return None;
        }
        let row = self.row(row)?;
        Some(row.cells.get(column - 1).map(String::as_str).unwrap_or(""))
    }

    /// Row-major grid including the header, as written to CSV exports.
    pub fn to_grid(&self) -> Vec<Vec<String>> {
        std::iter::once(self.header.clone())
            .chain(self.rows.iter().map(|r| r.cells.clone()))
            .collect()
    }
}

/// A contiguous window of rows from one [`SourceTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableChunk {
    pub chunk_id: String,
    pub sheet_id: String,
    pub header: Vec<String>,
    /// Source-relative index of the first row in the window.
    pub start_row_offset: usize,
    pub rows: Vec<TableRow>,
}

impl TableChunk {
    #[cfg(test)]
    pub fn row_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.iter().map(|r| r.index)
    }
}
