//! Row-window chunking of normalized tables for the extraction model.
//!
//! Every chunk renders as a markdown table whose first column, `row`, carries
//! the source-relative row number, and whose header labels each column with
//! its 1-based number. A model claim of `(row, column)` therefore maps straight
//! back onto [`SourceTable::cell`] without chunk offset arithmetic.

use std::fmt::Write;

use tracing::debug;

use crate::table::{SourceTable, TableChunk, TableRow};

/// Splits `table` into consecutive, non-overlapping windows of at most
/// `max_rows` rows. A window whose rendering exceeds `max_chars` is halved
/// until it fits or holds a single row.
pub fn chunk_table(table: &SourceTable, max_rows: usize, max_chars: usize) -> Vec<TableChunk> {
    let total = table.rows.len();
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < total {
        let mut len = max_rows.max(1).min(total - start);
        while len > 1 {
            let rendered = render_rows(&table.sheet_id, &table.header, &table.rows[start..start + len]);
            if rendered.len() <= max_chars {
                break;
            }
            debug!(
                "Window at row {} of '{}' renders to {} chars (> {max_chars}); halving {len} rows",
                table.rows[start].index,
                table.sheet_id,
                rendered.len()
            );
            len /= 2;
        }
        windows.push(start..start + len);
        start += len;
    }

    let pad = windows.len().max(1).to_string().len();
    windows
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            let rows = table.rows[range].to_vec();
            TableChunk {
                chunk_id: format!("{}-chunk-{:0width$}", table.sheet_id, i, width = pad),
                sheet_id: table.sheet_id.clone(),
                header: table.header.clone(),
                start_row_offset: rows.first().map(|r| r.index).unwrap_or(1),
                rows,
            }
        })
        .collect()
}

/// Markdown rendering of a chunk as sent to the model.
pub fn render_chunk(chunk: &TableChunk) -> String {
    render_rows(&chunk.sheet_id, &chunk.header, &chunk.rows)
}

fn render_rows(sheet_id: &str, header: &[String], rows: &[TableRow]) -> String {
    let width = rows
        .iter()
        .map(|r| r.cells.len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "Sheet: {sheet_id}");

    out.push_str("| row |");
    for col in 0..width {
        let label = header.get(col).map(String::as_str).unwrap_or("");
        let _ = write!(out, " {} (col {}) |", escape(label), col + 1);
    }
    out.push('\n');

    out.push_str("|---:|");
    for _ in 0..width {
        out.push_str("---|");
    }
    out.push('\n');

    for row in rows {
        let _ = write!(out, "| {} |", row.index);
        for col in 0..width {
            let cell = row.cells.get(col).map(String::as_str).unwrap_or("");
            let _ = write!(out, " {} |", escape(cell));
        }
        out.push('\n');
    }
    out
}

fn escape(cell: &str) -> String {
    cell.replace('|', "\\|").replace(|c: char| c == '\r' || c == '\n', " ")
}
