//! Hidden row and column detection for `.xlsx` workbooks.
//!
//! calamine exposes sheet visibility but not row/column visibility, so the
//! worksheet XML parts are read directly: `xl/workbook.xml` maps sheet names
//! to relationship ids, `xl/_rels/workbook.xml.rels` maps those ids to part
//! paths, and each worksheet part carries `<row hidden="1">` and
//! `<col min max hidden="1">` markers.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::ZipArchive;

use crate::error::{KpiError, Result};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

/// Hidden rows and columns of one worksheet, as 1-based sheet coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetVisibility {
    pub hidden_rows: BTreeSet<u32>,
    pub hidden_cols: BTreeSet<u32>,
}

impl SheetVisibility {
    pub fn row_hidden(&self, row: u32) -> bool {
        self.hidden_rows.contains(&row)
    }

    pub fn col_hidden(&self, col: u32) -> bool {
        self.hidden_cols.contains(&col)
    }
}

/// Reads row/column visibility for every worksheet of an `.xlsx` file, keyed by sheet name.
pub fn load_xlsx_visibility(path: &Path) -> Result<HashMap<String, SheetVisibility>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    read_visibility(&mut archive)
}

pub fn read_visibility<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<HashMap<String, SheetVisibility>> {
    let workbook = read_part(archive, WORKBOOK_PART)?
        .ok_or_else(|| KpiError::Workbook(format!("missing {WORKBOOK_PART}")))?;
    let sheets = parse_workbook_sheets(&workbook)?;

    let relationships = match read_part(archive, WORKBOOK_RELS_PART)? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };

    let mut result = HashMap::new();
    for (name, rel_id) in sheets {
        let Some(target) = relationships.get(&rel_id) else {
            return Err(KpiError::Workbook(format!(
                "sheet '{name}' refers to unknown relationship '{rel_id}'"
            )));
        };
        let part = resolve_target(target);
        let visibility = match read_part(archive, &part)? {
            Some(xml) => parse_sheet_visibility(&xml)?,
            None => {
                return Err(KpiError::Workbook(format!("missing worksheet part {part}")));
            }
        };
        result.insert(name, visibility);
    }
    Ok(result)
}

/// Reads a part by name, ignoring case and path separator style.
fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
    let pattern = name.replace('\\', "/");
    let found = archive
        .file_names()
        .find(|candidate| pattern.eq_ignore_ascii_case(candidate))
        .map(str::to_owned);
    let Some(found) = found else {
        return Ok(None);
    };
    let mut text = String::new();
    archive.by_name(&found)?.read_to_string(&mut text)?;
    Ok(Some(text))
}

fn resolve_target(target: &str) -> String {
    let target = target.replace('\\', "/");
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target.trim_start_matches("./")),
    }
}

fn attribute(event: &BytesStart, local: &[u8]) -> Result<Option<String>> {
    for attr in event.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == local {
            let raw = std::str::from_utf8(&attr.value).map_err(|e| KpiError::Workbook(e.to_string()))?;
            let value = unescape(raw).map_err(|e| KpiError::Workbook(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn is_hidden(event: &BytesStart) -> Result<bool> {
    Ok(matches!(attribute(event, b"hidden")?.as_deref(), Some("1") | Some("true")))
}

fn parse_number(value: Option<String>, what: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| KpiError::Workbook(format!("invalid {what} '{v}'")))
        })
        .transpose()
}

/// `(sheet name, relationship id)` in workbook order.
fn parse_workbook_sheets(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attribute(&e, b"name")?;
                let rel_id = attribute(&e, b"id")?;
                if let (Some(name), Some(rel_id)) = (name, rel_id) {
                    sheets.push((name, rel_id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut relationships = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id")?, attribute(&e, b"Target")?) {
                    relationships.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(relationships)
}

fn parse_sheet_visibility(xml: &str) -> Result<SheetVisibility> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut visibility = SheetVisibility::default();
    // rows without an explicit `r` follow the previous one
    let mut last_row = 0u32;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    let row = parse_number(attribute(&e, b"r")?, "row number")?.unwrap_or(last_row + 1);
                    last_row = row;
                    if is_hidden(&e)? {
                        visibility.hidden_rows.insert(row);
                    }
                }
                b"col" => {
                    if is_hidden(&e)? {
                        let min = parse_number(attribute(&e, b"min")?, "column bound")?;
                        let max = parse_number(attribute(&e, b"max")?, "column bound")?;
                        if let Some(min) = min {
                            visibility.hidden_cols.extend(min..=max.unwrap_or(min));
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(visibility)
}
