//! XLSX sheet-to-text conversion.
//!
//! Every worksheet is emitted in workbook order as a `# Sheet: <name>` header
//! followed by one line per row with cells joined by tabs. Shared strings,
//! inline strings, booleans and numbers are supported; gaps between cells are
//! kept as empty columns.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use tracing::debug;

use super::{FileFormat, corrupt, open_container, read_member};
use crate::error::ProcessingError;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

/// Extract plain text from an XLSX file held in memory.
pub fn extract_xlsx_text(bytes: &[u8]) -> Result<String, ProcessingError> {
    let mut archive = open_container(FileFormat::Xlsx, bytes)?;

    let workbook = read_member(FileFormat::Xlsx, &mut archive, WORKBOOK_PART)?
        .ok_or_else(|| corrupt(FileFormat::Xlsx, format!("missing {}", WORKBOOK_PART)))?;
    let rels = read_member(FileFormat::Xlsx, &mut archive, WORKBOOK_RELS_PART)?
        .ok_or_else(|| corrupt(FileFormat::Xlsx, format!("missing {}", WORKBOOK_RELS_PART)))?;
    let shared_strings = match read_member(FileFormat::Xlsx, &mut archive, SHARED_STRINGS_PART)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let targets = parse_relationships(&rels)?;
    let sheets = parse_sheets(&workbook)?;

    let mut out = String::new();
    for sheet in &sheets {
        let Some(target) = targets.get(&sheet.relationship_id) else {
            return Err(corrupt(
                FileFormat::Xlsx,
                format!("sheet {} has no relationship target", sheet.name),
            ));
        };
        let part = resolve_target(target);
        let xml = read_member(FileFormat::Xlsx, &mut archive, &part)?
            .ok_or_else(|| corrupt(FileFormat::Xlsx, format!("missing {}", part)))?;

        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("# Sheet: ");
        out.push_str(&sheet.name);
        out.push('\n');
        for row in parse_worksheet(&xml, &shared_strings)? {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
    }

    debug!(
        sheets = sheets.len(),
        characters = out.chars().count(),
        "XLSX text extracted"
    );
    Ok(out)
}

struct SheetRef {
    name: String,
    relationship_id: String,
}

fn xml_error(reader: &Reader<&[u8]>, e: quick_xml::Error) -> ProcessingError {
    corrupt(
        FileFormat::Xlsx,
        format!("XML error at position {}: {}", reader.buffer_position(), e),
    )
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ProcessingError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| corrupt(FileFormat::Xlsx, e))?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|e| corrupt(FileFormat::Xlsx, e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// `<sheet name=".." r:id=".."/>` entries in workbook order
fn parse_sheets(xml: &str) -> Result<Vec<SheetRef>, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attribute(&e, b"name")?.unwrap_or_default();
                let relationship_id = attribute(&e, b"r:id")?
                    .ok_or_else(|| corrupt(FileFormat::Xlsx, format!("sheet {} has no r:id", name)))?;
                sheets.push(SheetRef {
                    name,
                    relationship_id,
                });
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    Ok(sheets)
}

/// Relationship id to target path
fn parse_relationships(xml: &str) -> Result<HashMap<String, String>, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    let mut targets = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id")?, attribute(&e, b"Target")?)
                {
                    targets.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    Ok(targets)
}

/// Targets are relative to `xl/` unless absolute within the package
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

/// Shared string table. Rich-text items concatenate their runs; phonetic
/// hints (`rPh`) are skipped.
fn parse_shared_strings(xml: &str) -> Result<Vec<String>, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text && !in_phonetic => {
                if let Some(current) = current.as_mut() {
                    let text = t.unescape().map_err(|e| xml_error(&reader, e))?;
                    current.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    Ok(strings)
}

/// Zero-based column index of a cell reference such as `AB12`
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: Vec<u8> = cell_ref
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for b in letters {
        index = index * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize;
    }
    Some(index - 1)
}

#[derive(Default)]
struct CellState {
    column: Option<usize>,
    cell_type: Option<String>,
    value: String,
}

/// Rows of a worksheet with trailing empty cells trimmed. Rows without any
/// value are dropped.
fn parse_worksheet(xml: &str, shared_strings: &[String]) -> Result<Vec<Vec<String>>, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell: Option<CellState> = None;
    let mut in_value = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row = Vec::new(),
                b"c" => {
                    cell = Some(CellState {
                        column: attribute(&e, b"r")?.as_deref().and_then(column_index),
                        cell_type: attribute(&e, b"t")?,
                        value: String::new(),
                    });
                }
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    if let Some(state) = cell.take() {
                        place_cell(&mut row, state, shared_strings);
                    }
                }
                b"row" => {
                    while row.last().is_some_and(|v| v.is_empty()) {
                        row.pop();
                    }
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                if let Some(state) = cell.as_mut() {
                    let text = t.unescape().map_err(|e| xml_error(&reader, e))?;
                    state.value.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    Ok(rows)
}

fn place_cell(row: &mut Vec<String>, state: CellState, shared_strings: &[String]) {
    let value = match state.cell_type.as_deref() {
        Some("s") => state
            .value
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i).cloned())
            .unwrap_or_default(),
        Some("b") => match state.value.trim() {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        // inlineStr, str (formula result), e (error) and numbers as written
        _ => state.value,
    };

    let column = state.column.unwrap_or(row.len());
    if column >= row.len() {
        row.resize(column, String::new());
        row.push(value);
    } else {
        row[column] = value;
    }
}
