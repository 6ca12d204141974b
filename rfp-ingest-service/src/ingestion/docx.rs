//! DOCX text extraction.
//!
//! Walks `word/document.xml` and emits the text of `w:t` runs. Paragraphs end
//! a line, `w:tab` becomes a tab and `w:br` / `w:cr` become line breaks.

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;

use super::{FileFormat, corrupt, open_container, read_member};
use crate::error::ProcessingError;

const DOCUMENT_PART: &str = "word/document.xml";

/// Extract plain text from a DOCX file held in memory.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, ProcessingError> {
    let mut archive = open_container(FileFormat::Docx, bytes)?;
    let xml = read_member(FileFormat::Docx, &mut archive, DOCUMENT_PART)?
        .ok_or_else(|| corrupt(FileFormat::Docx, format!("missing {}", DOCUMENT_PART)))?;

    let text = document_xml_to_text(&xml)?;
    debug!(characters = text.chars().count(), "DOCX text extracted");
    Ok(text)
}

fn document_xml_to_text(xml: &str) -> Result<String, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"w:t" {
                    in_text_run = true;
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                // Self-closing paragraph is an empty line
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                let text = t.unescape().map_err(|e| corrupt(FileFormat::Docx, e))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(corrupt(
                    FileFormat::Docx,
                    format!("XML error at position {}: {}", reader.buffer_position(), e),
                ));
            }
        }
    }

    Ok(out)
}
