//! PDF page text extraction.
//!
//! Used by the local text detector. Each page yields its text lines, the
//! analogue of LINE blocks in a text-detection result.

use pdfium_render::prelude::*;
use tracing::{info, warn};

use crate::error::ProcessingError;

/// Create a new Pdfium instance (dynamically linked).
///
/// Searches for libpdfium in:
/// 1. Current directory (./libpdfium.so)
/// 2. vendor/pdfium/lib/
/// 3. System library paths
pub fn create_pdfium() -> Result<Pdfium, ProcessingError> {
    // Try local paths first, then system
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ProcessingError::TextExtraction {
            page: 0,
            source: Box::new(std::io::Error::other(format!(
                "Failed to load PDFium library: {:?}",
                e
            ))),
        })?;

    Ok(Pdfium::new(bindings))
}

/// Text lines of every page, in page order. Blank lines are dropped.
pub fn extract_pdf_lines(bytes: &[u8]) -> Result<Vec<Vec<String>>, ProcessingError> {
    let pdfium = create_pdfium()?;

    let document =
        pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| ProcessingError::CorruptDocument {
                format: "PDF".to_string(),
                message: format!("Failed to load PDF: {:?}", e),
            })?;

    let page_count = document.pages().len();
    info!(pages = page_count, "Detecting PDF text");

    let mut pages = Vec::with_capacity(page_count as usize);
    for (page_index, page) in document.pages().iter().enumerate() {
        let page_num = page_index as u32 + 1;

        let text = page.text().map_err(|e| {
            warn!(page = page_num, error = ?e, "Failed to get text object for page");
            ProcessingError::TextExtraction {
                page: page_num,
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to extract text from page {}: {:?}", page_num, e),
                )),
            }
        })?;

        pages.push(split_lines(&text.all()));
    }

    Ok(pages)
}

/// Split page text into trimmed, non-empty lines
pub fn split_lines(page_text: &str) -> Vec<String> {
    page_text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join detected lines: lines by `\n`, pages by a blank line
pub fn join_pages(pages: &[Vec<String>]) -> String {
    pages
        .iter()
        .filter(|lines| !lines.is_empty())
        .map(|lines| lines.join("\n"))
        .collect::<Vec<_>>()
        .join("\n\n")
}
