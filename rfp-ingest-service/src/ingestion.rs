//! Text extraction for uploaded documents.
//!
//! Format detection plus the synchronous extractors for Office containers.
//! PDF goes through the asynchronous text detector instead, which uses the
//! page extraction in [`pdf`].

pub mod docx;
pub mod hash;
pub mod pdf;
pub mod xlsx;

use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::{ProcessingError, ServiceResult};

/// Document formats the pipeline routes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileFormat {
    Pdf,
    Docx,
    Xlsx,
    Unsupported,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "PDF",
            FileFormat::Docx => "DOCX",
            FileFormat::Xlsx => "XLSX",
            FileFormat::Unsupported => "UNSUPPORTED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PDF" => FileFormat::Pdf,
            "DOCX" => FileFormat::Docx,
            "XLSX" => FileFormat::Xlsx,
            _ => FileFormat::Unsupported,
        }
    }

    fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_lowercase().as_str() {
            "pdf" => Some(FileFormat::Pdf),
            "docx" => Some(FileFormat::Docx),
            "xlsx" => Some(FileFormat::Xlsx),
            _ => None,
        }
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let mime: mime::Mime = content_type.parse().ok()?;
        match mime.essence_str() {
            "application/pdf" => Some(FileFormat::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(FileFormat::Docx)
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Some(FileFormat::Xlsx)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Determine the format from the file extension, falling back to the
/// content type.
pub fn detect_format(file_key: &str, content_type: Option<&str>) -> FileFormat {
    Path::new(file_key)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(FileFormat::from_extension)
        .or_else(|| content_type.and_then(FileFormat::from_content_type))
        .unwrap_or(FileFormat::Unsupported)
}

/// Extract plain text from an Office container (DOCX or XLSX)
pub fn extract_office_text(format: FileFormat, bytes: &[u8]) -> ServiceResult<String> {
    let text = match format {
        FileFormat::Docx => docx::extract_docx_text(bytes)?,
        FileFormat::Xlsx => xlsx::extract_xlsx_text(bytes)?,
        other => {
            return Err(ProcessingError::UnsupportedFormat {
                format: other.to_string(),
            }
            .into());
        }
    };

    Ok(text)
}

/// Open a zip container held in memory
fn open_container(
    format: FileFormat,
    bytes: &[u8],
) -> Result<zip::ZipArchive<Cursor<&[u8]>>, ProcessingError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(format, e))
}

/// Read one member of a zip container as UTF-8
fn read_member(
    format: FileFormat,
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ProcessingError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(corrupt(format, e)),
    };

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| corrupt(format, format!("{}: {}", name, e)))?;
    Ok(Some(content))
}

fn corrupt(format: FileFormat, message: impl std::fmt::Display) -> ProcessingError {
    ProcessingError::CorruptDocument {
        format: format.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format_prefers_extension() {
        assert_eq!(detect_format("a/b/report.PDF", None), FileFormat::Pdf);
        assert_eq!(
            detect_format("a/b/answers.docx", Some("application/pdf")),
            FileFormat::Docx
        );
        assert_eq!(detect_format("pricing.xlsx", None), FileFormat::Xlsx);
    }

    #[test]
    fn test_detect_format_falls_back_to_content_type() {
        assert_eq!(
            detect_format("upload", Some("application/pdf; charset=binary")),
            FileFormat::Pdf
        );
        assert_eq!(
            detect_format(
                "upload.bin",
                Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
            ),
            FileFormat::Xlsx
        );
        assert_eq!(
            detect_format("notes.txt", Some("text/plain")),
            FileFormat::Unsupported
        );
        assert_eq!(detect_format("notes", None), FileFormat::Unsupported);
    }

    #[test]
    fn test_corrupt_container_is_reported() {
        let err = extract_office_text(FileFormat::Docx, b"not a zip").unwrap_err();
        assert!(matches!(
            err,
            crate::error::ServiceError::Processing(ProcessingError::CorruptDocument { .. })
        ));
    }

    #[test]
    fn test_pdf_is_not_an_office_format() {
        let err = extract_office_text(FileFormat::Pdf, b"%PDF-1.7").unwrap_err();
        assert_eq!(err.error_code(), "unsupported_format");
    }
}
