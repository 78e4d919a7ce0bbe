//! Text extraction for uploaded files (PDF, DOCX, PPTX, plain text).
//!
//! The content type is decided from the file extension; extraction turns the
//! raw bytes into plain UTF-8 text. Failures are reported as
//! [`ExtractError`] and never panic, so a bad upload only fails its own
//! request.

use std::io::Read;

use quick_xml::events::Event;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Map a filename's extension to a supported content type.
pub fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        "txt" | "text" => Some(MIME_TEXT),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        _ => None,
    }
}

/// Extract plain text from `bytes` of the given content type.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_TEXT | MIME_MARKDOWN => Ok(String::from_utf8_lossy(bytes).into_owned()),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slides {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if text.trim().is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(text.trim_end());
    }
    Ok(out)
}

/// Concatenate `<*:t>` text runs, one line per `<*:p>` paragraph.
///
/// Works for both WordprocessingML (`w:t`/`w:p`) and DrawingML (`a:t`/`a:p`).
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    let mut line_has_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if line_has_text => {
                    out.push('\n');
                    line_has_text = false;
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                if !text.is_empty() {
                    out.push_str(&text);
                    line_has_text = true;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}
