//! Text extraction for binary documents.
//!
//! The origin adapter calls [`extract_text`] for binaries whose content
//! type is text-extractable (PDF, DOCX, PPTX). An empty extraction
//! result is not an error here; the adapter treats it as a signal to
//! fall back to opaque-binary handling.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Decompressed-size ceiling per ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// True when [`extract_text`] can handle this content type.
pub fn is_extractable(mime_type: &str) -> bool {
    matches!(mime_type, MIME_PDF | MIME_DOCX | MIME_PPTX)
}

/// Extract plain UTF-8 text from a supported binary document.
pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
    match mime_type {
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Malformed(e.to_string())),
        MIME_DOCX => extract_ooxml(bytes, &["word/document.xml"]),
        MIME_PPTX => {
            let slides = sorted_slide_entries(bytes)?;
            let refs: Vec<&str> = slides.iter().map(String::as_str).collect();
            extract_ooxml(bytes, &refs)
        }
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

/// Pull the text runs (`<w:t>` / `<a:t>`) out of the named XML entries
/// of an OOXML archive, joined with spaces in entry order.
fn extract_ooxml(bytes: &[u8], entries: &[&str]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Malformed(e.to_string()))?;

    let mut parts = Vec::new();
    for name in entries {
        let xml = read_entry(&mut archive, name)?;
        let text = collect_text_runs(&xml)?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join(" "))
}

fn sorted_slide_entries(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Malformed(e.to_string()))?;
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    Ok(names)
}

fn read_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Malformed(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Malformed(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Malformed(format!(
            "{} exceeds {} byte limit",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Collect the character content of every `t` element (any namespace).
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut out = String::new();
    let mut buf = Vec::new();
    let mut depth_in_t = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"t" => {
                depth_in_t += 1;
            }
            Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"t" => {
                depth_in_t = depth_in_t.saturating_sub(1);
            }
            Ok(quick_xml::events::Event::Text(t)) if depth_in_t > 0 => {
                let piece = t.unescape().unwrap_or_default();
                if !piece.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(piece.as_ref());
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
