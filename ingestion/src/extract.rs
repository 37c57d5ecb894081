use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Markdown,
    Json,
    Pdf,
    Docx,
    Unsupported,
}

pub fn detect_content_kind(mime_type: &str, filename: Option<&str>) -> ContentKind {
    let mime = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.as_str() {
        "text/plain" => ContentKind::Text,
        "text/markdown" => ContentKind::Markdown,
        "application/json" => ContentKind::Json,
        "application/pdf" => ContentKind::Pdf,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            ContentKind::Docx
        }
        _ => {
            if let Some(name) = filename {
                let ext = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase();
                match ext.as_str() {
                    "txt" => ContentKind::Text,
                    "md" | "markdown" => ContentKind::Markdown,
                    "json" => ContentKind::Json,
                    "pdf" => ContentKind::Pdf,
                    "docx" => ContentKind::Docx,
                    _ => ContentKind::Unsupported,
                }
            } else {
                ContentKind::Unsupported
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("invalid UTF-8 content")]
    InvalidUtf8,
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction produced no text")]
    Empty,
}

/// Page cap applied to paged formats (PDF form-feed breaks, DOCX explicit
/// page breaks) before a document is considered for chunking (spec.md
/// §4.6 step c).
pub const MAX_PAGES_PER_DOCUMENT: usize = 500;

/// Character cap applied to the final normalized text of any parser
/// (spec.md §4.6 step c: "truncate at a configured maximum").
pub const MAX_EXTRACTED_CHARS: usize = 2_000_000;

/// Result of a parser run (spec.md §4.6 step c: "tolerates partial page
/// failures, records warnings").
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub text: String,
    pub warnings: Vec<String>,
}

fn truncate_with_cap(text: String, warnings: &mut Vec<String>) -> String {
    if text.chars().count() <= MAX_EXTRACTED_CHARS {
        return text;
    }
    warnings.push(format!(
        "text truncated at {MAX_EXTRACTED_CHARS} characters"
    ));
    text.chars().take(MAX_EXTRACTED_CHARS).collect()
}

/// NUL bytes and runs of 3+ whitespace chars are collapsed, matching the
/// parser registry's normalization step.
pub fn normalize_text(text: &str) -> String {
    let without_nul: String = text.chars().filter(|&c| c != '\0').collect();
    let mut normalized = String::with_capacity(without_nul.len());
    let mut whitespace_run = 0;
    for c in without_nul.chars() {
        if c.is_whitespace() {
            whitespace_run += 1;
            if whitespace_run <= 2 {
                normalized.push(c);
            }
        } else {
            whitespace_run = 0;
            normalized.push(c);
        }
    }
    normalized
}

pub fn extract_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::InvalidUtf8)
}

fn extract_plain_text(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let raw = extract_utf8(bytes)?;
    if raw.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    let mut warnings = Vec::new();
    let text = truncate_with_cap(normalize_text(&raw), &mut warnings);
    Ok(ExtractedText { text, warnings })
}

/// `pdf-extract` separates pages in its plain-text output with form-feed
/// characters; that is the only page granularity the crate's simple API
/// exposes, so the page cap below is enforced on that split rather than on
/// a true per-page parse.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let raw = match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => return Err(ExtractError::Empty),
        Err(err) => return Err(ExtractError::Failed(err.to_string())),
    };

    let mut warnings = Vec::new();
    let pages: Vec<&str> = raw.split('\u{c}').collect();
    let page_count = pages.len();
    let joined = if page_count > MAX_PAGES_PER_DOCUMENT {
        warnings.push(format!(
            "document has {page_count} pages, only the first {MAX_PAGES_PER_DOCUMENT} were extracted"
        ));
        pages.into_iter().take(MAX_PAGES_PER_DOCUMENT).collect::<Vec<_>>().join("\n")
    } else {
        pages.join("\n")
    };

    let text = truncate_with_cap(normalize_text(&joined), &mut warnings);
    Ok(ExtractedText { text, warnings })
}

/// Extracts the visible text nodes from `word/document.xml` inside a DOCX
/// (OOXML) zip archive. Runs (`<w:t>`) are joined with no separator, and
/// paragraphs (`<w:p>`) are joined with newlines. A run whose escaped text
/// fails to decode is skipped and recorded as a warning rather than
/// aborting the whole document, and an explicit page break
/// (`<w:br w:type="page"/>`) beyond `MAX_PAGES_PER_DOCUMENT` stops
/// extraction early.
pub fn extract_docx_text(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let cursor = Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|err| ExtractError::Failed(err.to_string()))?;
    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Failed("missing word/document.xml".to_string()))?
        .read_to_string(&mut document_xml)
        .map_err(|err| ExtractError::Failed(err.to_string()))?;

    let mut reader = Reader::from_str(&document_xml);
    reader.trim_text(true);

    let mut warnings = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut buf = Vec::new();
    let mut in_text_node = false;
    let mut page_count = 1usize;
    let mut run_index = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"t" => in_text_node = true,
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"t" => in_text_node = false,
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"p" => {
                paragraphs.push(std::mem::take(&mut current));
            }
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"br" => {
                let is_page_break = e.attributes().flatten().any(|attr| {
                    attr.key.local_name().as_ref() == b"type" && attr.value.as_ref() == b"page"
                });
                if is_page_break {
                    page_count += 1;
                    if page_count > MAX_PAGES_PER_DOCUMENT {
                        warnings.push(format!(
                            "document has more than {MAX_PAGES_PER_DOCUMENT} pages, extraction stopped early"
                        ));
                        break;
                    }
                }
            }
            Ok(Event::Text(e)) if in_text_node => {
                run_index += 1;
                match e.unescape() {
                    Ok(text) => current.push_str(&text),
                    Err(err) => warnings.push(format!("run {run_index} skipped: {err}")),
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ExtractError::Failed(err.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    let raw = paragraphs.join("\n");
    if raw.trim().is_empty() {
        return Err(ExtractError::Empty);
    }

    let text = truncate_with_cap(normalize_text(&raw), &mut warnings);
    Ok(ExtractedText { text, warnings })
}

/// MIME-dispatched parser registry (spec.md §4.6 step c). Keyed by
/// normalized `ContentKind` rather than raw MIME string so callers never
/// need to worry about MIME parameter suffixes (`;charset=...`).
pub struct ParserRegistry;

impl ParserRegistry {
    pub fn extract(
        &self,
        kind: ContentKind,
        bytes: &[u8],
        allow_empty: bool,
    ) -> Result<ExtractedText, ExtractError> {
        let result = match kind {
            ContentKind::Text | ContentKind::Markdown | ContentKind::Json => {
                extract_plain_text(bytes)
            }
            ContentKind::Pdf => extract_pdf_text(bytes),
            ContentKind::Docx => extract_docx_text(bytes),
            ContentKind::Unsupported => {
                return Err(ExtractError::Unsupported("unrecognized content kind".to_string()))
            }
        };

        match result {
            Ok(extracted) if extracted.text.trim().is_empty() && !allow_empty => {
                Err(ExtractError::Empty)
            }
            Ok(extracted) => Ok(extracted),
            Err(ExtractError::Empty) if allow_empty => Ok(ExtractedText::default()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_docx_by_mime_and_extension() {
        assert_eq!(
            detect_content_kind(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                None
            ),
            ContentKind::Docx
        );
        assert_eq!(
            detect_content_kind("application/octet-stream", Some("report.docx")),
            ContentKind::Docx
        );
    }

    #[test]
    fn normalize_collapses_nul_and_whitespace_runs() {
        let input = "a\0b     c";
        assert_eq!(normalize_text(input), "ab  c");
    }

    #[test]
    fn registry_rejects_empty_extraction_by_default() {
        let registry = ParserRegistry;
        let err = registry
            .extract(ContentKind::Text, b"   ", false)
            .unwrap_err();
        assert_eq!(err, ExtractError::Empty);
    }

    #[test]
    fn registry_allows_empty_extraction_when_configured() {
        let registry = ParserRegistry;
        let extracted = registry.extract(ContentKind::Text, b"   ", true).unwrap();
        assert_eq!(extracted.text, "");
    }

    #[test]
    fn plain_text_is_truncated_at_character_cap_with_warning() {
        let oversized = "a".repeat(MAX_EXTRACTED_CHARS + 10);
        let registry = ParserRegistry;
        let extracted = registry
            .extract(ContentKind::Text, oversized.as_bytes(), false)
            .unwrap();
        assert_eq!(extracted.text.chars().count(), MAX_EXTRACTED_CHARS);
        assert_eq!(extracted.warnings.len(), 1);
        assert!(extracted.warnings[0].contains("truncated"));
    }
}
