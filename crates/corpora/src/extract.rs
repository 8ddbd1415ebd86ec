//! Extraction strategies: raw uploaded bytes to plain UTF-8 text.
//!
//! Strategies form a closed registry keyed by name. A collection maps each
//! content-type tag to a strategy name; documents whose content type has no
//! mapping fall back to a built-in default per MIME type. Unknown strategies
//! and unmapped content types are permanent failures: retrying them on the
//! next rebuild cannot succeed.

use std::collections::BTreeMap;
use std::io::Read;

use thiserror::Error;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unknown extraction strategy: {0}")]
    UnknownStrategy(String),
    #[error("no extraction strategy for content-type: {0}")]
    UnsupportedContentType(String),
    #[error("document is not valid UTF-8")]
    InvalidUtf8,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl ExtractError {
    /// Permanent failures are configuration problems; a rebuild with the
    /// same inputs will fail the same way, so the document is not retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExtractError::UnknownStrategy(_) | ExtractError::UnsupportedContentType(_)
        )
    }
}

/// Resolve the strategy name for a content type from the collection's
/// mapping, falling back to built-in defaults.
pub fn resolve_strategy(
    mapping: &BTreeMap<String, String>,
    content_type: &str,
) -> Result<String, ExtractError> {
    if let Some(name) = mapping.get(content_type) {
        return Ok(name.clone());
    }
    match content_type {
        MIME_TEXT => Ok("plain".to_string()),
        MIME_MARKDOWN => Ok("markdown".to_string()),
        MIME_HTML => Ok("html".to_string()),
        MIME_PDF => Ok("pdf".to_string()),
        MIME_DOCX => Ok("docx".to_string()),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

/// Extract plain text from raw bytes using a named strategy.
pub fn extract_text(bytes: &[u8], strategy: &str) -> Result<String, ExtractError> {
    match strategy {
        "plain" | "markdown" => extract_utf8(bytes),
        "html" => extract_html(bytes),
        "pdf" => extract_pdf(bytes),
        "docx" => extract_docx(bytes),
        other => Err(ExtractError::UnknownStrategy(other.to_string())),
    }
}

fn extract_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| ExtractError::InvalidUtf8)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Strip markup from HTML, skipping script and style bodies. Decodes the
/// handful of entities that matter for prose.
fn extract_html(bytes: &[u8]) -> Result<String, ExtractError> {
    let html = std::str::from_utf8(bytes).map_err(|_| ExtractError::InvalidUtf8)?;
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut skip_until: Option<&str> = None;

    while let Some(lt) = rest.find('<') {
        if skip_until.is_none() {
            push_decoded(&mut out, &rest[..lt]);
        }
        let tag_end = match rest[lt..].find('>') {
            Some(gt) => lt + gt + 1,
            None => break,
        };
        let tag = rest[lt + 1..tag_end - 1].trim();
        let tag_name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match skip_until {
            Some(until) if tag.starts_with('/') && tag_name == until => skip_until = None,
            None if tag_name == "script" || tag_name == "style" => {
                skip_until = Some(if tag_name == "script" { "script" } else { "style" });
            }
            _ => {}
        }
        // Block-level boundaries become paragraph breaks.
        if matches!(tag_name.as_str(), "p" | "div" | "br" | "li" | "h1" | "h2" | "h3") {
            out.push_str("\n\n");
        }
        rest = &rest[tag_end..];
    }
    if skip_until.is_none() {
        push_decoded(&mut out, rest);
    }
    Ok(out.trim().to_string())
}

fn push_decoded(out: &mut String, text: &str) {
    let decoded = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    out.push_str(&decoded);
}

/// Pull the `w:t` text runs out of `word/document.xml`.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text_run = true;
                } else if name.as_ref() == b"p" && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_permanent() {
        let err = extract_text(b"hello", "PyMuPDF4LLM").unwrap_err();
        assert!(matches!(err, ExtractError::UnknownStrategy(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn unmapped_content_type_is_permanent() {
        let err = resolve_strategy(&BTreeMap::new(), "application/octet-stream").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn mapping_overrides_default() {
        let mut mapping = BTreeMap::new();
        mapping.insert(MIME_PDF.to_string(), "custom-pdf".to_string());
        assert_eq!(resolve_strategy(&mapping, MIME_PDF).unwrap(), "custom-pdf");
        assert_eq!(resolve_strategy(&BTreeMap::new(), MIME_PDF).unwrap(), "pdf");
    }

    #[test]
    fn plain_text_round_trips() {
        let text = extract_text("hello world".as_bytes(), "plain").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn invalid_utf8_is_transient_error() {
        let err = extract_text(&[0xff, 0xfe, 0x00], "plain").unwrap_err();
        assert!(matches!(err, ExtractError::InvalidUtf8));
        assert!(!err.is_permanent());
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", "pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", "docx").unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn html_strips_tags_and_scripts() {
        let html = b"<html><head><style>p{color:red}</style></head>\
                     <body><p>First &amp; foremost.</p><script>var x=1;</script>\
                     <p>Second part.</p></body></html>";
        let text = extract_html(html).unwrap();
        assert!(text.contains("First & foremost."));
        assert!(text.contains("Second part."));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("var x"));
    }
}
