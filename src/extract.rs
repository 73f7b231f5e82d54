//! Format plugins that turn raw bytes into plain UTF-8 text.
//!
//! The processor resolves a [`ContentKind`] from a file extension or an HTTP
//! `Content-Type`, then calls [`extract_text`]. Extraction either yields real
//! text or an [`ExtractError`]; it never substitutes placeholder content.
//!
//! | Kind | Extensions | Method |
//! |------|------------|--------|
//! | `PlainText` | txt, md, markdown, rst, log, json, toml, yaml, yml | UTF-8 decode |
//! | `Html` | html, htm | tag strip, `<script>`/`<style>` dropped, entities decoded |
//! | `Csv` | csv | each row rendered as `header: value` lines |
//! | `Pdf` | pdf | `pdf-extract` |
//! | `Docx` | docx | `zip` + `quick-xml` over `word/document.xml` |

use std::io::Read;

use knowledge_harness_core::KbError;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_TEXT: &str = "text/plain";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("content is not valid UTF-8: {0}")]
    Encoding(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error("no text could be extracted")]
    Empty,
    #[error("extractor aborted: {0}")]
    Aborted(String),
}

impl ExtractError {
    /// Attach the source name and lift into the knowledge-base taxonomy.
    pub fn into_kb_error(self, source_name: &str) -> KbError {
        match self {
            ExtractError::Unsupported(what) => {
                KbError::UnsupportedFormat(format!("{}: {}", source_name, what))
            }
            other => KbError::ExtractionFailed {
                source_name: source_name.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    PlainText,
    Html,
    Csv,
    Pdf,
    Docx,
}

impl ContentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" | "markdown" | "rst" | "log" | "json" | "toml" | "yaml" | "yml" => {
                Some(ContentKind::PlainText)
            }
            "html" | "htm" => Some(ContentKind::Html),
            "csv" => Some(ContentKind::Csv),
            "pdf" => Some(ContentKind::Pdf),
            "docx" => Some(ContentKind::Docx),
            _ => None,
        }
    }

    /// Resolve an HTTP `Content-Type` header value; parameters are ignored.
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            MIME_HTML | "application/xhtml+xml" => Some(ContentKind::Html),
            MIME_CSV => Some(ContentKind::Csv),
            MIME_PDF => Some(ContentKind::Pdf),
            MIME_DOCX => Some(ContentKind::Docx),
            MIME_TEXT | "text/markdown" | "application/json" => Some(ContentKind::PlainText),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ContentKind::PlainText => MIME_TEXT,
            ContentKind::Html => MIME_HTML,
            ContentKind::Csv => MIME_CSV,
            ContentKind::Pdf => MIME_PDF,
            ContentKind::Docx => MIME_DOCX,
        }
    }
}

/// Extract plain text from `bytes` interpreted as `kind`.
///
/// Returns [`ExtractError::Empty`] when a format parses but holds no text,
/// so a scanned PDF never turns into an empty document silently.
pub fn extract_text(bytes: &[u8], kind: ContentKind) -> Result<String, ExtractError> {
    let text = match kind {
        ContentKind::PlainText => decode_utf8(bytes)?,
        ContentKind::Html => strip_html(&decode_utf8(bytes)?),
        ContentKind::Csv => extract_csv(&decode_utf8(bytes)?)?,
        ContentKind::Pdf => extract_pdf(bytes)?,
        ContentKind::Docx => extract_docx(bytes)?,
    };
    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !current.trim().is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

/// Render each data row as `header: value` lines separated by a blank line.
fn extract_csv(text: &str) -> Result<String, ExtractError> {
    let mut rows = parse_csv(text)?.into_iter();
    let header = rows
        .next()
        .ok_or_else(|| ExtractError::Csv("missing header row".to_string()))?;

    let mut out = Vec::new();
    for (line, row) in rows.enumerate() {
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if row.len() > header.len() {
            return Err(ExtractError::Csv(format!(
                "row {} has {} fields, header has {}",
                line + 2,
                row.len(),
                header.len()
            )));
        }
        let rendered: Vec<String> = header
            .iter()
            .zip(row.iter())
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(h, v)| format!("{}: {}", h.trim(), v.trim()))
            .collect();
        out.push(rendered.join("\n"));
    }
    Ok(out.join("\n\n"))
}

/// RFC 4180-style parser: quoted fields, doubled quotes, CRLF or LF rows.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => row.push(std::mem::take(&mut field)),
            ('\r', false) => {}
            ('\n', false) => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            (c, _) => field.push(c),
        }
    }
    if in_quotes {
        return Err(ExtractError::Csv("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

/// Tag names whose content is never readable text.
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Tags that end a visual line.
const BLOCK_ELEMENTS: [&str; 16] = [
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table",
    "section", "article",
];

/// Strip markup from an HTML page, keeping block structure as newlines.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut skipping: Option<String> = None;

    while let Some(lt) = rest.find('<') {
        if skipping.is_none() {
            out.push_str(&decode_entities(&rest[..lt]));
        }
        let after = &rest[lt + 1..];

        if let Some(body) = after.strip_prefix("!--") {
            rest = match body.find("-->") {
                Some(end) => &body[end + 3..],
                None => "",
            };
            continue;
        }

        let gt = match after.find('>') {
            Some(gt) => gt,
            None => {
                rest = "";
                break;
            }
        };
        let tag = &after[..gt];
        rest = &after[gt + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(skipped) = &skipping {
            if closing && *skipped == name {
                skipping = None;
            }
            continue;
        }
        if !closing && SKIPPED_ELEMENTS.contains(&name.as_str()) && !tag.ends_with('/') {
            skipping = Some(name);
            continue;
        }
        if BLOCK_ELEMENTS.contains(&name.as_str()) {
            out.push('\n');
        } else {
            out.push(' ');
        }
    }
    if skipping.is_none() {
        out.push_str(&decode_entities(rest));
    }

    out.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &tail[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
