//! Text extraction for crawled and uploaded content.
//!
//! Connectorless pipeline layer: callers supply bytes + content type, this
//! module returns plain UTF-8 text. HTML is parsed and stripped of
//! navigation/boilerplate; PDF and OOXML documents have their text pulled
//! out with spacing preserved; XLSX additionally supports row-structured
//! extraction for the QA import path.

use std::io::Read;

use ego_tree::iter::Edge;
use scraper::{Html, Selector};

pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum sheets to process in an xlsx workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb cap).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction failure; the pipeline records it and skips the item.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Extracted page: optional title plus plain text.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub title: Option<String>,
    pub text: String,
}

/// Extract plain text from content bytes based on MIME type. Plain-text
/// types pass through; unknown types are rejected.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<Extracted, ExtractError> {
    let base_type = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    match base_type {
        MIME_HTML | "application/xhtml+xml" => {
            let html = String::from_utf8_lossy(bytes);
            Ok(extract_html(&html))
        }
        MIME_PDF => Ok(Extracted {
            title: None,
            text: extract_pdf(bytes)?,
        }),
        MIME_DOCX => Ok(Extracted {
            title: None,
            text: extract_docx(bytes)?,
        }),
        MIME_PPTX => Ok(Extracted {
            title: None,
            text: extract_pptx(bytes)?,
        }),
        MIME_XLSX => Ok(Extracted {
            title: None,
            text: extract_xlsx(bytes)?,
        }),
        t if t.starts_with("text/") => Ok(Extracted {
            title: None,
            text: String::from_utf8_lossy(bytes).into_owned(),
        }),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

// ============ HTML ============

/// Elements whose entire subtree is boilerplate for retrieval purposes.
fn is_skipped_element(name: &str) -> bool {
    matches!(
        name,
        "script"
            | "style"
            | "nav"
            | "header"
            | "footer"
            | "aside"
            | "noscript"
            | "template"
            | "form"
            | "iframe"
            | "svg"
            | "button"
    )
}

/// Elements that imply a paragraph break around their content.
fn is_block_element(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "br"
            | "li"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "tr"
            | "section"
            | "article"
            | "blockquote"
            | "pre"
            | "table"
            | "ul"
            | "ol"
    )
}

/// Parse an HTML document, strip boilerplate, and return title + text with
/// paragraph structure preserved.
pub fn extract_html(html: &str) -> Extracted {
    let doc = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        doc.select(&sel)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });

    // Prefer a dedicated content area when the page declares one.
    let mut raw = String::new();
    for selector_str in ["article", "main", "body"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = doc.select(&selector).next() {
                raw = visible_text(&element);
                if !raw.trim().is_empty() {
                    break;
                }
            }
        }
    }

    // Collapse whitespace runs into single spaces and paragraph breaks.
    let mut text = String::with_capacity(raw.len());
    for line in raw.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&trimmed.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    Extracted { title, text }
}

/// Walk the subtree, collecting visible text and inserting breaks around
/// block elements. Boilerplate subtrees are skipped wholesale.
fn visible_text(element: &scraper::ElementRef<'_>) -> String {
    let mut out = String::new();
    let mut skip_depth = 0usize;

    for edge in element.traverse() {
        match edge {
            Edge::Open(node) => match node.value() {
                scraper::Node::Element(el) => {
                    if is_skipped_element(el.name()) {
                        skip_depth += 1;
                    } else if skip_depth == 0 && is_block_element(el.name()) {
                        out.push('\n');
                    }
                }
                scraper::Node::Text(text) => {
                    if skip_depth == 0 {
                        let t: &str = text;
                        if !t.trim().is_empty() {
                            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                                out.push(' ');
                            }
                            out.push_str(t);
                        }
                    }
                }
                _ => {}
            },
            Edge::Close(node) => {
                if let scraper::Node::Element(el) = node.value() {
                    if is_skipped_element(el.name()) {
                        skip_depth = skip_depth.saturating_sub(1);
                    } else if skip_depth == 0 && is_block_element(el.name()) {
                        out.push('\n');
                    }
                }
            }
        }
    }

    out
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ============ OOXML ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_t_elements(&doc_xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let mut out = String::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = collect_t_elements(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push(' ');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// Collect the text of every `<t>`-suffixed element (`w:t` in docx,
/// `a:t` in pptx), space-separated.
fn collect_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = false;
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

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let rows = extract_xlsx_rows(bytes)?;
    Ok(rows
        .into_iter()
        .map(|row| row.join(" "))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Extract the first worksheet's rows as cell vectors, shared strings and
/// inline values resolved. Used by the QA import path, where each row is a
/// (question, answer[, priority]) record.
pub fn extract_xlsx_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let shared_strings = read_shared_strings(&mut archive).unwrap_or_default();

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut all_rows = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        all_rows.extend(extract_sheet_rows(&sheet_xml, &shared_strings)?);
    }
    Ok(all_rows)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"t" => in_t = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut in_row = false;
    let mut in_v = false;
    let mut cell_is_shared = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    current_row.clear();
                }
                b"c" if in_row => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" if in_row => in_v = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if cell_is_shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        value.to_string()
                    };
                    current_row.push(resolved);
                    cell_count += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = false;
                    if !current_row.is_empty() {
                        rows.push(std::mem::take(&mut current_row));
                    }
                }
                b"v" => in_v = false,
                b"c" => cell_is_shared = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_strips_boilerplate() {
        let html = r#"
            <html><head><title>Atlantis Facts</title>
            <script>alert(1)</script><style>body{}</style></head>
            <body>
              <nav><a href="/">Home</a><a href="/about">About</a></nav>
              <h1>Atlantis</h1>
              <p>The capital of Atlantis is Sunhaven.</p>
              <footer>Copyright</footer>
            </body></html>
        "#;
        let extracted = extract_html(html);
        assert_eq!(extracted.title.as_deref(), Some("Atlantis Facts"));
        assert!(extracted.text.contains("Sunhaven"));
        assert!(!extracted.text.contains("alert"));
        assert!(!extracted.text.contains("Home"));
        assert!(!extracted.text.contains("Copyright"));
    }

    #[test]
    fn test_html_paragraph_structure_preserved() {
        let html = "<body><p>First block.</p><p>Second block.</p></body>";
        let extracted = extract_html(html);
        assert_eq!(extracted.text, "First block.\n\nSecond block.");
    }

    #[test]
    fn test_html_prefers_article_over_body() {
        let html = r#"
            <body>
              <div>Sidebar junk</div>
              <article><p>The real content.</p></article>
            </body>
        "#;
        let extracted = extract_html(html);
        assert!(extracted.text.contains("real content"));
        assert!(!extracted.text.contains("Sidebar"));
    }

    #[test]
    fn test_plain_text_passthrough() {
        let extracted = extract_text(b"plain body", "text/plain; charset=utf-8").unwrap();
        assert_eq!(extracted.text, "plain body");
    }

    #[test]
    fn test_unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn test_invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn test_invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn test_xlsx_rows_from_handmade_workbook() {
        // Minimal xlsx: shared strings + one sheet with two rows.
        let shared = br#"<?xml version="1.0"?>
            <sst><si><t>What is up</t></si><si><t>The sky</t></si></sst>"#;
        let sheet = br#"<?xml version="1.0"?>
            <worksheet><sheetData>
              <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
              <row r="2"><c r="A2"><v>42</v></c></row>
            </sheetData></worksheet>"#;

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let opts: zip::write::SimpleFileOptions = Default::default();
            use std::io::Write;
            writer.start_file("xl/sharedStrings.xml", opts).unwrap();
            writer.write_all(shared).unwrap();
            writer.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
            writer.write_all(sheet).unwrap();
            writer.finish().unwrap();
        }
        let bytes = cursor.into_inner();

        let rows = extract_xlsx_rows(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["What is up".to_string(), "The sky".to_string()]);
        assert_eq!(rows[1], vec!["42".to_string()]);
    }
}
