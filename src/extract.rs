//! Builtin, format-native text extraction.
//!
//! Reads a file from disk and returns its text, a quality score in `[0, 1]`,
//! and page/sheet segments that the chunker uses to label chunks.
//!
//! | Format | Text | Quality |
//! |--------|------|---------|
//! | txt | raw read (lossy UTF-8) | `min(1, chars / 5000)` |
//! | docx | non-empty paragraphs joined by newlines | `min(1, chars / 5000)` |
//! | xlsx | `## sheet: <name>` blocks of `a \| b \| c` rows | `min(1, chars / 5000)` |
//! | pdf | page texts joined by newlines | fraction of pages with text |

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Character count at which a non-PDF document scores 1.0.
const FULL_QUALITY_CHARS: f64 = 5000.0;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported extension: {0}")]
    UnsupportedFormat(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A labelled region of the extracted text, starting at a char offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub label: String,
    pub start_char: usize,
}

#[derive(Debug, Clone)]
pub struct BuiltinExtraction {
    pub text: String,
    pub quality_score: f64,
    pub segments: Vec<Segment>,
}

/// Extract text from `path`, dispatching on its (lowercased) extension.
pub fn extract_file(path: &Path, ext: &str) -> Result<BuiltinExtraction, ExtractError> {
    match ext {
        "txt" => {
            let bytes = std::fs::read(path)?;
            Ok(extract_txt(&bytes))
        }
        "docx" => extract_docx(&std::fs::read(path)?),
        "xlsx" => extract_xlsx(&std::fs::read(path)?),
        "pdf" => extract_pdf(&std::fs::read(path)?),
        other => Err(ExtractError::UnsupportedFormat(other.to_string())),
    }
}

fn length_score(text: &str) -> f64 {
    (text.trim().chars().count() as f64 / FULL_QUALITY_CHARS).min(1.0)
}

pub fn extract_txt(bytes: &[u8]) -> BuiltinExtraction {
    let text = String::from_utf8_lossy(bytes).into_owned();
    BuiltinExtraction {
        quality_score: length_score(&text),
        text,
        segments: Vec::new(),
    }
}

pub fn extract_pdf(bytes: &[u8]) -> Result<BuiltinExtraction, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(join_pdf_pages(&pages))
}

/// Join per-page text; quality is the share of pages that yielded any text.
fn join_pdf_pages(pages: &[String]) -> BuiltinExtraction {
    let mut text = String::new();
    let mut segments = Vec::with_capacity(pages.len());
    let mut offset = 0usize;
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push('\n');
            offset += 1;
        }
        segments.push(Segment {
            label: format!("page {}", i + 1),
            start_char: offset,
        });
        text.push_str(page);
        offset += page.chars().count();
    }
    let non_empty = pages.iter().filter(|p| !p.trim().is_empty()).count();
    BuiltinExtraction {
        text,
        quality_score: non_empty as f64 / pages.len().max(1) as f64,
        segments,
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
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

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

pub fn extract_docx(bytes: &[u8]) -> Result<BuiltinExtraction, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let paragraphs = docx_paragraphs(&doc_xml)?;
    let text = paragraphs.join("\n");
    Ok(BuiltinExtraction {
        quality_score: length_score(&text),
        text,
        segments: Vec::new(),
    })
}

/// Collect the text of each `<w:p>`, dropping empty paragraphs.
fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
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
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs)
}

pub fn extract_xlsx(bytes: &[u8]) -> Result<BuiltinExtraction, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_titles = read_sheet_titles(&mut archive)?;
    let sheet_files = list_worksheet_names(&archive);

    let mut text = String::new();
    let mut segments = Vec::new();
    let mut offset = 0usize;
    for (idx, file) in sheet_files.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let title = sheet_titles
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        let sheet_xml = read_zip_entry_bounded(&mut archive, &file, MAX_XML_ENTRY_BYTES)?;
        let rows = xlsx_sheet_rows(&sheet_xml, &shared_strings)?;

        if idx > 0 {
            text.push_str("\n\n");
            offset += 2;
        }
        segments.push(Segment {
            label: format!("sheet {}", title),
            start_char: offset,
        });
        let block = format!("## sheet: {}\n{}", title, rows.join("\n"));
        offset += block.chars().count();
        text.push_str(&block);
    }

    Ok(BuiltinExtraction {
        quality_score: length_score(&text),
        text,
        segments,
    })
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    // Workbooks with only numbers or inline strings have no shared string table.
    if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Sheet titles from `xl/workbook.xml`, in workbook order.
fn read_sheet_titles(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    if !archive.file_names().any(|n| n == "xl/workbook.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut titles = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                if let Ok(Some(attr)) = e.try_get_attribute("name") {
                    if let Ok(value) = attr.unescape_value() {
                        titles.push(value.into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(titles)
}

fn list_worksheet_names(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Render each `<row>` as its non-empty cell values joined by ` | `.
fn xlsx_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Option<Vec<u8>> = None;
    let mut value = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| a.value.into_owned());
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = value.trim();
                    let resolved = match cell_type.as_deref() {
                        Some(b"s") => raw
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        _ => raw.to_string(),
                    };
                    if !resolved.is_empty() {
                        row.push(resolved);
                        cell_count += 1;
                    }
                    cell_type = None;
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}
