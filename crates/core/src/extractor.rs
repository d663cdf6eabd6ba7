use crate::error::ExtractionError;
use crate::models::{Format, SourceLocator};
use std::io::Read;

#[derive(Debug, Clone, PartialEq)]
pub struct TextUnit {
    pub text: String,
    pub locator: SourceLocator,
}

impl TextUnit {
    pub fn new(text: impl Into<String>, locator: SourceLocator) -> Self {
        Self {
            text: text.into(),
            locator,
        }
    }
}

/// Decompressed bytes allowed per ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Cells scanned per worksheet before the rest of the sheet is ignored.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// An empty result is a valid outcome; errors mean the document itself is
/// corrupt or unsupported and the job must not retry.
pub fn extract_units(bytes: &[u8], format: Format) -> Result<Vec<TextUnit>, ExtractionError> {
    match format {
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        Format::Csv => extract_csv(bytes),
    }
}

/// Per-page extraction via lopdf first; when that parses but yields no
/// text, fall back to the raw whole-document extractor and split pages on
/// form feeds.
fn extract_pdf(bytes: &[u8]) -> Result<Vec<TextUnit>, ExtractionError> {
    match lopdf::Document::load_mem(bytes) {
        Ok(document) => {
            let mut units = Vec::new();
            for (page_no, _page_id) in document.get_pages() {
                if let Ok(text) = document.extract_text(&[page_no]) {
                    if !text.trim().is_empty() {
                        units.push(TextUnit::new(
                            text.trim().to_string(),
                            SourceLocator::Page { number: page_no },
                        ));
                    }
                }
            }
            if units.is_empty() {
                extract_pdf_raw(bytes)
            } else {
                Ok(units)
            }
        }
        Err(_) => extract_pdf_raw(bytes),
    }
}

fn extract_pdf_raw(bytes: &[u8]) -> Result<Vec<TextUnit>, ExtractionError> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|error| ExtractionError::Corrupt(format!("pdf: {error}")))?;

    let units = text
        .split('\u{000c}')
        .enumerate()
        .filter_map(|(index, page)| {
            let trimmed = page.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(TextUnit::new(
                    trimmed.to_string(),
                    SourceLocator::Page {
                        number: (index + 1) as u32,
                    },
                ))
            }
        })
        .collect();

    Ok(units)
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractionError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|error| ExtractionError::Corrupt(format!("zip: {error}")))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractionError> {
    let entry = archive
        .by_name(name)
        .map_err(|error| ExtractionError::Corrupt(format!("zip entry {name}: {error}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|error| ExtractionError::Corrupt(format!("zip entry {name}: {error}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractionError::Unsupported(format!(
            "zip entry {name} exceeds {MAX_XML_ENTRY_BYTES} bytes"
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<Vec<TextUnit>, ExtractionError> {
    let mut archive = open_archive(bytes)?;
    if archive.by_name("word/document.xml").is_err() {
        return Err(ExtractionError::Unsupported(
            "word/document.xml not found".to_string(),
        ));
    }
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut units = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut paragraph = String::new();
    let mut ordinal = 0u32;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        paragraph.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" {
                    ordinal += 1;
                    if !paragraph.trim().is_empty() {
                        units.push(TextUnit::new(
                            paragraph.trim().to_string(),
                            SourceLocator::Section { ordinal },
                        ));
                    }
                    paragraph.clear();
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(error) => return Err(ExtractionError::Corrupt(format!("docx xml: {error}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(units)
}

/// Sheet names come from the worksheet part stem, which is stable even
/// when workbook.xml is absent.
fn extract_xlsx(bytes: &[u8]) -> Result<Vec<TextUnit>, ExtractionError> {
    let mut archive = open_archive(bytes)?;

    let shared_strings = if archive.by_name("xl/sharedStrings.xml").is_ok() {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut sheet_parts: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheet_parts.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    if sheet_parts.is_empty() {
        return Err(ExtractionError::Unsupported(
            "workbook has no worksheets".to_string(),
        ));
    }

    let mut units = Vec::new();
    for part in sheet_parts {
        let sheet_name = part
            .trim_start_matches("xl/worksheets/")
            .trim_end_matches(".xml")
            .to_string();
        let xml = read_zip_entry_bounded(&mut archive, &part)?;
        extract_sheet_rows(&xml, &sheet_name, &shared_strings, &mut units)?;
    }

    Ok(units)
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractionError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(error) => {
                return Err(ExtractionError::Corrupt(format!(
                    "xlsx shared strings: {error}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

fn extract_sheet_rows(
    xml: &[u8],
    sheet_name: &str,
    shared_strings: &[String],
    units: &mut Vec<TextUnit>,
) -> Result<(), ExtractionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut current_row = 0u32;
    let mut row_cells: Vec<String> = Vec::new();
    let mut cell_is_shared = false;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    current_row = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"r")
                        .and_then(|a| String::from_utf8_lossy(&a.value).parse().ok())
                        .unwrap_or(current_row + 1);
                    row_cells.clear();
                }
                b"c" => {
                    cell_is_shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if cell_is_shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(text) = resolved {
                        row_cells.push(text);
                        cell_count += 1;
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    if !row_cells.is_empty() {
                        units.push(TextUnit::new(
                            row_cells.join(" "),
                            SourceLocator::Sheet {
                                name: sheet_name.to_string(),
                                row: current_row,
                            },
                        ));
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(error) => {
                return Err(ExtractionError::Corrupt(format!(
                    "xlsx sheet {sheet_name}: {error}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn extract_csv(bytes: &[u8]) -> Result<Vec<TextUnit>, ExtractionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut units = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|error| ExtractionError::Corrupt(format!("csv: {error}")))?;
        let text = record
            .iter()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            units.push(TextUnit::new(
                text,
                SourceLocator::Row {
                    number: (index + 1) as u32,
                },
            ));
        }
    }

    Ok(units)
}
