//! Plain-text extraction from downloaded document bytes.
//!
//! The fetcher supplies bytes plus a MIME type; this module returns UTF-8
//! text. Anything that cannot produce text (unknown type, corrupt file,
//! image-only PDF without an OCR layer) fails with
//! [`Error::UnsupportedFormat`] so the import skips that document.

use std::io::Read;

use crate::error::{Error, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single decompressed OOXML entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Whether [`extract_text`] understands this MIME type.
pub fn is_supported(mime_type: &str) -> bool {
    matches!(
        mime_type,
        MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX | MIME_TEXT | MIME_MARKDOWN | MIME_CSV
    )
}

/// Extract plain text. Fails if the result would be empty.
pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String> {
    let text = match mime_type {
        MIME_PDF => extract_pdf(bytes)?,
        MIME_DOCX => extract_docx(bytes)?,
        MIME_PPTX => extract_pptx(bytes)?,
        MIME_XLSX => extract_xlsx(bytes)?,
        MIME_TEXT | MIME_MARKDOWN | MIME_CSV => {
            // Drop a UTF-8 BOM, as exported Google Docs carry one.
            let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            String::from_utf8_lossy(bytes).into_owned()
        }
        other => {
            return Err(Error::UnsupportedFormat(format!(
                "unsupported content type: {}",
                other
            )))
        }
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(Error::UnsupportedFormat(
            "no extractable text (empty or image-only document)".to_string(),
        ));
    }
    Ok(text.to_string())
}

fn ooxml_error(e: impl std::fmt::Display) -> Error {
    Error::UnsupportedFormat(format!("OOXML extraction failed: {}", e))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed inputs; keep that local to this file.
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes));
    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(Error::UnsupportedFormat(format!(
            "PDF extraction failed: {}",
            e
        ))),
        Err(_) => Err(Error::UnsupportedFormat(
            "PDF extraction failed: malformed document".to_string(),
        )),
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_error)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(ooxml_error)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_error)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_error(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_elements(&xml, " ")
}

fn extract_pptx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut parts = Vec::new();
    for name in slides {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_elements(&xml, " ")?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join("\n"))
}

/// Entries named `<prefix><n>.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element (`w:t` in Word, `a:t`
/// in PowerPoint).
fn collect_text_elements(xml: &[u8], separator: &str) -> Result<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"t" => {
                in_t = true;
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(ooxml_error)?;
                if !text.is_empty() {
                    pieces.push(text.into_owned());
                }
            }
            Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"t" => {
                in_t = false;
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(pieces.join(separator))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut parts = Vec::new();
    for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let cells = extract_sheet_cells(&xml, &shared_strings)?;
        if !cells.is_empty() {
            parts.push(cells);
        }
    }
    Ok(parts.join("\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    // Workbooks with only numeric cells have no shared strings part.
    if archive.index_for_name("xl/sharedStrings.xml").is_none() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml_error)?);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut shared = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let raw = te.unescape().map_err(ooxml_error)?;
                let value = raw.trim();
                if shared {
                    if let Some(s) = value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                    {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => shared = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    /// Minimal PDF whose single page shows `phrase`, with correct xref offsets.
    fn minimal_pdf(phrase: &str) -> Vec<u8> {
        let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
        let mut out = Vec::new();
        let mut offsets = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n");
        offsets.push(out.len());
        out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        offsets.push(out.len());
        out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
        offsets.push(out.len());
        out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                stream.len(),
                stream
            )
            .as_bytes(),
        );
        offsets.push(out.len());
        out.extend_from_slice(
            b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
        );
        let xref_start = out.len();
        out.extend_from_slice(b"xref\n0 6\n");
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for o in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", o).as_bytes());
        }
        out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
        out.extend_from_slice(format!("{}\n%%EOF\n", xref_start).as_bytes());
        out
    }

    #[test]
    fn plain_text_passes_through_trimmed() {
        let text = extract_text(b"\xEF\xBB\xBF  quarterly notes\n", MIME_TEXT).unwrap();
        assert_eq!(text, "quarterly notes");
    }

    #[test]
    fn pdf_text_is_extracted() {
        let text = extract_text(&minimal_pdf("board meeting minutes"), MIME_PDF).unwrap();
        assert!(text.contains("board meeting minutes"), "got: {text}");
    }

    #[test]
    fn invalid_pdf_is_unsupported() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn whitespace_only_document_is_unsupported() {
        let err = extract_text(b" \n\t ", MIME_TEXT).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let err = extract_text(b"\x89PNG", "image/png").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(!is_supported("image/png"));
    }

    #[test]
    fn docx_runs_are_joined() {
        let xml = r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Invoice</w:t></w:r><w:r><w:t>total due</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        assert_eq!(extract_text(&bytes, MIME_DOCX).unwrap(), "Invoice total due");
    }

    #[test]
    fn pptx_slides_are_read_in_numeric_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><a:t>{}</a:t></p:sld>"#,
                t
            )
        };
        let s10 = slide("tenth");
        let s2 = slide("second");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
        ]);
        assert_eq!(extract_text(&bytes, MIME_PPTX).unwrap(), "second\ntenth");
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let shared = r#"<sst><si><t>Revenue</t></si><si><t>Q3</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData><row><c t="s"><v>1</v></c><c t="s"><v>0</v></c><c><v>42</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        assert_eq!(extract_text(&bytes, MIME_XLSX).unwrap(), "Q3 Revenue 42");
    }

    #[test]
    fn corrupt_zip_is_unsupported() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
