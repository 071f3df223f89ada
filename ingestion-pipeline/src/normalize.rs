//! Format normalization: every ingestion source is reduced to markdown-ish
//! text before classification and chunking. PDFs go through a layout-aware
//! extractor with a raw content-stream fallback; word-processor files are
//! unpacked and read from their document XML; plain text passes through.

use std::io::Read;
use std::path::{Path, PathBuf};

use common::error::AppError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

const SUPPORTED_EXTENSIONS: [&str; 5] = ["pdf", "docx", "txt", "md", "markdown"];

/// Normalizes a file into text, dispatching on extension.
pub fn normalize_path(path: &Path) -> Result<String, AppError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => extract_pdf(path),
        "docx" => extract_docx(path),
        "txt" | "md" | "markdown" => Ok(std::fs::read_to_string(path)?),
        other => Err(AppError::Validation(format!(
            "Unsupported file type '{other}' for {}",
            path.display()
        ))),
    }
}

/// Layout-aware extraction first; on failure, fall back to walking the PDF
/// page tree and pulling raw text per page.
fn extract_pdf(path: &Path) -> Result<String, AppError> {
    match pdf_extract::extract_text(path) {
        Ok(text) => Ok(text),
        Err(primary_err) => {
            warn!(
                path = %path.display(),
                error = %primary_err,
                "primary PDF extraction failed; using content-stream fallback"
            );
            extract_pdf_fallback(path).map_err(|fallback_err| {
                AppError::Processing(format!(
                    "PDF extraction failed for {}: {primary_err}; fallback: {fallback_err}",
                    path.display()
                ))
            })
        }
    }
}

fn extract_pdf_fallback(path: &Path) -> Result<String, AppError> {
    let document = lopdf::Document::load(path)
        .map_err(|e| AppError::Processing(format!("failed to load PDF: {e}")))?;

    let mut out = String::new();
    for (page_number, _) in document.get_pages() {
        match document.extract_text(&[page_number]) {
            Ok(text) => {
                out.push_str(&text);
                out.push_str("\n\n");
            }
            Err(e) => warn!(page = page_number, error = %e, "skipping unreadable PDF page"),
        }
    }

    if out.trim().is_empty() {
        return Err(AppError::Processing("no extractable text in PDF".into()));
    }
    Ok(out)
}

/// Extracts paragraphs and tables from `word/document.xml`. Paragraphs
/// become blank-line-separated blocks; table rows render as `| a | b |`
/// lines.
fn extract_docx(path: &Path) -> Result<String, AppError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| AppError::Processing(format!("failed to open docx archive: {e}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| AppError::Processing(format!("docx is missing document.xml: {e}")))?
        .read_to_string(&mut xml)?;

    let mut reader = Reader::from_str(&xml);
    let mut out = String::new();
    let mut table_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.name().as_ref() {
                b"w:tbl" => table_depth += 1,
                b"w:tr" if table_depth > 0 => out.push_str("| "),
                _ => {}
            },
            Ok(Event::End(element)) => match element.name().as_ref() {
                b"w:tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    out.push('\n');
                }
                b"w:tr" if table_depth > 0 => out.push('\n'),
                b"w:tc" if table_depth > 0 => out.push_str(" | "),
                b"w:p" if table_depth == 0 => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                if element.name().as_ref() == b"w:tab" {
                    out.push('\t');
                }
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .unescape()
                    .map_err(|e| AppError::Processing(format!("bad docx text node: {e}")))?;
                out.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(AppError::Processing(format!(
                    "failed to parse docx XML: {e}"
                )))
            }
        }
    }

    debug!(chars = out.len(), path = %path.display(), "docx normalized");
    Ok(out)
}

/// Renders one relational row as a titled markdown record.
pub fn render_table_row(table_name: &str, row_index: usize, columns: &[(String, String)]) -> String {
    let mut out = format!("### {table_name} record {row_index}\n\n");
    for (column, value) in columns {
        out.push_str(&format!("**{column}:** {value}\n"));
    }
    out
}

/// Collects ingestable files under a path. A file path returns itself; a
/// directory is walked, optionally recursively, keeping supported
/// extensions in sorted order.
pub fn discover_documents(path: &Path, recursive: bool) -> Result<Vec<PathBuf>, AppError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(AppError::NotFound(format!(
            "path does not exist: {}",
            path.display()
        )));
    }

    let mut found = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                if recursive {
                    pending.push(entry_path);
                }
                continue;
            }
            let supported = entry_path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if supported {
                found.push(entry_path);
            }
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_files_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.md");
        std::fs::write(&file, "# Title\n\nBody text.").unwrap();

        let text = normalize_path(&file).unwrap();
        assert_eq!(text, "# Title\n\nBody text.");
    }

    #[test]
    fn unsupported_extension_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("image.png");
        std::fs::write(&file, b"not text").unwrap();

        assert!(matches!(
            normalize_path(&file),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn table_rows_render_as_titled_records() {
        let rendered = render_table_row(
            "incidents",
            3,
            &[
                ("title".to_string(), "Printer down".to_string()),
                ("severity".to_string(), "low".to_string()),
            ],
        );

        assert!(rendered.starts_with("### incidents record 3"));
        assert!(rendered.contains("**title:** Printer down\n"));
        assert!(rendered.contains("**severity:** low\n"));
    }

    #[test]
    fn discovery_filters_and_sorts_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("skip.bin"), "x").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("c.txt"), "c").unwrap();

        let flat = discover_documents(dir.path(), false).unwrap();
        assert_eq!(flat.len(), 2);

        let recursive = discover_documents(dir.path(), true).unwrap();
        assert_eq!(recursive.len(), 3);
        let names: Vec<_> = recursive
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"c.txt".to_string()));
    }

    #[test]
    fn discovering_missing_path_errors() {
        assert!(matches!(
            discover_documents(Path::new("/definitely/not/here"), true),
            Err(AppError::NotFound(_))
        ));
    }
}
