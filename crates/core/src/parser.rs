//! Format-specific text extraction for repository files.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Markdown,
    Json,
    Pdf,
    Text,
    Binary,
}

pub fn guess_mime(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| match ext.to_lowercase().as_str() {
            "md" | "markdown" | "mdx" => "text/markdown",
            "txt" | "log" | "rst" | "adoc" => "text/plain",
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "h" | "cpp" | "rb" | "sh" => {
                "text/plain"
            }
            "toml" | "yaml" | "yml" | "ini" | "cfg" | "html" | "css" | "xml" => "text/plain",
            "json" | "ipynb" => "application/json",
            "pdf" => "application/pdf",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" | "ico" | "svg" | "webp" => "image/other",
            "zip" | "gz" | "tar" | "7z" | "jar" | "wasm" | "exe" | "so" | "dylib" => {
                "application/octet-stream"
            }
            _ => "text/plain",
        })
}

pub fn detect(path: &Path) -> FileKind {
    match guess_mime(path) {
        Some("text/markdown") => FileKind::Markdown,
        Some("application/json") => FileKind::Json,
        Some("application/pdf") => FileKind::Pdf,
        Some(m) if m.starts_with("image/") || m == "application/octet-stream" => FileKind::Binary,
        _ => FileKind::Text,
    }
}

/// Decodes a blob as UTF-8 text, dropping a leading BOM. `None` for binary
/// content.
pub fn decode_utf8(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if bytes.contains(&0) {
        return None;
    }
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Extracts text with the parser chosen by file type.
///
/// `Ok(None)` means the file carries no indexable text.
pub fn parse(path: &Path, bytes: &[u8]) -> Result<Option<String>, ParseError> {
    match detect(path) {
        FileKind::Markdown => Ok(decode_utf8(bytes).map(|t| strip_front_matter(&t).to_string())),
        FileKind::Json => Ok(decode_utf8(bytes).map(|t| pretty_json(&t))),
        FileKind::Pdf => pdf_text(bytes),
        FileKind::Text => Ok(decode_utf8(bytes)),
        FileKind::Binary => Ok(None),
    }
}

fn strip_front_matter(text: &str) -> &str {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return text;
    };
    for marker in ["\n---\n", "\n---\r\n"] {
        if let Some(pos) = rest.find(marker) {
            return rest[pos + marker.len()..].trim_start_matches(['\r', '\n']);
        }
    }
    if rest.ends_with("\n---") {
        return "";
    }
    text
}

fn pretty_json(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| text.to_string())
}

#[cfg(feature = "pdf")]
fn pdf_text(bytes: &[u8]) -> Result<Option<String>, ParseError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
    Ok(Some(text).filter(|t| !t.trim().is_empty()))
}

#[cfg(not(feature = "pdf"))]
fn pdf_text(_bytes: &[u8]) -> Result<Option<String>, ParseError> {
    Ok(None)
}
