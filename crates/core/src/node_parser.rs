//! Splits documents into overlapping chunks (nodes).

use crate::document::{metadata_lines, Document};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_CHUNK_OVERLAP: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub doc_id: String,
    pub text: String,
    /// Byte offsets into the source document text.
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// Text handed to the embedder and the LLM. With `include_extra_info`,
    /// the document metadata is prepended so questions about file names can
    /// match.
    pub fn full_text(&self, include_extra_info: bool) -> String {
        match metadata_lines(&self.metadata) {
            Some(meta) if include_extra_info => format!("{}\n\n{}", meta, self.text),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeParser {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for NodeParser {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl NodeParser {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    pub fn get_nodes_from_documents(&self, documents: &[Document]) -> Vec<Node> {
        documents
            .iter()
            .flat_map(|doc| self.get_nodes_from_document(doc))
            .collect()
    }

    pub fn get_nodes_from_document(&self, doc: &Document) -> Vec<Node> {
        self.split_spans(&doc.text)
            .into_iter()
            .map(|(start, end)| {
                let text = doc.text[start..end].to_string();
                Node {
                    node_id: node_id(&doc.doc_id, start, end, &text),
                    doc_id: doc.doc_id.clone(),
                    text,
                    start,
                    end,
                    metadata: doc.metadata.clone(),
                }
            })
            .collect()
    }

    /// Byte spans of each chunk. Chunks end on a char boundary and, when one
    /// exists in the back half of the window, just after whitespace.
    pub fn split_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        if text.trim().is_empty() {
            return spans;
        }
        let len = text.len();
        let mut start = 0;
        while start < len {
            let mut end = floor_char_boundary(text, (start + self.chunk_size).min(len));
            if end <= start {
                // A single char wider than the chunk size.
                end = start + text[start..].chars().next().map_or(1, char::len_utf8);
            }
            if end < len {
                let window = &text[start..end];
                if let Some(pos) = window.rfind(char::is_whitespace) {
                    let ws_len = window[pos..].chars().next().map_or(1, char::len_utf8);
                    if pos > window.len() / 2 {
                        end = start + pos + ws_len;
                    }
                }
            }
            spans.push((start, end));
            if end >= len {
                break;
            }
            let mut next = floor_char_boundary(text, end.saturating_sub(self.chunk_overlap));
            if next <= start {
                next = end;
            }
            start = next;
        }
        spans
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn node_id(doc_id: &str, start: usize, end: usize, text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(&(start as u64).to_le_bytes());
    hasher.update(&(end as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex().to_string()
}
