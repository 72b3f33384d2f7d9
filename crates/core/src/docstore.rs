use crate::node_parser::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nodes in insertion order plus the content hash of every document they
/// came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStore {
    doc_hashes: BTreeMap<String, String>,
    nodes: Vec<Node>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_document_hash(&mut self, doc_id: &str, hash: String) {
        self.doc_hashes.insert(doc_id.to_string(), hash);
    }

    pub fn get_document_hash(&self, doc_id: &str) -> Option<&str> {
        self.doc_hashes.get(doc_id).map(String::as_str)
    }

    pub fn contains_document(&self, doc_id: &str) -> bool {
        self.doc_hashes.contains_key(doc_id)
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &str> {
        self.doc_hashes.keys().map(String::as_str)
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) {
        self.nodes.extend(nodes);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Removes a document and its nodes. Returns the removed node ids, or
    /// `None` if the document was never stored.
    pub fn delete_document(&mut self, doc_id: &str) -> Option<Vec<String>> {
        self.doc_hashes.remove(doc_id)?;
        let mut removed = Vec::new();
        self.nodes.retain(|n| {
            if n.doc_id == doc_id {
                removed.push(n.node_id.clone());
                false
            } else {
                true
            }
        });
        Some(removed)
    }

    pub fn document_count(&self) -> usize {
        self.doc_hashes.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
