//! In-memory vector index over document chunks.
//!
//! Building embeds every node produced by the [`NodeParser`]. Any embedding
//! failure aborts the whole build (or insert); the index is never left with
//! nodes that have no vector.

use crate::docstore::DocumentStore;
use crate::document::Document;
use crate::embeddings::{self, cosine_similarity, EmbeddingError};
use crate::node_parser::{Node, NodeParser, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use providers::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const SNAPSHOT_KIND: &str = "vector_index";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error("unknown document: {0}")]
    UnknownDocument(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub include_extra_info: bool,
    pub batch_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            include_extra_info: true,
            batch_size: embeddings::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndex {
    options: IndexOptions,
    docstore: DocumentStore,
    embeddings: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    extra_info: BTreeMap<String, String>,
    /// Label of the embedding model that produced the vectors.
    #[serde(default)]
    embedder: Option<String>,
}

impl VectorIndex {
    fn empty(options: IndexOptions) -> Self {
        Self {
            options,
            docstore: DocumentStore::new(),
            embeddings: BTreeMap::new(),
            text: None,
            extra_info: BTreeMap::new(),
            embedder: None,
        }
    }

    /// Builds an index over exactly `documents`, in order.
    pub async fn build(
        documents: &[Document],
        embedder: &dyn EmbeddingProvider,
        options: IndexOptions,
    ) -> Result<Self, IndexError> {
        let mut index = Self::empty(options);
        let nodes = index.parser().get_nodes_from_documents(documents);
        let vectors = index.embed_nodes(&nodes, embedder).await?;
        for doc in documents {
            index.docstore.set_document_hash(&doc.doc_id, doc.hash());
        }
        index.commit(nodes, vectors);
        info!(
            "built index: {} documents, {} nodes",
            index.docstore.document_count(),
            index.docstore.node_count()
        );
        Ok(index)
    }

    fn parser(&self) -> NodeParser {
        NodeParser::new(self.options.chunk_size, self.options.chunk_overlap)
    }

    async fn embed_nodes(
        &self,
        nodes: &[Node],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        let texts: Vec<String> = nodes
            .iter()
            .map(|n| n.full_text(self.options.include_extra_info))
            .collect();
        let vectors = embeddings::embed_batched(&texts, embedder, self.options.batch_size).await?;
        if let (Some(existing), Some(new)) = (self.embeddings.values().next(), vectors.first()) {
            if existing.len() != new.len() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: existing.len(),
                    got: new.len(),
                }
                .into());
            }
        }
        Ok(vectors)
    }

    fn commit(&mut self, nodes: Vec<Node>, vectors: Vec<Vec<f32>>) {
        for (node, vector) in nodes.iter().zip(vectors) {
            self.embeddings.insert(node.node_id.clone(), vector);
        }
        self.docstore.add_nodes(nodes);
    }

    /// Adds one document. Replaces nothing: use [`update`](Self::update) for
    /// a document that is already indexed.
    pub async fn insert(
        &mut self,
        document: &Document,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<(), IndexError> {
        let nodes = self.parser().get_nodes_from_document(document);
        let vectors = self.embed_nodes(&nodes, embedder).await?;
        self.docstore
            .set_document_hash(&document.doc_id, document.hash());
        debug!("inserting {} ({} nodes)", document.doc_id, nodes.len());
        self.commit(nodes, vectors);
        Ok(())
    }

    pub fn delete(&mut self, doc_id: &str) -> Result<(), IndexError> {
        debug!("deleting document {}", doc_id);
        let removed = self
            .docstore
            .delete_document(doc_id)
            .ok_or_else(|| IndexError::UnknownDocument(doc_id.to_string()))?;
        for node_id in removed {
            self.embeddings.remove(&node_id);
        }
        Ok(())
    }

    /// Replaces a document. The new nodes are embedded before the old ones
    /// are dropped, so a failed embedding leaves the index unchanged.
    pub async fn update(
        &mut self,
        document: &Document,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<(), IndexError> {
        let nodes = self.parser().get_nodes_from_document(document);
        let vectors = self.embed_nodes(&nodes, embedder).await?;
        if self.docstore.contains_document(&document.doc_id) {
            self.delete(&document.doc_id)?;
        }
        self.docstore
            .set_document_hash(&document.doc_id, document.hash());
        self.commit(nodes, vectors);
        Ok(())
    }

    /// Re-indexes documents that are new or whose content hash changed.
    /// Returns, per input document, whether it was (re)indexed.
    pub async fn refresh(
        &mut self,
        documents: &[Document],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<bool>, IndexError> {
        let mut refreshed = vec![false; documents.len()];
        for (i, doc) in documents.iter().enumerate() {
            let hash = doc.hash();
            match self.docstore.get_document_hash(&doc.doc_id) {
                Some(existing) if existing == hash => {}
                Some(_) => {
                    self.update(doc, embedder).await?;
                    refreshed[i] = true;
                }
                None => {
                    self.insert(doc, embedder).await?;
                    refreshed[i] = true;
                }
            }
        }
        info!(
            "refreshed {} of {} documents",
            refreshed.iter().filter(|r| **r).count(),
            documents.len()
        );
        Ok(refreshed)
    }

    /// Top `top_k` nodes by cosine similarity; ties keep insertion order.
    pub fn retrieve(&self, query_embedding: &[f32], top_k: usize) -> Vec<ScoredNode> {
        let mut scored: Vec<ScoredNode> = self
            .docstore
            .nodes()
            .iter()
            .filter_map(|node| {
                self.embeddings.get(&node.node_id).map(|v| ScoredNode {
                    node: node.clone(),
                    score: cosine_similarity(query_embedding, v),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }

    pub fn persist(&self, path: &Path) -> Result<(), IndexError> {
        storage::save(path, SNAPSHOT_KIND, self)?;
        info!("persisted index to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let (index, snapshot): (Self, _) = storage::load(path, SNAPSHOT_KIND)?;
        debug!("loaded index snapshot created at {}", snapshot.created_at);
        Ok(index)
    }

    pub fn to_json_string(&self) -> Result<String, IndexError> {
        Ok(storage::encode(SNAPSHOT_KIND, self)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, IndexError> {
        let (index, _) = storage::decode(SNAPSHOT_KIND, text)?;
        Ok(index)
    }

    /// Summary text describing the whole index.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_extra_info(&mut self, extra_info: BTreeMap<String, String>) {
        self.extra_info = extra_info;
    }

    pub fn extra_info(&self) -> &BTreeMap<String, String> {
        &self.extra_info
    }

    pub fn set_embedder(&mut self, label: impl Into<String>) {
        self.embedder = Some(label.into());
    }

    pub fn embedder(&self) -> Option<&str> {
        self.embedder.as_deref()
    }

    /// Length of the stored vectors; `None` while the index is empty.
    pub fn dimensions(&self) -> Option<usize> {
        self.embeddings.values().next().map(Vec::len)
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn docstore(&self) -> &DocumentStore {
        &self.docstore
    }

    pub fn len(&self) -> usize {
        self.docstore.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.docstore.node_count() == 0
    }
}
