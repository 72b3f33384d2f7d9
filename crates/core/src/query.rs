//! Retrieval-augmented question answering over a [`VectorIndex`].

use crate::embeddings::{self, EmbeddingError};
use crate::index::{ScoredNode, VectorIndex};
use providers::{EmbeddingProvider, LlmProvider, ProviderError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_SIMILARITY_TOP_K: usize = 2;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 8000;

const QA_TEMPLATE: &str = "Context information is below.\n\
---------------------\n\
{context}\n\
---------------------\n\
Given the context information and not prior knowledge, answer the question: {question}\n";

const REFINE_TEMPLATE: &str = "The original question is as follows: {question}\n\
We have provided an existing answer: {answer}\n\
We have the opportunity to refine the existing answer (only if needed) with some more context below.\n\
------------\n\
{context}\n\
------------\n\
Given the new context, refine the original answer to better answer the question. \
If the context isn't useful, return the original answer.";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("embedding the question failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("no relevant content found for the question")]
    NoContext,
    #[error("answer generation failed: {0}")]
    Generation(#[from] ProviderError),
    #[error("model returned an empty answer")]
    EmptyAnswer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub similarity_top_k: usize,
    /// Nodes scoring below this are dropped before synthesis.
    pub similarity_cutoff: Option<f32>,
    pub max_context_chars: usize,
    pub verbose: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            similarity_top_k: DEFAULT_SIMILARITY_TOP_K,
            similarity_cutoff: None,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryTrace {
    pub question: String,
    pub retrieved: Vec<ScoredNode>,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub answer: String,
    pub source_nodes: Vec<ScoredNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<QueryTrace>,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.answer)
    }
}

pub struct QueryEngine<'a> {
    index: &'a VectorIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
    options: QueryOptions,
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        index: &'a VectorIndex,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        options: QueryOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            llm,
            options,
        }
    }

    pub async fn query(&self, question: &str) -> Result<Response, QueryError> {
        let query_embedding = embeddings::embed_query(question, self.embedder.as_ref()).await?;
        if let Some(dims) = self.index.dimensions() {
            if dims != query_embedding.len() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dims,
                    got: query_embedding.len(),
                }
                .into());
            }
        }
        let mut nodes = self
            .index
            .retrieve(&query_embedding, self.options.similarity_top_k);
        if let Some(cutoff) = self.options.similarity_cutoff {
            nodes.retain(|n| n.score >= cutoff);
        }
        if nodes.is_empty() {
            return Err(QueryError::NoContext);
        }
        for n in &nodes {
            debug!("retrieved {} from {} (score {:.4})", n.node.node_id, n.node.doc_id, n.score);
        }

        let include_extra_info = self.index.options().include_extra_info;
        let chunks: Vec<String> = nodes
            .iter()
            .map(|n| n.node.full_text(include_extra_info))
            .collect();
        let packs = pack_context(&chunks, self.options.max_context_chars);

        let mut prompts = Vec::with_capacity(packs.len());
        let mut answer: Option<String> = None;
        for context in &packs {
            let prompt = match &answer {
                None => qa_prompt(context, question),
                Some(existing) => refine_prompt(context, question, existing),
            };
            debug!("sending prompt ({} chars)", prompt.len());
            let completion = self.llm.complete(&prompt).await?;
            prompts.push(prompt);
            let text = completion.text.trim();
            if text.is_empty() {
                return Err(QueryError::EmptyAnswer);
            }
            answer = Some(text.to_string());
        }
        let answer = answer.ok_or(QueryError::EmptyAnswer)?;
        info!(
            "answered from {} nodes in {} model calls",
            nodes.len(),
            prompts.len()
        );

        let trace = self.options.verbose.then(|| QueryTrace {
            question: question.to_string(),
            retrieved: nodes.clone(),
            prompts,
        });
        Ok(Response {
            answer,
            source_nodes: nodes,
            trace,
        })
    }
}

fn qa_prompt(context: &str, question: &str) -> String {
    QA_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

fn refine_prompt(context: &str, question: &str, answer: &str) -> String {
    REFINE_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
        .replace("{answer}", answer)
}

/// Groups chunks, in order, into packs of at most `max_chars`. A chunk that
/// is larger than `max_chars` on its own gets a pack to itself.
fn pack_context(chunks: &[String], max_chars: usize) -> Vec<String> {
    const SEP: &str = "\n\n";
    let mut packs: Vec<String> = Vec::new();
    let mut current = String::new();
    for chunk in chunks {
        if !current.is_empty() && current.len() + SEP.len() + chunk.len() > max_chars {
            packs.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(SEP);
        }
        current.push_str(chunk);
    }
    if !current.is_empty() {
        packs.push(current);
    }
    packs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::IndexOptions;
    use providers::hashing::HashingEmbedder;
    use providers::CompletionResponse;
    use std::sync::Mutex;

    /// Answers with the prompt it was given.
    #[derive(Default)]
    struct EchoLlm {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for EchoLlm {
        async fn complete(&self, prompt: &str) -> Result<CompletionResponse, ProviderError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            Ok(CompletionResponse {
                text: prompt.to_string(),
                model: None,
            })
        }
    }

    struct BlankLlm;

    #[async_trait::async_trait]
    impl LlmProvider for BlankLlm {
        async fn complete(&self, _prompt: &str) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: "  \n".into(),
                model: None,
            })
        }
    }

    struct DownLlm;

    #[async_trait::async_trait]
    impl LlmProvider for DownLlm {
        async fn complete(&self, _prompt: &str) -> Result<CompletionResponse, ProviderError> {
            Err(ProviderError::RequestFailed("503".into()))
        }
    }

    async fn index() -> VectorIndex {
        let docs = vec![
            Document::new("a.md", "Alpha")
                .with_metadata("file_path", "a.md")
                .with_metadata("file_name", "a.md"),
            Document::new("b.md", "Beta")
                .with_metadata("file_path", "b.md")
                .with_metadata("file_name", "b.md"),
        ];
        VectorIndex::build(&docs, &HashingEmbedder::default(), IndexOptions::default())
            .await
            .unwrap()
    }

    fn options(top_k: usize) -> QueryOptions {
        QueryOptions {
            similarity_top_k: top_k,
            ..QueryOptions::default()
        }
    }

    #[tokio::test]
    async fn answers_from_the_closest_node() {
        let index = index().await;
        let engine = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::default()),
            Arc::new(EchoLlm::default()),
            options(1),
        );
        let resp = engine.query("What does a.md contain?").await.unwrap();
        assert!(resp.answer.contains("Alpha"));
        assert!(!resp.answer.contains("Beta"));
        assert_eq!(resp.source_nodes.len(), 1);
        assert_eq!(resp.source_nodes[0].node.doc_id, "a.md");
        assert!(resp.trace.is_none());
        assert_eq!(resp.to_string(), resp.answer);
    }

    #[tokio::test]
    async fn overflow_context_is_refined() {
        let index = index().await;
        let llm = Arc::new(EchoLlm::default());
        let engine = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::default()),
            llm.clone(),
            QueryOptions {
                max_context_chars: 10,
                verbose: true,
                ..options(2)
            },
        );
        let resp = engine.query("What does a.md contain?").await.unwrap();
        let calls = llm.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("Context information is below."));
        assert!(calls[1].starts_with("The original question is as follows:"));
        assert!(calls[1].contains("existing answer"));

        let trace = resp.trace.unwrap();
        assert_eq!(trace.prompts, calls);
        assert_eq!(trace.retrieved.len(), 2);
        assert_eq!(trace.question, "What does a.md contain?");
    }

    #[tokio::test]
    async fn empty_index_has_no_context() {
        let empty = VectorIndex::build(&[], &HashingEmbedder::default(), IndexOptions::default())
            .await
            .unwrap();
        let engine = QueryEngine::new(
            &empty,
            Arc::new(HashingEmbedder::default()),
            Arc::new(EchoLlm::default()),
            QueryOptions::default(),
        );
        assert!(matches!(
            engine.query("anything").await,
            Err(QueryError::NoContext)
        ));
    }

    #[tokio::test]
    async fn cutoff_can_drop_every_node() {
        let index = index().await;
        let engine = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::default()),
            Arc::new(EchoLlm::default()),
            QueryOptions {
                similarity_cutoff: Some(1.01),
                ..QueryOptions::default()
            },
        );
        assert!(matches!(
            engine.query("a.md").await,
            Err(QueryError::NoContext)
        ));
    }

    #[tokio::test]
    async fn model_failures_surface() {
        let index = index().await;
        let blank = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::default()),
            Arc::new(BlankLlm),
            QueryOptions::default(),
        );
        assert!(matches!(blank.query("a.md").await, Err(QueryError::EmptyAnswer)));

        let down = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::default()),
            Arc::new(DownLlm),
            QueryOptions::default(),
        );
        assert!(matches!(
            down.query("a.md").await,
            Err(QueryError::Generation(ProviderError::RequestFailed(_)))
        ));
    }

    #[tokio::test]
    async fn question_embedded_with_other_dimensions_is_rejected() {
        let index = VectorIndex::build(
            &[Document::new("a.md", "Alpha")],
            &HashingEmbedder::new(1536),
            IndexOptions::default(),
        )
        .await
        .unwrap();
        let engine = QueryEngine::new(
            &index,
            Arc::new(HashingEmbedder::new(1024)),
            Arc::new(EchoLlm::default()),
            QueryOptions::default(),
        );
        assert!(matches!(
            engine.query("a.md").await,
            Err(QueryError::Embedding(EmbeddingError::DimensionMismatch {
                expected: 1536,
                got: 1024
            }))
        ));
    }

    #[test]
    fn packs_respect_the_budget() {
        let chunks = vec!["aaaa".to_string(), "bbbb".to_string(), "cccccccccccc".to_string()];
        let packs = pack_context(&chunks, 10);
        assert_eq!(packs, vec!["aaaa\n\nbbbb", "cccccccccccc"]);
        assert_eq!(pack_context(&[], 10), Vec::<String>::new());
    }
}
