//! The four stages wired together: credentials, acquisition, indexing and
//! question answering.

use crate::config::{AppConfig, Credentials};
use crate::document::Document;
use crate::index::VectorIndex;
use crate::query::{QueryEngine, Response};
use crate::reader::{GithubRepositoryReader, ReaderOptions};
use anyhow::Context;
use providers::github::{GithubClient, GithubConfig, TreeFilter};
use providers::hashing::HashingEmbedder;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::{EmbeddingProvider, LlmProvider, ProviderRegistry};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Owner, repository and branch of the content to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub use_parser: bool,
    pub verbose: bool,
    /// Overrides `index.persist_path`.
    pub persist: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub documents: usize,
    pub refreshed: usize,
    pub removed: usize,
}

pub struct Pipeline {
    config: AppConfig,
    registry: ProviderRegistry,
    client: GithubClient,
    filter: TreeFilter,
}

impl Pipeline {
    pub fn new(config: AppConfig, creds: &Credentials) -> anyhow::Result<Self> {
        let registry = build_registry(&config, creds);
        let mut gh = GithubConfig::new(creds.github_token.clone());
        gh.api_url = config.github.api_url.clone();
        gh.web_url = config.github.web_url.clone();
        gh.concurrency = config.github.concurrency;
        let filter = TreeFilter::new(
            &config.github.include,
            &config.github.exclude,
            config.github.max_file_size,
        )
        .context("invalid github include/exclude patterns")?;
        Ok(Self {
            config,
            registry,
            client: GithubClient::new(gh),
            filter,
        })
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn embedder(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        self.registry.embedding(None).with_context(|| {
            format!(
                "embedding provider '{}' is not available (is OPENAI_API_KEY set?)",
                self.config.embeddings.provider
            )
        })
    }

    fn llm(&self) -> anyhow::Result<Arc<dyn LlmProvider>> {
        self.registry
            .llm(None)
            .context("no language model available (is OPENAI_API_KEY set?)")
    }

    /// Identifies the configured embedding model. Stored in every index built
    /// here and checked before the index is queried or refreshed.
    pub fn embedder_label(&self) -> String {
        let emb = &self.config.embeddings;
        match emb.provider.as_str() {
            "openai" => format!("openai:{}", self.config.openai.embedding_model),
            "hashing" => format!("hashing:{}", emb.dimensions),
            other => other.to_string(),
        }
    }

    fn check_embedder(&self, index: &VectorIndex) -> anyhow::Result<()> {
        let label = self.embedder_label();
        match index.embedder() {
            Some(built) if built != label => anyhow::bail!(
                "index was built with embedder '{}' but '{}' is configured",
                built,
                label
            ),
            _ => Ok(()),
        }
    }

    pub fn persist_path(&self, opts: &RunOptions) -> PathBuf {
        opts.persist
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.config.index.persist_path))
    }

    pub async fn acquire(&self, repo: &RepoRef, opts: &RunOptions) -> anyhow::Result<Vec<Document>> {
        info!("acquiring documents from {}", repo);
        let reader = GithubRepositoryReader::new(
            self.client.clone(),
            ReaderOptions {
                use_parser: opts.use_parser,
                verbose: opts.verbose,
                filter: self.filter.clone(),
            },
        );
        reader
            .load_data(&repo.owner, &repo.repo, &repo.branch)
            .await
            .with_context(|| format!("failed to load {}", repo))
    }

    pub async fn build_index(&self, documents: &[Document]) -> anyhow::Result<VectorIndex> {
        let embedder = self.embedder()?;
        let mut index = VectorIndex::build(documents, embedder.as_ref(), self.config.index_options())
            .await
            .context("index construction failed")?;
        index.set_embedder(self.embedder_label());
        Ok(index)
    }

    pub fn persist(&self, index: &VectorIndex, path: &Path) -> anyhow::Result<()> {
        index
            .persist(path)
            .with_context(|| format!("failed to persist index to {}", path.display()))
    }

    pub fn load_index(&self, path: &Path) -> anyhow::Result<VectorIndex> {
        VectorIndex::load(path).with_context(|| format!("failed to load index from {}", path.display()))
    }

    pub async fn answer(
        &self,
        index: &VectorIndex,
        question: &str,
        verbose: bool,
    ) -> anyhow::Result<Response> {
        self.check_embedder(index)?;
        let engine = QueryEngine::new(
            index,
            self.embedder()?,
            self.llm()?,
            self.config.query_options(verbose),
        );
        engine.query(question).await.context("query failed")
    }

    /// Acquires, builds and persists. Returns the index and where it was
    /// written.
    pub async fn index(&self, repo: &RepoRef, opts: &RunOptions) -> anyhow::Result<(VectorIndex, PathBuf)> {
        let documents = self.acquire(repo, opts).await?;
        let mut index = self.build_index(&documents).await?;
        index.set_extra_info(
            [
                ("owner".to_string(), repo.owner.clone()),
                ("repo".to_string(), repo.repo.clone()),
                ("branch".to_string(), repo.branch.clone()),
            ]
            .into_iter()
            .collect(),
        );
        let path = self.persist_path(opts);
        self.persist(&index, &path)?;
        Ok((index, path))
    }

    /// All four stages: acquire, build, persist, answer.
    pub async fn ask(&self, repo: &RepoRef, question: &str, opts: &RunOptions) -> anyhow::Result<Response> {
        let (index, path) = self.index(repo, opts).await?;
        debug!("index written to {}", path.display());
        self.answer(&index, question, opts.verbose).await
    }

    /// Re-acquires `repo` and re-embeds only documents that changed.
    /// Documents no longer on the branch are removed.
    pub async fn refresh(&self, repo: &RepoRef, opts: &RunOptions) -> anyhow::Result<RefreshSummary> {
        let path = self.persist_path(opts);
        let mut index = self.load_index(&path)?;
        self.check_embedder(&index)?;
        let documents = self.acquire(repo, opts).await?;
        let embedder = self.embedder()?;
        let flags = index
            .refresh(&documents, embedder.as_ref())
            .await
            .context("refresh failed")?;

        let current: HashSet<&str> = documents.iter().map(|d| d.doc_id.as_str()).collect();
        let stale: Vec<String> = index
            .docstore()
            .doc_ids()
            .filter(|id| !current.contains(id))
            .map(str::to_string)
            .collect();
        for doc_id in &stale {
            index.delete(doc_id)?;
        }

        self.persist(&index, &path)?;
        let summary = RefreshSummary {
            documents: documents.len(),
            refreshed: flags.iter().filter(|f| **f).count(),
            removed: stale.len(),
        };
        info!(
            "refreshed {}: {} changed, {} removed",
            repo, summary.refreshed, summary.removed
        );
        Ok(summary)
    }
}

/// Registers the hashing embedder unconditionally and OpenAI when a key is
/// available. Preferences follow the config.
pub fn build_registry(config: &AppConfig, creds: &Credentials) -> ProviderRegistry {
    let mut reg = ProviderRegistry::new().with_embedding(
        "hashing",
        Arc::new(HashingEmbedder::new(config.embeddings.dimensions)),
    );

    if let Some(key) = &creds.openai_api_key {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: key.clone(),
            base_url: config.openai.base_url.clone(),
            embedding_model: config.openai.embedding_model.clone(),
            chat_model: config.openai.chat_model.clone(),
        });
        reg = reg
            .with_embedding("openai", Arc::new(provider.clone()))
            .with_llm("openai", Arc::new(provider))
            .set_preferred_llm("openai");
    }

    reg.set_preferred_embedding(&config.embeddings.provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_always_available() {
        let mut cfg = AppConfig::default();
        cfg.embeddings.provider = "hashing".into();
        let reg = build_registry(&cfg, &Credentials::default());
        assert!(reg.embedding(None).is_ok());
        assert!(reg.llm(None).is_err());
    }

    #[test]
    fn openai_requires_a_key() {
        let cfg = AppConfig::default();
        let without = build_registry(&cfg, &Credentials::default());
        assert!(without.embedding(None).is_err());

        let creds = Credentials {
            openai_api_key: Some("sk-test".into()),
            github_token: None,
        };
        let with = build_registry(&cfg, &creds);
        assert!(with.embedding(None).is_ok());
        assert!(with.llm(None).is_ok());
    }

    #[test]
    fn bad_glob_is_rejected_up_front() {
        let mut cfg = AppConfig::default();
        cfg.github.include = vec!["[".into()];
        assert!(Pipeline::new(cfg, &Credentials::default()).is_err());
    }

    fn hashing_pipeline(dimensions: usize) -> Pipeline {
        let mut cfg = AppConfig::default();
        cfg.embeddings.provider = "hashing".into();
        cfg.embeddings.dimensions = dimensions;
        Pipeline::new(cfg, &Credentials::default()).unwrap()
    }

    #[tokio::test]
    async fn index_from_another_embedder_is_rejected() {
        let docs = vec![Document::new("a.md", "Alpha")];
        let index = hashing_pipeline(1024).build_index(&docs).await.unwrap();
        assert_eq!(index.embedder(), Some("hashing:1024"));

        let other = hashing_pipeline(256);
        let err = other.answer(&index, "a.md", false).await.unwrap_err();
        assert!(err.to_string().contains("was built with embedder 'hashing:1024'"));

        let dir = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            persist: Some(dir.path().join("index.json")),
            ..RunOptions::default()
        };
        other.persist(&index, &other.persist_path(&opts)).unwrap();
        let err = other
            .refresh(&RepoRef::new("acme", "docs", "main"), &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hashing:256"));
    }

    #[test]
    fn persist_override_wins() {
        let pipeline = Pipeline::new(AppConfig::default(), &Credentials::default()).unwrap();
        assert_eq!(
            pipeline.persist_path(&RunOptions::default()),
            PathBuf::from("repoqa-index.json")
        );
        let opts = RunOptions {
            persist: Some(PathBuf::from("/tmp/x.json")),
            ..RunOptions::default()
        };
        assert_eq!(pipeline.persist_path(&opts), PathBuf::from("/tmp/x.json"));
    }
}
