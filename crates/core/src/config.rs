use crate::index::IndexOptions;
use crate::query::QueryOptions;
use providers::github::{DEFAULT_API_URL, DEFAULT_WEB_URL};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub github: GithubSettings,
    pub openai: OpenAiSettings,
    pub embeddings: EmbeddingConfig,
    pub index: IndexConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: String,
    pub web_url: String,
    pub concurrency: usize,
    /// Blobs larger than this many bytes are not downloaded.
    pub max_file_size: Option<u64>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            web_url: DEFAULT_WEB_URL.to_string(),
            concurrency: 8,
            max_file_size: Some(1024 * 1024),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            embedding_model: "text-embedding-ada-002".to_string(),
            chat_model: "gpt-3.5-turbo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `openai` or `hashing`.
    pub provider: String,
    /// Only used by the hashing embedder.
    pub dimensions: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            dimensions: providers::hashing::DEFAULT_DIMENSIONS,
            batch_size: crate::embeddings::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub include_extra_info: bool,
    pub persist_path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let opts = IndexOptions::default();
        Self {
            chunk_size: opts.chunk_size,
            chunk_overlap: opts.chunk_overlap,
            include_extra_info: opts.include_extra_info,
            persist_path: "repoqa-index.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub similarity_top_k: usize,
    pub similarity_cutoff: Option<f32>,
    pub max_context_chars: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        let opts = QueryOptions::default();
        Self {
            similarity_top_k: opts.similarity_top_k,
            similarity_cutoff: opts.similarity_cutoff,
            max_context_chars: opts.max_context_chars,
        }
    }
}

impl AppConfig {
    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            chunk_size: self.index.chunk_size,
            chunk_overlap: self.index.chunk_overlap,
            include_extra_info: self.index.include_extra_info,
            batch_size: self.embeddings.batch_size,
        }
    }

    pub fn query_options(&self, verbose: bool) -> QueryOptions {
        QueryOptions {
            similarity_top_k: self.query.similarity_top_k,
            similarity_cutoff: self.query.similarity_cutoff,
            max_context_chars: self.query.max_context_chars,
            verbose,
        }
    }
}

/// Secrets read from the environment once and handed to the clients that
/// need them.
#[derive(Clone, Default)]
pub struct Credentials {
    pub openai_api_key: Option<String>,
    pub github_token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            openai_api_key: var("OPENAI_API_KEY"),
            github_token: var("GITHUB_TOKEN"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("github_token", &redact(&self.github_token))
            .finish()
    }
}

/// Loads `path` (or `config/default` when absent) and applies
/// `REPOQA__SECTION__KEY` environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    load_with_env(path, None)
}

/// Like [`load`], but reads overrides from `env` instead of the process
/// environment when given.
pub fn load_with_env(
    path: Option<&str>,
    env: Option<config::Map<String, String>>,
) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("REPOQA")
            .separator("__")
            .try_parsing(true)
            .source(env),
    );
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}
