//! GitHub REST client for reading every file on a branch.
//!
//! Acquisition is three calls deep: branch -> root tree (recursive) -> blobs.
//! Blob downloads run with bounded concurrency and the result is ordered by
//! path.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_WEB_URL: &str = "https://github.com";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited (reset at {reset:?})")]
    RateLimited { reset: Option<u64> },
    #[error("repository is empty")]
    EmptyRepository,
    #[error("invalid filter: {0}")]
    Filter(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct GithubConfig {
    pub api_url: String,
    pub web_url: String,
    pub token: Option<String>,
    pub concurrency: usize,
    pub user_agent: String,
}

impl GithubConfig {
    pub fn new(token: Option<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            web_url: DEFAULT_WEB_URL.to_string(),
            token,
            concurrency: 8,
            user_agent: concat!("repoqa/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Entry of a git tree listing. `kind` is `blob`, `tree` or `commit`.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RepoFile {
    pub path: String,
    pub sha: String,
    pub size: u64,
    pub html_url: String,
    pub content: Vec<u8>,
}

/// Selects which tree entries get downloaded.
#[derive(Debug, Clone, Default)]
pub struct TreeFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    max_file_size: Option<u64>,
}

impl TreeFilter {
    pub fn new(
        include: &[String],
        exclude: &[String],
        max_file_size: Option<u64>,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
            max_file_size,
        })
    }

    pub fn accepts(&self, entry: &TreeEntry) -> bool {
        if entry.kind != "blob" {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.is_match(&entry.path) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&entry.path) {
                return false;
            }
        }
        match (self.max_file_size, entry.size) {
            (Some(max), Some(size)) => size <= max,
            _ => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, SourceError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).map_err(|e| SourceError::Filter(e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| SourceError::Filter(e.to_string()))
}

#[derive(Clone)]
pub struct GithubClient {
    client: Client,
    cfg: GithubConfig,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    tree: ShaRef,
}

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
    #[serde(default)]
    size: Option<u64>,
}

impl GithubClient {
    pub fn new(cfg: GithubConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: String, what: &str) -> Result<T, SourceError> {
        let mut builder = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header(USER_AGENT, &self.cfg.user_agent);
        if let Some(token) = &self.cfg.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;
        let resp = check_status(resp, what).await?;
        resp.json()
            .await
            .map_err(|e| SourceError::Decode(format!("{what}: {e}")))
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.cfg.api_url.trim_end_matches('/'),
            owner,
            repo
        )
    }

    pub async fn branch_tree_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, SourceError> {
        let url = format!("{}/branches/{}", self.repo_url(owner, repo), branch);
        let what = format!("branch {owner}/{repo}@{branch}");
        let resp: BranchResponse = self.get(url, &what).await?;
        Ok(resp.commit.commit.tree.sha)
    }

    /// Lists every entry below `tree_sha`, sorted by path.
    pub async fn list_tree(
        &self,
        owner: &str,
        repo: &str,
        tree_sha: &str,
    ) -> Result<Vec<TreeEntry>, SourceError> {
        let url = format!(
            "{}/git/trees/{}?recursive=1",
            self.repo_url(owner, repo),
            tree_sha
        );
        let resp: TreeResponse = self.get(url, &format!("tree {tree_sha}")).await?;
        let mut entries = if resp.truncated {
            warn!(
                "tree listing for {}/{} truncated, walking subtrees one level at a time",
                owner, repo
            );
            self.walk_tree(owner, repo, tree_sha).await?
        } else {
            resp.tree
        };
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn walk_tree(
        &self,
        owner: &str,
        repo: &str,
        root_sha: &str,
    ) -> Result<Vec<TreeEntry>, SourceError> {
        let mut pending = vec![(root_sha.to_string(), String::new())];
        let mut entries = Vec::new();
        while let Some((sha, prefix)) = pending.pop() {
            let url = format!("{}/git/trees/{}", self.repo_url(owner, repo), sha);
            let resp: TreeResponse = self.get(url, &format!("tree {sha}")).await?;
            for mut entry in resp.tree {
                if !prefix.is_empty() {
                    entry.path = format!("{}/{}", prefix, entry.path);
                }
                if entry.kind == "tree" {
                    pending.push((entry.sha.clone(), entry.path.clone()));
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn fetch_blob(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/git/blobs/{}", self.repo_url(owner, repo), sha);
        let blob: BlobResponse = self.get(url, &format!("blob {sha}")).await?;
        let content = decode_blob(&blob)?;
        if let Some(size) = blob.size {
            if size as usize != content.len() {
                debug!("blob {} declared {} bytes, decoded {}", sha, size, content.len());
            }
        }
        Ok(content)
    }

    /// Downloads all files on `branch` accepted by `filter`.
    ///
    /// An empty repository yields an empty list rather than an error.
    pub async fn fetch_branch_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        filter: &TreeFilter,
    ) -> Result<Vec<RepoFile>, SourceError> {
        let tree_sha = match self.branch_tree_sha(owner, repo, branch).await {
            Err(SourceError::EmptyRepository) => return Ok(Vec::new()),
            other => other?,
        };
        let entries = match self.list_tree(owner, repo, &tree_sha).await {
            Err(SourceError::EmptyRepository) => return Ok(Vec::new()),
            other => other?,
        };

        let selected: Vec<TreeEntry> = entries.into_iter().filter(|e| filter.accepts(e)).collect();
        debug!(
            "{}/{}@{}: {} files selected for download",
            owner,
            repo,
            branch,
            selected.len()
        );

        let web_base = self.cfg.web_url.trim_end_matches('/').to_string();
        stream::iter(selected)
            .map(|entry| {
                let web_base = web_base.clone();
                async move {
                    let content = self.fetch_blob(owner, repo, &entry.sha).await?;
                    Ok::<_, SourceError>(RepoFile {
                        html_url: format!(
                            "{}/{}/{}/blob/{}/{}",
                            web_base, owner, repo, branch, entry.path
                        ),
                        size: entry.size.unwrap_or(content.len() as u64),
                        path: entry.path,
                        sha: entry.sha,
                        content,
                    })
                }
            })
            .buffered(self.cfg.concurrency.max(1))
            .try_collect()
            .await
    }
}

fn decode_blob(blob: &BlobResponse) -> Result<Vec<u8>, SourceError> {
    match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob
                .content
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            STANDARD
                .decode(compact)
                .map_err(|e| SourceError::Decode(format!("blob content: {e}")))
        }
        "utf-8" | "utf8" => Ok(blob.content.clone().into_bytes()),
        other => Err(SourceError::Decode(format!("unknown blob encoding {other}"))),
    }
}

async fn check_status(resp: Response, what: &str) -> Result<Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let header_u64 = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let remaining = header_u64("x-ratelimit-remaining");
    let reset = header_u64("x-ratelimit-reset");
    let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
    let body = String::from_utf8_lossy(&body).into_owned();

    Err(match status {
        StatusCode::UNAUTHORIZED => SourceError::Authentication(format!("{what}: {body}")),
        StatusCode::FORBIDDEN if remaining == Some(0) => SourceError::RateLimited { reset },
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited { reset },
        StatusCode::FORBIDDEN => SourceError::Authentication(format!("{what}: {body}")),
        StatusCode::NOT_FOUND => SourceError::NotFound(what.to_string()),
        StatusCode::CONFLICT => SourceError::EmptyRepository,
        _ => SourceError::Request(format!("{what}: status {} body {}", status, body)),
    })
}
