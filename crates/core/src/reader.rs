//! Loads the files of a GitHub branch as [`Document`]s.

use crate::document::Document;
use crate::parser;
use providers::github::{GithubClient, RepoFile, SourceError, TreeFilter};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Route blobs through format-specific parsers instead of plain UTF-8
    /// decoding.
    pub use_parser: bool,
    pub verbose: bool,
    pub filter: TreeFilter,
}

#[derive(Clone)]
pub struct GithubRepositoryReader {
    client: GithubClient,
    options: ReaderOptions,
}

impl GithubRepositoryReader {
    pub fn new(client: GithubClient, options: ReaderOptions) -> Self {
        Self { client, options }
    }

    /// Fetches every eligible file on `branch`.
    ///
    /// Errors surface before any document is produced: the whole branch is
    /// downloaded first, then converted.
    pub async fn load_data(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Document>, SourceError> {
        let files = self
            .client
            .fetch_branch_files(owner, repo, branch, &self.options.filter)
            .await?;
        let total = files.len();
        let documents: Vec<Document> = files
            .into_iter()
            .filter_map(|file| self.to_document(file, owner, repo, branch))
            .collect();
        info!(
            "loaded {} documents from {}/{}@{} ({} files fetched)",
            documents.len(),
            owner,
            repo,
            branch,
            total
        );
        Ok(documents)
    }

    fn to_document(
        &self,
        file: RepoFile,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Option<Document> {
        let path = Path::new(&file.path);
        let text = if self.options.use_parser {
            match parser::parse(path, &file.content) {
                Ok(text) => text,
                Err(e) => {
                    warn!("skipping {}: {}", file.path, e);
                    return None;
                }
            }
        } else {
            parser::decode_utf8(&file.content)
        };
        let Some(text) = text else {
            debug!("skipping {}: no text content", file.path);
            return None;
        };
        if self.options.verbose {
            info!("fetched {} ({} bytes)", file.path, file.size);
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file.path)
            .to_string();
        Some(
            Document::new(file.path.clone(), text)
                .with_metadata("file_path", file.path)
                .with_metadata("file_name", file_name)
                .with_metadata("owner", owner)
                .with_metadata("repo", repo)
                .with_metadata("branch", branch)
                .with_metadata("sha", file.sha)
                .with_metadata("url", file.html_url),
        )
    }
}
