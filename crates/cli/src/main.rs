use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::render;
use repoqa_core::config::{self, Credentials};
use repoqa_core::pipeline::{Pipeline, RepoRef, RunOptions};
use repoqa_core::query::Response;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load(cli.config.as_deref())?;
    let creds = Credentials::from_env();
    let pipeline = Pipeline::new(cfg, &creds)?;

    match cli.command {
        Commands::Ask {
            owner,
            repo,
            question,
            branch,
            use_parser,
            persist,
        } => {
            let opts = RunOptions {
                use_parser,
                verbose: cli.verbose,
                persist,
            };
            let resp = pipeline
                .ask(&RepoRef::new(owner, repo, branch), &question, &opts)
                .await?;
            print_response(&resp, cli.json)
        }
        Commands::Index {
            owner,
            repo,
            branch,
            use_parser,
            persist,
        } => {
            let opts = RunOptions {
                use_parser,
                verbose: cli.verbose,
                persist,
            };
            let (index, path) = pipeline
                .index(&RepoRef::new(owner, repo, branch), &opts)
                .await?;
            let documents = index.docstore().document_count();
            if cli.json {
                let summary = serde_json::json!({
                    "status": "ok",
                    "documents": documents,
                    "nodes": index.len(),
                    "path": path.display().to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "indexed {} documents ({} nodes) into {}",
                    documents,
                    index.len(),
                    path.display()
                );
            }
            Ok(())
        }
        Commands::Query { question, index } => {
            let opts = RunOptions {
                persist: index,
                ..RunOptions::default()
            };
            let path = pipeline.persist_path(&opts);
            let loaded = pipeline.load_index(&path)?;
            info!("loaded {} nodes from {}", loaded.len(), path.display());
            let resp = pipeline.answer(&loaded, &question, cli.verbose).await?;
            print_response(&resp, cli.json)
        }
        Commands::Refresh {
            owner,
            repo,
            branch,
            use_parser,
            index,
        } => {
            let opts = RunOptions {
                use_parser,
                verbose: cli.verbose,
                persist: index,
            };
            let summary = pipeline
                .refresh(&RepoRef::new(owner, repo, branch), &opts)
                .await?;
            if cli.json {
                let value = serde_json::json!({
                    "status": "ok",
                    "documents": summary.documents,
                    "refreshed": summary.refreshed,
                    "removed": summary.removed,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "refresh: {} documents, {} re-indexed, {} removed",
                    summary.documents, summary.refreshed, summary.removed
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,repoqa_core=debug,providers=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_response(resp: &Response, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&render::json(resp))?);
    } else {
        println!("{}", render::text(resp));
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "repoqa")]
#[command(about = "Ask questions about the contents of a GitHub repository", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    /// Log each stage in detail and include a retrieval trace
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a branch, index it and answer a question
    Ask {
        owner: String,
        repo: String,
        question: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Use format-specific parsers (markdown, json, pdf)
        #[arg(long)]
        use_parser: bool,
        /// Where to write the index snapshot
        #[arg(long)]
        persist: Option<PathBuf>,
    },
    /// Fetch a branch and write its index snapshot
    Index {
        owner: String,
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        use_parser: bool,
        #[arg(long)]
        persist: Option<PathBuf>,
    },
    /// Answer a question from a saved index
    Query {
        question: String,
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// Re-fetch a branch and re-index changed files
    Refresh {
        owner: String,
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        use_parser: bool,
        #[arg(long)]
        index: Option<PathBuf>,
    },
}
