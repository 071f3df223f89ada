mod agent;
mod chat;
mod commands;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use common::{config::get_config, modes::ResponseMode};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::agent::{Operation, RagAgent};

#[derive(Parser)]
#[command(
    name = "ragmend",
    about = "Self-optimizing retrieval-augmented QA engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// End-user response shaping (default).
    #[arg(long, group = "mode")]
    concise: bool,

    /// System-integration response shaping.
    #[arg(long, group = "mode")]
    internal: bool,

    /// Engineering response shaping; skips guardrails.
    #[arg(long, group = "mode")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat,
    /// Ask a single question and print the response.
    Ask { question: String },
    /// Ingest rows of a SQLite table from the source database.
    IngestTable {
        table: String,
        /// Path to the source database file.
        #[arg(long)]
        db: String,
    },
    /// Ingest a file, or every supported file under a directory.
    IngestPath {
        path: PathBuf,
        #[arg(long, default_value_t = true)]
        recursive: bool,
    },
}

impl Cli {
    const fn response_mode(&self) -> ResponseMode {
        if self.verbose {
            ResponseMode::Verbose
        } else if self.internal {
            ResponseMode::Internal
        } else {
            ResponseMode::Concise
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    let config = get_config()?;
    let agent = RagAgent::from_config(&config).await?;
    let mode = cli.response_mode();

    match cli.command {
        Command::Chat => {
            let code = chat::run_chat(&agent, mode).await?;
            Ok(u8::try_from(code).unwrap_or(1))
        }
        Command::Ask { question } => {
            let result = agent
                .invoke(Operation::AskQuestion {
                    question,
                    doc_id: None,
                    response_mode: mode,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(success_code(&result))
        }
        Command::IngestTable { table, db } => {
            let result = agent
                .invoke(Operation::IngestSqliteTable {
                    table_name: table,
                    db_path: db,
                    rbac_namespace: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(success_code(&result))
        }
        Command::IngestPath { path, recursive } => {
            let result = agent
                .invoke(Operation::IngestFromPath { path, recursive })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(success_code(&result))
        }
    }
}

fn success_code(result: &serde_json::Value) -> u8 {
    if result.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
        1
    } else {
        0
    }
}
