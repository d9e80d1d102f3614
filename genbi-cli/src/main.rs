use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use genbi_core::{CancelToken, GenbiKernel, Settings, StaticExecutors};
use genbi_policy::SqlValidator;
use genbi_types::DatabaseSchema;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "genbi")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether a query would be allowed to run.
    Validate { sql: String },
    /// Index a schema JSON file for a database id.
    Index {
        #[arg(long)]
        db: String,
        #[arg(long)]
        schema: PathBuf,
        /// Drop the existing index first.
        #[arg(long)]
        rebuild: bool,
    },
    Retrieve {
        #[arg(long)]
        db: String,
        #[arg(long)]
        question: String,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },
    Generate {
        #[arg(long)]
        db: String,
        #[arg(long)]
        question: String,
    },
    Delete {
        #[arg(long)]
        db: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Command::Validate { sql } = &cli.command {
        let validator = SqlValidator::new();
        let decision = validator.validate(sql);
        if decision.is_allowed() {
            println!("allowed ({:?})", validator.query_kind(sql));
        } else {
            println!("rejected: {}", decision.reason());
            std::process::exit(1);
        }
        return Ok(());
    }

    let kernel = GenbiKernel::from_settings(&settings, Arc::new(StaticExecutors::new()));
    match cli.command {
        Command::Validate { .. } => {}
        Command::Index { db, schema, rebuild } => {
            let text = std::fs::read_to_string(&schema)?;
            let schema: DatabaseSchema = serde_json::from_str(&text)?;
            let report = if rebuild {
                kernel.indexer.reindex(&db, &schema).await?
            } else {
                kernel.indexer.index(&db, &schema).await?
            };
            println!(
                "indexed {} documents for '{}' ({} tables, {} total)",
                report.documents, report.database_id, report.tables, report.total_documents
            );
        }
        Command::Retrieve { db, question, k } => {
            let docs = kernel.indexer.retrieve(&db, &question, k).await;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Command::Generate { db, question } => {
            let result = kernel.generate(&db, &question, &CancelToken::new()).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_completed() {
                std::process::exit(1);
            }
        }
        Command::Delete { db } => {
            if !kernel.indexer.delete(&db).await {
                anyhow::bail!("failed to delete index for '{db}'");
            }
            println!("deleted index for '{db}'");
        }
    }

    Ok(())
}
