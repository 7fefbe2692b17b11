use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use beans_bridge::config;
use beans_bridge::notify::LogNotifier;
use beans_bridge::{BeansService, NewRecord, RecordFilter, RecordUpdate};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML settings file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List records, optionally filtered
    List {
        #[arg(long)]
        status: Vec<String>,
        #[arg(long = "type")]
        kind: Vec<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Show one record
    Show { id: String },
    /// Create a record
    Create {
        title: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Update a record; a status change cascades to its children
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        parent: Option<String>,
        /// Remove the parent link
        #[arg(long, conflicts_with = "parent")]
        clear_parent: bool,
    },
    /// Delete one or more records
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Initialise a beans workspace
    Init,
    /// Print the backend GraphQL schema
    Schema,
    /// Check that the beans binary responds
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = config::load(args.config.as_deref())?;
    let service = BeansService::new(&settings, Arc::new(LogNotifier));

    match args.command {
        Command::List {
            status,
            kind,
            search,
            parent,
        } => {
            let filter = RecordFilter {
                status: status.into_iter().map(Into::into).collect(),
                kind: kind.into_iter().map(Into::into).collect(),
                search,
                parent,
            };
            let records = service.list_records(&filter).await?;
            if service.is_offline() {
                info!("served from offline cache");
            }
            print_json(&records)?;
        }
        Command::Show { id } => print_json(&service.show_record(&id).await?)?,
        Command::Create {
            title,
            status,
            kind,
            priority,
            body,
            tag,
            parent,
        } => {
            let record = service
                .create_record(NewRecord {
                    title,
                    status: status.map(Into::into),
                    kind: kind.map(Into::into),
                    priority: priority.map(Into::into),
                    body,
                    tags: tag,
                    parent,
                })
                .await?;
            print_json(&record)?;
        }
        Command::Update {
            id,
            title,
            status,
            kind,
            priority,
            body,
            parent,
            clear_parent,
        } => {
            let update = RecordUpdate {
                title,
                status: status.map(Into::into),
                kind: kind.map(Into::into),
                priority: priority.map(Into::into),
                body,
                tags: None,
                parent: if clear_parent { Some(None) } else { parent.map(Some) },
            };
            print_json(&service.update_record(&id, update).await?)?;
        }
        Command::Delete { mut ids } => {
            if ids.len() == 1 {
                let id = ids.remove(0);
                service.delete_record(&id).await?;
                print_json(&serde_json::json!({ "deleted": [id] }))?;
            } else {
                let results = service.delete_records(ids.clone()).await?;
                let mut deleted = Vec::new();
                let mut failed = Vec::new();
                for item in results {
                    match item.result {
                        Ok(()) => deleted.push(ids[item.index].clone()),
                        Err(err) => failed.push(serde_json::json!({
                            "id": ids[item.index],
                            "error": err.to_string(),
                        })),
                    }
                }
                print_json(&serde_json::json!({ "deleted": deleted, "failed": failed }))?;
                if !failed.is_empty() {
                    bail!("{} of {} deletions failed", failed.len(), ids.len());
                }
            }
        }
        Command::Init => println!("{}", service.init().await?.trim_end()),
        Command::Schema => println!("{}", service.schema().await?.trim_end()),
        Command::Check => println!("{}", service.check_available().await?),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
