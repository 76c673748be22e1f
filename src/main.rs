//! Audit Events CLI - Binary Entry Point
//!
//! Runs migrations and searches against a JSONL dump of the audit table.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use audit_events::query::SearchRequest;
use audit_events::{AuditLog, AuditLogConfig, AuditResult, MemoryStore, Order, WhereExpr};

#[derive(Parser)]
#[command(name = "audit-events")]
#[command(about = "Audit event table migrations and searches over a JSONL table dump")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring every record of a table dump up to the current schema
    Migrate {
        /// Table dump, one JSON item per line
        #[arg(long)]
        input: PathBuf,
        /// Where to write the migrated table (default: overwrite input)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print one page of events as JSON lines
    Search {
        /// Table dump, one JSON item per line
        #[arg(long)]
        input: PathBuf,
        /// Start of the range (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,
        /// End of the range (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,
        /// Only events of this namespace
        #[arg(long)]
        namespace: Option<String>,
        /// Only events of these types (repeatable)
        #[arg(long = "event-type")]
        event_types: Vec<String>,
        /// Maximum events in the page (0: as many as fit)
        #[arg(long, default_value_t = 0)]
        limit: usize,
        /// asc or desc
        #[arg(long, default_value = "asc")]
        order: Order,
        /// Predicate over event fields, as a JSON-encoded WhereExpr
        #[arg(long = "where")]
        condition: Option<String>,
        /// Checkpoint printed by the previous page
        #[arg(long, default_value = "")]
        checkpoint: String,
    },
}

fn load(input: &PathBuf, config: &AuditLogConfig) -> AuditResult<AuditLog<MemoryStore>> {
    let store = MemoryStore::load_jsonl(config.table_name.clone(), input)?
        .with_index(config.index_name.clone());
    AuditLog::new(config.clone(), Arc::new(store))
}

async fn migrate(input: PathBuf, output: Option<PathBuf>) -> AuditResult<()> {
    let config = AuditLogConfig::from_env()?;
    let log = load(&input, &config)?;

    for report in log.migrate().await? {
        println!(
            "{}: scanned {}, migrated {}, skipped {}, failed {}{}",
            report.migration,
            report.scanned,
            report.migrated,
            report.skipped,
            report.failures.len(),
            if report.completed { "" } else { " (incomplete)" }
        );
        for failure in &report.failures {
            eprintln!("  {:?}: {}", failure.key, failure.error);
        }
    }

    log.store().save_jsonl(output.unwrap_or(input))
}

#[allow(clippy::too_many_arguments)]
async fn search(
    input: PathBuf,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    namespace: Option<String>,
    event_types: Vec<String>,
    limit: usize,
    order: Order,
    condition: Option<String>,
    checkpoint: String,
) -> AuditResult<()> {
    let config = AuditLogConfig::from_env()?;
    let log = load(&input, &config)?;

    let mut request = SearchRequest::new(from, to)
        .with_event_types(event_types)
        .with_limit(limit)
        .with_order(order)
        .with_start_key(checkpoint);
    request.namespace = namespace;
    if let Some(raw) = condition {
        request.filter.condition = Some(serde_json::from_str::<WhereExpr>(&raw)?);
    }

    let page = log.search_events_raw(&request).await?;
    for event in &page.events {
        println!("{}", event.to_json_line()?);
    }
    if !page.is_last() {
        eprintln!("checkpoint: {}", page.checkpoint);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Migrate { input, output } => migrate(input, output).await,
        Commands::Search {
            input,
            from,
            to,
            namespace,
            event_types,
            limit,
            order,
            condition,
            checkpoint,
        } => {
            search(
                input,
                from,
                to,
                namespace,
                event_types,
                limit,
                order,
                condition,
                checkpoint,
            )
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
