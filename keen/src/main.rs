//! keen - command line client for the local Keen event queue
//!
//! Queues events in the project's SQLite store, uploads them, and runs
//! queries against the Keen API.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/keen/<project_id>.db (~/.local/share/keen/<project_id>.db)
//! - Logs: $XDG_STATE_HOME/keen/keen.log (~/.local/state/keen/keen.log)
//! - Config: $XDG_CONFIG_HOME/keen/config.toml (~/.config/keen/config.toml)

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use keen_core::db::EventStore;
use keen_core::{legacy, logging, Config, KeenClient, KeenProperties, Query, QueryType};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keen")]
#[command(about = "Queue, upload and query Keen events")]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/keen/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project ID, overriding the config file
    #[arg(long, global = true)]
    project: Option<String>,

    /// Write key, overriding the config file
    #[arg(long, global = true)]
    write_key: Option<String>,

    /// Read key, overriding the config file
    #[arg(long, global = true)]
    read_key: Option<String>,

    /// Log to stderr as well (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queued events and failed queries
    Status,

    /// Queue an event
    Add {
        /// Event collection
        collection: String,
        /// Event properties as a JSON object
        event: String,
        /// Event time (RFC 3339), instead of now
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Upload queued events
    Upload,

    /// Run an analysis or funnel
    Query {
        /// Analysis type (count, sum, ...) or "funnel"
        analysis_type: String,
        /// Query parameters as a JSON object
        params: String,
    },

    /// Fetch the result of a saved analysis
    Saved {
        name: String,
    },

    /// Fetch the results of a cached dataset
    Dataset {
        name: String,
        /// URL parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Replay queries that failed earlier
    RetryQueries,

    /// Import events from the legacy file store
    ImportLegacy,

    /// Delete queued events
    Clear {
        /// Also delete failed queries
        #[arg(long)]
        queries: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    apply_overrides(&mut config, &args);

    let _log_guard = logging::init(&config.logging, logging::console_level(args.verbose))
        .context("failed to initialize logging")?;
    tracing::info!("keen starting");

    let client = KeenClient::open(&config).context("failed to open project")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let result = runtime.block_on(run(&client, &config, args.command));
    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(project) = &args.project {
        config.project.project_id = Some(project.clone());
    }
    if let Some(key) = &args.write_key {
        config.project.write_key = Some(key.clone());
    }
    if let Some(key) = &args.read_key {
        config.project.read_key = Some(key.clone());
    }
}

async fn run(client: &KeenClient, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Status => print_status(client, config),
        Command::Add {
            collection,
            event,
            timestamp,
        } => {
            let event = parse_object(&event, "event")?;
            let timestamp = timestamp
                .map(|ts| {
                    DateTime::parse_from_rfc3339(&ts)
                        .map(|ts| ts.with_timezone(&Utc))
                        .with_context(|| format!("invalid timestamp {:?}", ts))
                })
                .transpose()?;

            let id = client
                .add_event_with_properties(&collection, event, &KeenProperties { timestamp })
                .context("failed to add event")?;
            println!("Queued event {} in {}", id, collection);
            Ok(())
        }
        Command::Upload => {
            let queued = client.store().get_total_event_count();
            if queued == 0 {
                println!("No events to upload");
                return Ok(());
            }
            let report = client.upload().await.context("upload failed")?;
            println!(
                "Uploaded {} event(s) in {} request(s), {} dropped",
                report.events_sent, report.requests, report.events_dropped
            );
            Ok(())
        }
        Command::Query {
            analysis_type,
            params,
        } => {
            let query_type: QueryType = analysis_type
                .parse()
                .with_context(|| format!("unknown analysis type {:?}", analysis_type))?;
            let params = parse_object(&params, "params")?;
            let query = match query_type {
                QueryType::Analysis(analysis) => Query::analysis(analysis, params),
                QueryType::Funnel => Query::funnel(params),
                other => bail!("use the dedicated subcommand for {} queries", other),
            };
            print_json(&client.run_query(&query).await.context("query failed")?)
        }
        Command::Saved { name } => print_json(
            &client
                .run_saved_analysis(&name)
                .await
                .context("saved analysis failed")?,
        ),
        Command::Dataset { name, params } => {
            let params = parse_object(&params, "params")?;
            print_json(
                &client
                    .run_dataset_query(&name, params)
                    .await
                    .context("dataset query failed")?,
            )
        }
        Command::RetryQueries => {
            let retries = client
                .retry_failed_queries()
                .await
                .context("failed to retry queries")?;
            if retries.is_empty() {
                println!("No failed queries to retry");
            }
            for retry in &retries {
                match &retry.result {
                    Ok(_) => println!("{}: succeeded", retry.query.query_type),
                    Err(e) => println!(
                        "{}: failed again after {} attempt(s): {}",
                        retry.query.query_type,
                        retry.previous_attempts + 1,
                        e
                    ),
                }
            }
            Ok(())
        }
        Command::ImportLegacy => {
            if legacy::is_imported(client.store())? {
                println!("Legacy store already imported");
                return Ok(());
            }
            let imported = legacy::maybe_import(client.store(), &config.legacy_store_dir())
                .context("legacy import failed")?;
            println!("Imported {} legacy event(s)", imported);
            Ok(())
        }
        Command::Clear { queries } => {
            let events = client
                .store()
                .delete_all_events()
                .context("failed to delete events")?;
            println!("Deleted {} event(s)", events);
            if queries {
                let deleted = client
                    .store()
                    .delete_all_queries()
                    .context("failed to delete queries")?;
                println!("Deleted {} failed query(ies)", deleted);
            }
            Ok(())
        }
    }
}

fn print_status(client: &KeenClient, config: &Config) -> Result<()> {
    let store: &EventStore = client.store();
    let db_path = config.project_database_path()?;

    println!("Project:        {}", store.project_id());
    println!("Database:       {}", db_path.display());
    println!(
        "Upload ready:   {}",
        if client.project().is_ready() { "yes" } else { "no (missing write key)" }
    );
    println!("Queued events:  {}", store.get_total_event_count());
    println!("Pending events: {}", store.get_pending_event_count());
    println!("Failed queries: {}", store.get_query_count());
    println!(
        "Legacy import:  {}",
        if legacy::is_imported(store)? { "done" } else { "not run" }
    );
    Ok(())
}

fn parse_object(text: &str, what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text).with_context(|| format!("{} is not valid JSON", what))? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must be a JSON object", what),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
