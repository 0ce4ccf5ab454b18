//! hookq CLI: run the dispatcher and operate on the queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hookq::config::Config;
use hookq::db::Db;
use hookq::engine::{DispatchConfig, DispatchLoop};
use hookq::model::{Destination, NewWorkItem, WorkId};
use hookq::sender::{HttpSender, HttpSenderConfig};
use hookq::store::WorkItemStore;
use hookq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "hookq", about = "Leased work queue for outbound webhooks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch loop until interrupted
    Serve {
        /// TOML file with dispatch and sender settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Queue a webhook for delivery
    Enqueue {
        /// Destination URL
        url: String,
        /// Request body
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Extra request header, as NAME:VALUE (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Caller-chosen work item ID
        #[arg(long)]
        id: Option<String>,
    },
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
        /// Print the raw item as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dead-letter operations
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-lettered items, oldest first
    List {
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Put a dead-lettered item back in the queue
    Requeue {
        /// Work item ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { config: path } => cmd_serve(config, path).await,
        Command::Enqueue {
            url,
            payload,
            headers,
            id,
        } => cmd_enqueue(&open_db(&config).await?, url, payload, headers, id).await,
        Command::Show { id, json } => cmd_show(&open_db(&config).await?, id, json).await,
        Command::DeadLetters { action } => {
            let db = open_db(&config).await?;
            match action {
                DeadLetterAction::List { limit } => cmd_dead_letter_list(&db, limit).await,
                DeadLetterAction::Requeue { id } => {
                    db.requeue_dead_letter(&WorkId::from(id.as_str())).await?;
                    println!("Requeued: {id}");
                    Ok(())
                }
            }
        }
    }
}

async fn open_db(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(mut config: Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(path) = path {
        // Environment wins over the file.
        let file = hookq::config::Settings::from_toml_file(&path)?;
        config.settings = file.merge(config.settings);
    }

    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let db = open_db(&config).await?;

    let mut sender = HttpSender::new(HttpSenderConfig::from_settings(&config.settings)?)?;
    if let Some(secret) = config.signing_secret.clone() {
        sender = sender.with_signing_secret(secret);
    }

    let dispatch = DispatchLoop::new(
        Arc::new(db),
        Arc::new(sender),
        DispatchConfig::from_settings(&config.settings)?,
    )?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, draining in-flight deliveries");
        on_signal.cancel();
    });

    let summary = dispatch.start(cancel).await?;
    println!(
        "Stopped: {} delivered, {} retried, {} dead-lettered, {} lease(s) lost",
        summary.delivered, summary.retried, summary.dead_lettered, summary.lease_lost
    );
    Ok(())
}

async fn cmd_enqueue(
    db: &Db,
    url: String,
    payload: String,
    headers: Vec<(String, String)>,
    id: Option<String>,
) -> anyhow::Result<()> {
    let destination = headers
        .into_iter()
        .fold(Destination::new(url), |dest, (name, value)| {
            dest.header(name, value)
        });

    let mut new = NewWorkItem::new(destination, payload.into_bytes());
    if let Some(id) = id {
        new = new.id(id);
    }

    let id = db.enqueue(new).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_show(db: &Db, id: String, json: bool) -> anyhow::Result<()> {
    let Some(item) = db.get(&WorkId::from(id.as_str())).await? else {
        anyhow::bail!("no work item with id '{id}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    let state = if item.is_dead_lettered() {
        "dead-lettered"
    } else if item.lease_token.is_some() && item.next_visible_at > chrono::Utc::now() {
        "leased"
    } else {
        "queued"
    };

    println!("ID:           {}", item.id);
    println!("State:        {state}");
    println!("Destination:  {}", item.destination.url);
    for (name, value) in &item.destination.headers {
        println!("Header:       {name}: {value}");
    }
    println!("Attempts:     {}", item.attempts);
    println!("Visible At:   {}", item.next_visible_at);
    println!("Last Error:   {}", item.last_error.as_deref().unwrap_or("-"));
    println!("Created:      {}", item.created_at);
    println!("Updated:      {}", item.updated_at);
    if let Some(at) = item.dead_lettered_at {
        println!("Dead-letter:  {at}");
    }
    println!("Payload:      {}", String::from_utf8_lossy(&item.payload));

    Ok(())
}

async fn cmd_dead_letter_list(db: &Db, limit: usize) -> anyhow::Result<()> {
    let items = db.dead_letters(limit).await?;

    if items.is_empty() {
        println!("No dead-lettered items.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<8}  {:<16}  LAST ERROR",
        "ID", "ATTEMPTS", "DEAD-LETTERED"
    );
    println!("{}", "-".repeat(100));

    for item in &items {
        let at = item
            .dead_lettered_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<36}  {:<8}  {:<16}  {}",
            item.id.as_str(),
            item.attempts,
            at,
            item.last_error.as_deref().unwrap_or("-")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
