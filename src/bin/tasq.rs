//! tasq CLI: run a worker or send a single request against Postgres.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tasq_rs::config::Config;
use tasq_rs::db::Db;
use tasq_rs::telemetry::{TelemetryConfig, init_telemetry};
use tasq_rs::{Caller, CallerOptions, Handlers, RequestOptions, ServeOptions};

#[derive(Parser)]
#[command(name = "tasq", about = "Request/response task dispatch over Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a topic with the built-in diagnostic handlers
    Serve {
        /// Topic to serve
        #[arg(long)]
        topic: String,
        /// Maximum tasks executed in parallel (defaults to TASQ_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Send one request and print its result
    Request {
        /// Topic to send to
        topic: String,
        /// Method to call
        method: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
        /// Timeout in milliseconds (defaults to TASQ_TIMEOUT_MS)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "tasq"))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let result = match cli.command {
        Command::Serve { topic, concurrency } => {
            cmd_serve(&db, &config, topic, concurrency.unwrap_or(config.concurrency)).await
        }
        Command::Request {
            topic,
            method,
            args,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config.request_timeout);
            cmd_request(&db, &config, topic, method, args, timeout).await
        }
    };

    db.close().await;
    result
}

fn diagnostic_handlers() -> Handlers {
    Handlers::new()
        .sync_method("echo", |args| Ok(args.unwrap_or(Value::Null)))
        .method("sleep", |args| async move {
            let ms = args
                .as_ref()
                .and_then(|a| a.get("ms"))
                .and_then(Value::as_u64)
                .unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })
}

async fn cmd_serve(
    db: &Db,
    config: &Config,
    topic: String,
    concurrency: usize,
) -> anyhow::Result<()> {
    let caller = Caller::connect(
        Arc::new(db.clone()),
        CallerOptions {
            namespace: config.namespace.clone(),
        },
    )
    .await?;

    let options = ServeOptions::new(diagnostic_handlers()).concurrency(concurrency);
    let worker = caller.serve(&topic, options).await?;

    println!(
        "Serving topic '{}' (concurrency {}), Ctrl-C to stop.",
        worker.topic(),
        worker.concurrency()
    );
    tokio::signal::ctrl_c().await?;

    caller.destroy().await;
    Ok(())
}

async fn cmd_request(
    db: &Db,
    config: &Config,
    topic: String,
    method: String,
    args: Option<String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let args: Option<Value> = match args {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    let caller = Caller::connect(
        Arc::new(db.clone()),
        CallerOptions {
            namespace: config.namespace.clone(),
        },
    )
    .await?;

    let result = caller
        .request(&topic, &method, args, RequestOptions::timeout(timeout))
        .await;
    caller.destroy().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
