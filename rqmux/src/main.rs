//! CLI entry point for rqmux

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use futures::future::join_all;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rqmux::{
    ConnectionFactory, ErrorClassifier, MuxConfig, MySqlDriver, Payload, QueryDispatcher,
    QueryMode, QueryResult, ResultSet, TokioScheduler,
};

#[derive(Parser)]
#[command(name = "rqmux")]
#[command(about = "Run SQL statements concurrently, one connection per statement")]
#[command(version)]
struct Cli {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Database port (overrides config)
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Database user (overrides config)
    #[arg(short, long)]
    user: Option<String>,

    /// Default database (overrides config)
    #[arg(short, long)]
    database: Option<String>,

    /// How to post-process each statement's result
    #[arg(short, long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    /// Statements to run, each on its own connection
    #[arg(required = true)]
    sql: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Normal,
    Exec,
    Row,
    Value,
}

impl From<Mode> for QueryMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => QueryMode::Normal,
            Mode::Exec => QueryMode::ExecOnly,
            Mode::Row => QueryMode::FirstRowOnly,
            Mode::Value => QueryMode::FirstValueOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first (before logging, so we can use config.log_level)
    let mut config = MuxConfig::load(cli.config.as_deref())?;

    // Priority: RUST_LOG env var > config.log_level > default (debug for dev, info for release)
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let log_level = config.log_level.as_deref().unwrap_or(default_level);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    // Apply CLI overrides
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(user) = cli.user {
        config.connection.user = user;
    }
    if let Some(database) = cli.database {
        config.connection.database = Some(database);
    }
    if let Ok(password) = std::env::var("MYSQL_PWD") {
        config.connection.password = password;
    }

    config.validate()?;
    config.apply_classifications(ErrorClassifier::global());

    let scheduler = TokioScheduler::current()?;
    let factory = ConnectionFactory::with_defaults(
        MySqlDriver::new(),
        scheduler.clone(),
        config.connection.clone(),
        config.retry,
    );

    let started = Instant::now();
    info!(
        "Opening {} connection(s) to {}:{}",
        cli.sql.len(),
        config.connection.bare_host(),
        config.connection.port
    );
    let conns = join_all(cli.sql.iter().map(|_| {
        factory.connect_with_observer(None, None, |progress| {
            if let Some(error) = progress.suppressed_error() {
                warn!(
                    "attempt {} failed after {:?}: {}",
                    progress.retry_count(),
                    progress.elapsed(),
                    error
                );
            }
        })
    }))
    .await;

    if let Some(failed) = conns.iter().find(|c| !c.is_connected()) {
        let reason = failed
            .connect_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string());
        bail!("Could not connect: {}", reason);
    }

    let dispatcher = QueryDispatcher::builder(MySqlDriver::new(), scheduler)
        .settings(&config.dispatcher)
        .build();
    let mode = QueryMode::from(cli.mode);
    let results = join_all(
        conns
            .iter()
            .zip(&cli.sql)
            .map(|(conn, sql)| dispatcher.submit(conn, sql.as_str(), mode)),
    )
    .await;

    let mut failures = 0;
    for (sql, result) in cli.sql.iter().zip(results) {
        println!("> {}", sql);
        match result {
            Ok(result) => print_result(result),
            Err(e) => {
                failures += 1;
                println!("  error: {}", e);
            }
        }
    }
    println!(
        "{} statement(s) in {:.3}s",
        cli.sql.len(),
        started.elapsed().as_secs_f64()
    );

    for conn in &conns {
        if let Err(e) = conn.disconnect().await {
            warn!("disconnect failed: {}", e);
        }
    }

    if failures > 0 {
        bail!("{} statement(s) failed", failures);
    }
    Ok(())
}

fn print_result(mut result: QueryResult<rqmux::BufferedResultSet>) {
    if let Some(affected) = result.rows_affected() {
        println!("  {} row(s) affected", affected.rows_affected);
    }
    match result.value_mut() {
        Payload::None => {}
        Payload::Value(value) => println!("  {}", value),
        Payload::Row(row) => {
            let cells: Vec<String> = row.values().iter().map(|v| v.to_string()).collect();
            println!("  {}", cells.join("\t"));
        }
        Payload::ResultSet(rows) => {
            println!("  {}", rows.columns().join("\t"));
            while let Some(row) = rows.fetch_row() {
                let cells: Vec<String> = row.values().iter().map(|v| v.to_string()).collect();
                println!("  {}", cells.join("\t"));
            }
        }
    }
    result.release();
}
