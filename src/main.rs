//! mqtt-session - operator tooling for the MQTT session core
//!
//! Inspects durable session stores and validates client configuration.

use clap::{Parser, Subcommand};
use mqtt_session::config::ClientConfig;
use mqtt_session::observability::logging::{init_default_logging, init_logging, LogFormat};
use mqtt_session::persistence::file::read_records;
use mqtt_session::persistence::{summarize_record, RecordSummary};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};

/// MQTT session store and configuration tool
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Inspect MQTT session stores and validate client configuration")]
#[command(version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the records in a client's file store directory
    Inspect {
        /// Client store directory
        dir: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    Config {
        /// Configuration file path
        #[arg(env = "MQTT_SESSION_CONFIG")]
        file: PathBuf,

        /// Print the effective configuration
        #[arg(long)]
        print: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };

    let result = match cli.command {
        Commands::Inspect { dir, json } => inspect(&dir, json),
        Commands::Config { file, print } => check_config(&file, print),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn inspect(dir: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(path = %dir.display(), "Inspecting session store");
    let summaries: Vec<RecordSummary> = read_records(dir)?
        .iter()
        .map(|(key, bytes)| summarize_record(key, bytes))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<6} {:>6} {:<10} {:>3} {:>5} {:>8}  NOTE",
        "KEY", "RECORD", "ID", "KIND", "QOS", "DUP", "PAYLOAD"
    );
    for s in &summaries {
        println!(
            "{:<10} {:<6} {:>6} {:<10} {:>3} {:>5} {:>8}  {}",
            s.key,
            s.record.as_deref().unwrap_or("?"),
            s.message_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            s.kind.as_deref().unwrap_or("-"),
            s.qos.map_or_else(|| "-".to_string(), |q| q.to_string()),
            s.dup.map_or_else(|| "-".to_string(), |d| d.to_string()),
            s.payload_len.map_or_else(|| "-".to_string(), |n| n.to_string()),
            s.corrupt.as_deref().map_or_else(String::new, |c| format!("CORRUPT: {c}")),
        );
    }

    let corrupt = summaries.iter().filter(|s| s.corrupt.is_some()).count();
    println!("{} record(s), {} corrupt", summaries.len(), corrupt);
    Ok(())
}

fn check_config(path: &Path, print: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", path.display());
    let config = ClientConfig::load_from_file(path)?;
    println!(
        "Configuration OK: client {} -> {}",
        config.connection.client_id, config.connection.server_uri
    );
    if print {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}
