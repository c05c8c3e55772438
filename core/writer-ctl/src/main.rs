//! filewriter-ctl: sends commands and events to a running filewriter daemon.
//!
//! ## Subcommands
//!
//! - `start`, `stop`, `exit`: control commands, each waits for the daemon's acknowledgement
//! - `event`: publish a single feature value
//! - `send`: publish a command read from a JSON file
//! - `status`, `health`: inspect the daemon

mod daemon_client;
mod logging;

use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use filewriter_protocol::{CommandEnvelope, EventRecord, Method, Request, Response};
use fs_err as fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "filewriter-ctl")]
#[command(about = "Control a filewriter daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to FILEWRITER_SOCKET, then ~/.filewriter/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start writing a new output file
    Start {
        /// Output file to create
        #[arg(long, value_name = "PATH")]
        file: PathBuf,

        #[arg(long)]
        title: String,

        #[arg(long)]
        affiliation: String,

        /// ISO-8601 start time (defaults to now)
        #[arg(long)]
        start_time: Option<String>,

        #[arg(long)]
        job_id: Option<String>,

        /// Write without the single-writer indicator
        #[arg(long)]
        no_swmr: bool,
    },

    /// Stop writing and seal the output file
    Stop {
        /// ISO-8601 end time (defaults to now)
        #[arg(long)]
        end_time: Option<String>,

        #[arg(long)]
        job_id: Option<String>,
    },

    /// Terminate the writer session and the daemon
    Exit,

    /// Publish one feature value
    Event {
        #[arg(value_name = "VALUE")]
        value: u64,

        /// ISO-8601 timestamp (defaults to now)
        #[arg(long)]
        timestamp: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },

    /// Publish a command stored as JSON
    Send {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show the writer session status
    Status,

    /// Check that the daemon is alive
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let socket = match daemon_client::socket_path(cli.socket) {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(error = %err, "Failed to resolve daemon socket");
            std::process::exit(2);
        }
    };

    let response = match build_request(cli.command)
        .and_then(|request| daemon_client::send_request(&socket, &request))
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, socket = %socket.display(), "filewriter-ctl failed");
            std::process::exit(2);
        }
    };

    if let Err(err) = print_response(&response) {
        tracing::error!(error = %err, "Failed to print response");
    }
    if !response.ok {
        if let Some(error) = &response.error {
            tracing::warn!(code = %error.code, message = %error.message, "Daemon rejected request");
        }
        std::process::exit(1);
    }
}

fn build_request(command: Commands) -> Result<Request, String> {
    match command {
        Commands::Start {
            file,
            title,
            affiliation,
            start_time,
            job_id,
            no_swmr,
        } => {
            let mut envelope = CommandEnvelope::start(
                file.to_string_lossy(),
                title,
                affiliation,
                start_time.unwrap_or_else(now),
            );
            envelope.job_id = job_id;
            if no_swmr {
                envelope = envelope.with_swmr(false);
            }
            daemon_client::command_request(&envelope)
        }
        Commands::Stop { end_time, job_id } => {
            let mut envelope = CommandEnvelope::stop(end_time.unwrap_or_else(now));
            envelope.job_id = job_id;
            daemon_client::command_request(&envelope)
        }
        Commands::Exit => daemon_client::command_request(&CommandEnvelope::exit()),
        Commands::Event {
            value,
            timestamp,
            source,
        } => {
            let mut record = EventRecord::new(timestamp.unwrap_or_else(now), value);
            record.source_name = source;
            daemon_client::event_request(&record)
        }
        Commands::Send { file } => daemon_client::command_request(&load_command_file(&file)?),
        Commands::Status => Ok(Request::new(Method::GetStatus, None, None)),
        Commands::Health => Ok(Request::new(
            Method::GetHealth,
            Some("health-check".to_string()),
            None,
        )),
    }
}

/// Reads and checks a command file before anything goes on the wire.
fn load_command_file(path: &Path) -> Result<CommandEnvelope, String> {
    let contents = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let envelope: CommandEnvelope = serde_json::from_str(&contents)
        .map_err(|err| format!("{} is not a valid command: {}", path.display(), err))?;
    envelope
        .validate()
        .map_err(|err| format!("{}: {}", path.display(), err.message))?;
    Ok(envelope)
}

fn print_response(response: &Response) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(response).map_err(|err| err.to_string())?;
    println!("{}", rendered);
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
