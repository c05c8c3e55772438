//! filewriter daemon entrypoint.
//!
//! A small, single-writer service: a socket listener with strict request
//! validation, a writer thread that owns the one writer session of this
//! process, and SQLite-backed output files sealed on Stop.

use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use filewriter_protocol::{
    parse_command, parse_event, Command, ErrorInfo, Method, Request, Response,
    ERROR_MALFORMED_MESSAGE, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod accumulator;
mod config;
mod error;
mod finalizer;
mod nexus_file;
mod session;
mod writer;

use session::WriterSession;
use writer::{spawn_writer, WriterHandle};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "filewriter-daemon")]
#[command(about = "Command-driven streaming file writer")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Socket to listen on (overrides config and FILEWRITER_SOCKET)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

struct Server {
    writer: WriterHandle,
    socket_path: PathBuf,
    shutdown: AtomicBool,
    malformed_messages: AtomicU64,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match config::load_config(cli.config) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            config::WriterConfig::default()
        }
    };

    let socket_path = match config::resolve_socket_path(cli.socket, &config) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let session = WriterSession::new(config.session_options());
    let (writer, writer_thread) = match spawn_writer(session, config.ingest.queue_capacity) {
        Ok(spawned) => spawned,
        Err(err) => {
            error!(error = %err, "Failed to start writer session");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        queue_capacity = config.ingest.queue_capacity,
        flush_every = config.storage.flush_every,
        "filewriter daemon started"
    );

    let server = Arc::new(Server {
        writer,
        socket_path: socket_path.clone(),
        shutdown: AtomicBool::new(false),
        malformed_messages: AtomicU64::new(0),
    });

    for stream in listener.incoming() {
        if server.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let server = Arc::clone(&server);
                thread::spawn(move || handle_connection(stream, server));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    drop(listener);
    if let Err(err) = fs::remove_file(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket");
    }

    match writer_thread.join() {
        Ok(session) => info!(
            state = %session.state(),
            file_path = ?session.file_path(),
            "filewriter daemon stopped"
        ),
        Err(_) => error!("Writer thread panicked"),
    }
}

fn init_logging() {
    let debug_enabled = env::var("FILEWRITER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, server: Arc<Server>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let (response, exit_requested) = handle_request(request, &server);
    let _ = write_response(&mut stream, response);

    if exit_requested {
        begin_shutdown(&server);
    }
}

/// Stops the accept loop; the self-connect wakes a blocked `accept`.
fn begin_shutdown(server: &Server) {
    server.shutdown.store(true, Ordering::SeqCst);
    let _ = UnixStream::connect(&server.socket_path);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

/// Returns the response and whether the daemon should shut down after it.
fn handle_request(request: Request, server: &Server) -> (Response, bool) {
    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
        return (response, false);
    }

    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "malformed_messages": server.malformed_messages.load(Ordering::Relaxed),
            });
            (Response::ok(request.id, data), false)
        }
        Method::GetStatus => {
            let response = match server.writer.status() {
                Ok(status) => match serde_json::to_value(status) {
                    Ok(value) => Response::ok(request.id, value),
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize status: {}", err),
                    ),
                },
                Err(err) => Response::error_with_info(request.id, err.into()),
            };
            (response, false)
        }
        Method::Command => handle_command(request, server),
        Method::Event => (handle_event(request, server), false),
    }
}

fn handle_command(request: Request, server: &Server) -> (Response, bool) {
    let params = match request.params {
        Some(params) => params,
        None => {
            let response = reject_malformed(
                request.id,
                server,
                ErrorInfo::new(ERROR_MALFORMED_MESSAGE, "command payload is required"),
            );
            return (response, false);
        }
    };

    let command = match parse_command(params) {
        Ok(command) => command,
        Err(err) => return (reject_malformed(request.id, server, err), false),
    };

    let is_exit = matches!(command, Command::Exit);
    info!(command = ?command.kind(), id = ?request.id, "Received command");

    let response = match server.writer.submit_command(command) {
        Ok(ack) => match serde_json::to_value(&ack) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize acknowledgement: {}", err),
            ),
        },
        Err(err) => Response::error_with_info(request.id, err.into()),
    };
    (response, is_exit)
}

fn handle_event(request: Request, server: &Server) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => {
            return reject_malformed(
                request.id,
                server,
                ErrorInfo::new(ERROR_MALFORMED_MESSAGE, "event payload is required"),
            )
        }
    };

    let record = match parse_event(params) {
        Ok(record) => record,
        Err(err) => return reject_malformed(request.id, server, err),
    };

    tracing::debug!(
        timestamp = %record.timestamp,
        feature_value = record.feature_value,
        source_name = ?record.source_name,
        "Received event"
    );

    match server.writer.enqueue_event(record) {
        Ok(()) => Response::ok(request.id, serde_json::json!({"accepted": true})),
        Err(err) => Response::error_with_info(request.id, err.into()),
    }
}

/// Malformed input is answered and counted; the session never sees it.
fn reject_malformed(id: Option<String>, server: &Server, err: ErrorInfo) -> Response {
    server.malformed_messages.fetch_add(1, Ordering::Relaxed);
    warn!(code = %err.code, message = %err.message, id = ?id, "Dropping malformed message");
    Response::error_with_info(id, err)
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
