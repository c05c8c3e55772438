//! Client helper for talking to the filewriter daemon.

use filewriter_protocol::{
    CommandEnvelope, EventRecord, Method, Request, Response, MAX_REQUEST_BYTES,
};
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_ENV: &str = "FILEWRITER_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
// Stop waits for finalization, so reads get more slack than writes.
const READ_TIMEOUT_MS: u64 = 30_000;
const WRITE_TIMEOUT_MS: u64 = 600;

pub fn socket_path(cli: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(path) = cli {
        return Ok(path);
    }
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".filewriter").join(SOCKET_NAME))
}

pub fn command_request(command: &CommandEnvelope) -> Result<Request, String> {
    let params = serde_json::to_value(command)
        .map_err(|err| format!("Failed to serialize command: {}", err))?;
    Ok(Request::new(Method::Command, command.job_id.clone(), Some(params)))
}

pub fn event_request(record: &EventRecord) -> Result<Request, String> {
    let params = serde_json::to_value(record)
        .map_err(|err| format!("Failed to serialize event: {}", err))?;
    Ok(Request::new(Method::Event, None, Some(params)))
}

pub fn send_request(socket: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to daemon socket {}: {}", socket.display(), err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    parse_response(&buffer)
}

fn parse_response(buffer: &[u8]) -> Result<Response, String> {
    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer,
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}
