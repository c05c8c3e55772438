#![allow(dead_code)]

use filewriter_protocol::{CommandEnvelope, EventRecord, Method, Request, Response};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

pub struct DaemonGuard {
    pub child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl DaemonGuard {
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            sleep(Duration::from_millis(25));
        }
        None
    }
}

pub fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_filewriter-daemon"))
        .arg("--socket")
        .arg(socket_path(home))
        .env("HOME", home)
        .env_remove("FILEWRITER_SOCKET")
        .env_remove("FILEWRITER_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn filewriter-daemon");
    DaemonGuard { child }
}

pub fn socket_path(home: &Path) -> PathBuf {
    home.join(".filewriter").join("daemon.sock")
}

pub fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

pub fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("failed to serialize request");
    stream.write_all(b"\n").expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

pub fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream
        .write_all(payload)
        .expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

pub fn send_command(socket: &Path, command: CommandEnvelope) -> Response {
    send_request(
        socket,
        Request::new(
            Method::Command,
            Some(format!("{:?}", command.cmd)),
            Some(serde_json::to_value(command).expect("serialize command")),
        ),
    )
}

pub fn send_event(socket: &Path, record: EventRecord) -> Response {
    send_request(
        socket,
        Request::new(
            Method::Event,
            None,
            Some(serde_json::to_value(record).expect("serialize event")),
        ),
    )
}

pub fn get_status(socket: &Path) -> serde_json::Value {
    let response = send_request(socket, Request::new(Method::GetStatus, None, None));
    assert!(response.ok, "status response was not ok: {:?}", response.error);
    response.data.expect("status payload")
}

pub fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

/// Reads an output file the way an external tool would.
pub struct OutputReader {
    conn: rusqlite::Connection,
}

impl OutputReader {
    pub fn open(path: &Path) -> Self {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .expect("open output file");
        Self { conn }
    }

    pub fn swmr_mode(&self) -> bool {
        let value: String = self
            .conn
            .query_row(
                "SELECT value FROM file_attributes WHERE name = 'swmr_mode'",
                [],
                |row| row.get(0),
            )
            .expect("read swmr_mode");
        value == "true"
    }

    pub fn text(&self, dataset: &str) -> String {
        self.conn
            .query_row(
                "SELECT text_value FROM datasets WHERE path = ?1",
                [dataset],
                |row| row.get(0),
            )
            .unwrap_or_else(|err| panic!("read {}: {}", dataset, err))
    }

    pub fn real(&self, dataset: &str) -> f64 {
        self.conn
            .query_row(
                "SELECT real_value FROM datasets WHERE path = ?1",
                [dataset],
                |row| row.get(0),
            )
            .unwrap_or_else(|err| panic!("read {}: {}", dataset, err))
    }

    pub fn features(&self) -> Vec<u64> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM features ORDER BY seq ASC")
            .expect("prepare features");
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .expect("query features");
        let features = rows.map(|row| row.expect("feature row") as u64).collect();
        features
    }

    pub fn feature_sources(&self) -> Vec<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source FROM features ORDER BY seq ASC")
            .expect("prepare feature sources");
        let rows = stmt
            .query_map([], |row| row.get::<_, Option<String>>(0))
            .expect("query feature sources");
        let sources = rows.map(|row| row.expect("source row")).collect();
        sources
    }
}
