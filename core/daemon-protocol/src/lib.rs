//! Bus message types and validation for filewriter-daemon.
//!
//! This crate is shared by the daemon and its command senders to prevent
//! schema drift. The daemon remains the authority on validation, but senders
//! reuse the same types to construct valid requests.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_JOB_ID_LEN: usize = 128;

pub const ERROR_MALFORMED_MESSAGE: &str = "malformed_message";
pub const ERROR_INVALID_PATH: &str = "invalid_path";
pub const ERROR_ALREADY_RUNNING: &str = "already_running";
pub const ERROR_NOT_RUNNING: &str = "not_running";
pub const ERROR_SESSION_CLOSED: &str = "session_closed";
pub const ERROR_FINALIZATION: &str = "finalization_error";
pub const ERROR_JOB_MISMATCH: &str = "job_mismatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    Command,
    Event,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::new(ERROR_MALFORMED_MESSAGE, message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
    Exit,
}

/// Control command as it travels on the bus.
///
/// Fields are optional on the wire; [`CommandEnvelope::validate`] enforces
/// which ones each command kind requires.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandEnvelope {
    pub cmd: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_affiliation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Start only. Defaults to true: the file is marked single-writer until Stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_swmr: Option<bool>,
}

impl CommandEnvelope {
    fn empty(cmd: CommandKind) -> Self {
        Self {
            cmd,
            job_id: None,
            file_path: None,
            title: None,
            user_affiliation: None,
            start_time: None,
            end_time: None,
            use_swmr: None,
        }
    }

    pub fn start(
        file_path: impl Into<String>,
        title: impl Into<String>,
        user_affiliation: impl Into<String>,
        start_time: impl Into<String>,
    ) -> Self {
        Self {
            file_path: Some(file_path.into()),
            title: Some(title.into()),
            user_affiliation: Some(user_affiliation.into()),
            start_time: Some(start_time.into()),
            ..Self::empty(CommandKind::Start)
        }
    }

    pub fn stop(end_time: impl Into<String>) -> Self {
        Self {
            end_time: Some(end_time.into()),
            ..Self::empty(CommandKind::Stop)
        }
    }

    pub fn exit() -> Self {
        Self::empty(CommandKind::Exit)
    }

    pub fn with_swmr(mut self, use_swmr: bool) -> Self {
        self.use_swmr = Some(use_swmr);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(job_id) = &self.job_id {
            if job_id.trim().is_empty() {
                return Err(ErrorInfo::malformed("job_id must not be blank"));
            }
            if job_id.len() > MAX_JOB_ID_LEN {
                return Err(ErrorInfo::malformed(format!(
                    "job_id must be {} characters or fewer",
                    MAX_JOB_ID_LEN
                )));
            }
        }

        match self.cmd {
            CommandKind::Start => {
                require_string(&self.file_path, "file_path")?;
                require_present(&self.title, "title")?;
                require_present(&self.user_affiliation, "user_affiliation")?;
                require_timestamp(&self.start_time, "start_time")?;
                reject_field(&self.end_time, "end_time", "start")?;
            }
            CommandKind::Stop => {
                require_timestamp(&self.end_time, "end_time")?;
                reject_field(&self.file_path, "file_path", "stop")?;
                reject_field(&self.start_time, "start_time", "stop")?;
                reject_field(&self.use_swmr, "use_swmr", "stop")?;
            }
            CommandKind::Exit => reject_field(&self.use_swmr, "use_swmr", "exit")?,
        }

        Ok(())
    }

    /// Converts a validated envelope into its typed command.
    pub fn into_command(self) -> Result<Command, ErrorInfo> {
        self.validate()?;
        let command = match self.cmd {
            CommandKind::Start => Command::Start(StartCommand {
                job_id: self.job_id,
                file_path: self.file_path.unwrap_or_default(),
                title: self.title.unwrap_or_default(),
                user_affiliation: self.user_affiliation.unwrap_or_default(),
                start_time: self.start_time.unwrap_or_default(),
                use_swmr: self.use_swmr.unwrap_or(true),
            }),
            CommandKind::Stop => Command::Stop(StopCommand {
                job_id: self.job_id,
                end_time: self.end_time.unwrap_or_default(),
            }),
            CommandKind::Exit => Command::Exit,
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub job_id: Option<String>,
    pub file_path: String,
    pub title: String,
    pub user_affiliation: String,
    pub start_time: String,
    pub use_swmr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCommand {
    pub job_id: Option<String>,
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(StartCommand),
    Stop(StopCommand),
    Exit,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Start(_) => CommandKind::Start,
            Command::Stop(_) => CommandKind::Stop,
            Command::Exit => CommandKind::Exit,
        }
    }
}

/// One detector/sensor reading carried on the bus.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventRecord {
    pub timestamp: String,
    pub feature_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

impl EventRecord {
    pub fn new(timestamp: impl Into<String>, feature_value: u64) -> Self {
        Self {
            timestamp: timestamp.into(),
            feature_value,
            source_name: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if parse_timestamp(&self.timestamp).is_none() {
            return Err(ErrorInfo::malformed("timestamp must be ISO-8601"));
        }
        if let Some(source) = &self.source_name {
            if source.trim().is_empty() {
                return Err(ErrorInfo::malformed("source_name must not be blank"));
            }
        }
        Ok(())
    }
}

pub fn parse_command(params: Value) -> Result<Command, ErrorInfo> {
    let envelope: CommandEnvelope = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::malformed(format!("command payload is invalid: {}", err)))?;
    envelope.into_command()
}

pub fn parse_event(params: Value) -> Result<EventRecord, ErrorInfo> {
    let record: EventRecord = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::malformed(format!("event payload is invalid: {}", err)))?;
    record.validate()?;
    Ok(record)
}

/// Parses an ISO-8601 timestamp. Values without a zone are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Seconds since the Unix epoch, including the sub-second part.
pub fn epoch_seconds(value: &DateTime<Utc>) -> f64 {
    value.timestamp() as f64 + f64::from(value.timestamp_subsec_nanos()) / 1_000_000_000.0
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::malformed(format!("{} is required", field)))
}

fn require_present(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(_) => Ok(()),
        None => Err(ErrorInfo::malformed(format!("{} is required", field))),
    }
}

fn require_timestamp(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    require_string(value, field)?;
    match value.as_deref().and_then(parse_timestamp) {
        Some(_) => Ok(()),
        None => Err(ErrorInfo::malformed(format!("{} must be ISO-8601", field))),
    }
}

fn reject_field<T>(value: &Option<T>, field: &str, cmd: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(_) => Err(ErrorInfo::malformed(format!(
            "{} is not allowed on {}",
            field, cmd
        ))),
        None => Ok(()),
    }
}
