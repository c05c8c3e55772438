//! Writer session state machine.
//!
//! One session per daemon process:
//!
//! ```text
//! Idle --Start--> Running --Stop--> Stopped
//!   \               |                  |
//!    `----Exit------+------Exit--------+--> Terminated
//! ```
//!
//! `InvalidPath` on Start and a failed finalization also end in `Terminated`.
//! Every call returns an [`Ack`] or a [`WriterError`], so senders never have
//! to guess how long an effect takes.

use filewriter_protocol::{parse_timestamp, Command, EventRecord, StartCommand, StopCommand};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::accumulator::{Accumulator, EntryMetadata};
use crate::error::{Result, WriterError};
use crate::finalizer::{compute_duration, finalize, FinalizeReport};
use crate::nexus_file::OutputFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Pending features that trigger an incremental flush while running.
    pub flush_every: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { flush_every: 1000 }
    }
}

/// Completion signal returned for every handled message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum Ack {
    Started {
        file_path: PathBuf,
        job_id: Option<String>,
    },
    EventAccepted {
        features: usize,
    },
    Stopped(FinalizeReport),
    Exited {
        aborted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub job_id: Option<String>,
    pub file_path: Option<PathBuf>,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub features_flushed: usize,
    pub last_error: Option<String>,
}

struct ActiveFile {
    file: OutputFile,
    accumulator: Accumulator,
}

pub struct WriterSession {
    state: SessionState,
    options: SessionOptions,
    active: Option<ActiveFile>,
    job_id: Option<String>,
    file_path: Option<PathBuf>,
    events_accepted: u64,
    events_rejected: u64,
    features_flushed: usize,
    last_error: Option<String>,
}

impl WriterSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            state: SessionState::Idle,
            options,
            active: None,
            job_id: None,
            file_path: None,
            events_accepted: 0,
            events_rejected: 0,
            features_flushed: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle_command(&mut self, command: Command) -> Result<Ack> {
        let kind = command.kind();
        let result = match command {
            Command::Start(start) => self.start(start),
            Command::Stop(stop) => self.stop(stop),
            Command::Exit => self.exit(),
        };
        if let Err(err) = &result {
            if err.is_terminal() {
                error!(command = ?kind, code = err.code(), error = %err, "Command failed");
            } else {
                warn!(command = ?kind, code = err.code(), error = %err, "Command rejected");
            }
            self.last_error = Some(err.to_string());
        }
        result
    }

    pub fn start(&mut self, command: StartCommand) -> Result<Ack> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Terminated => return Err(WriterError::SessionClosed),
            state => return Err(WriterError::AlreadyRunning { state }),
        }

        if parse_timestamp(&command.start_time).is_none() {
            return Err(WriterError::MalformedMessage(format!(
                "start_time {} is not ISO-8601",
                command.start_time
            )));
        }

        let metadata = EntryMetadata {
            job_id: command.job_id,
            title: command.title,
            user_affiliation: command.user_affiliation,
            start_time: command.start_time,
            use_swmr: command.use_swmr,
        };
        let path = PathBuf::from(&command.file_path);
        self.file_path = Some(path.clone());
        self.job_id = metadata.job_id.clone();

        let file = match OutputFile::create(&path, &metadata) {
            Ok(file) => file,
            Err(reason) => {
                self.state = SessionState::Terminated;
                return Err(WriterError::InvalidPath {
                    path: command.file_path,
                    reason,
                });
            }
        };

        info!(
            file_path = %path.display(),
            job_id = ?metadata.job_id,
            start_time = %metadata.start_time,
            use_swmr = metadata.use_swmr,
            "Writer session started"
        );
        self.active = Some(ActiveFile {
            file,
            accumulator: Accumulator::new(metadata),
        });
        self.state = SessionState::Running;

        Ok(Ack::Started {
            file_path: path,
            job_id: self.job_id.clone(),
        })
    }

    pub fn record_event(&mut self, record: EventRecord) -> Result<Ack> {
        let flush_every = self.options.flush_every.max(1);
        let active = match (self.state, self.active.as_mut()) {
            (SessionState::Running, Some(active)) => active,
            (SessionState::Terminated, _) => {
                self.events_rejected += 1;
                return Err(WriterError::SessionClosed);
            }
            (state, _) => {
                self.events_rejected += 1;
                return Err(WriterError::NotRunning { state });
            }
        };

        active
            .accumulator
            .append(record.feature_value, record.timestamp, record.source_name);
        self.events_accepted += 1;

        if active.accumulator.pending().len() >= flush_every {
            let pending = active.accumulator.pending();
            let count = pending.len();
            match active.file.append_features(pending) {
                Ok(()) => {
                    active.accumulator.mark_flushed(count);
                    self.features_flushed = active.accumulator.flushed();
                    debug!(count, total = self.features_flushed, "Flushed features");
                }
                Err(err) => {
                    // Features stay pending and are retried by the next flush or by Stop.
                    warn!(error = %err, pending = count, "Incremental flush failed");
                }
            }
        }

        Ok(Ack::EventAccepted {
            features: active.accumulator.len(),
        })
    }

    pub fn stop(&mut self, command: StopCommand) -> Result<Ack> {
        match self.state {
            SessionState::Running => {}
            SessionState::Terminated => return Err(WriterError::SessionClosed),
            state => return Err(WriterError::NotRunning { state }),
        }

        if let Some(requested) = &command.job_id {
            if self.job_id.as_ref() != Some(requested) {
                return Err(WriterError::JobMismatch {
                    requested: requested.clone(),
                    running: self.job_id.clone().unwrap_or_else(|| "none".to_string()),
                });
            }
        }

        let start_time = match self.active.as_ref() {
            Some(active) => active.accumulator.metadata().start_time.clone(),
            None => return Err(WriterError::NotRunning { state: self.state }),
        };
        // A Stop stamped before its Start still seals, with a negative duration.
        if let Err(details) = compute_duration(&start_time, &command.end_time) {
            return Err(WriterError::MalformedMessage(details));
        }

        let Some(mut active) = self.active.take() else {
            return Err(WriterError::NotRunning { state: self.state });
        };
        match finalize(&mut active.file, active.accumulator.snapshot(), &command.end_time) {
            Ok(report) => {
                self.state = SessionState::Stopped;
                self.features_flushed = report.features_written;
                info!(
                    file_path = %report.file_path.display(),
                    duration = report.duration,
                    features = report.features_written,
                    "Output file sealed"
                );
                Ok(Ack::Stopped(report))
            }
            Err(details) => {
                let path = active.file.path().display().to_string();
                active.file.discard();
                self.state = SessionState::Terminated;
                Err(WriterError::Finalization { path, details })
            }
        }
    }

    pub fn exit(&mut self) -> Result<Ack> {
        if self.state == SessionState::Terminated {
            return Err(WriterError::SessionClosed);
        }

        let aborted = match self.active.take() {
            Some(active) => {
                warn!(
                    file_path = %active.file.path().display(),
                    buffered = active.accumulator.len(),
                    "Exit while running; discarding unsealed output file"
                );
                active.file.discard();
                true
            }
            None => false,
        };
        self.state = SessionState::Terminated;
        info!(aborted, "Writer session terminated");
        Ok(Ack::Exited { aborted })
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            job_id: self.job_id.clone(),
            file_path: self.file_path.clone(),
            events_accepted: self.events_accepted,
            events_rejected: self.events_rejected,
            features_flushed: self.features_flushed,
            last_error: self.last_error.clone(),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    #[cfg(test)]
    fn active_file(&self) -> Option<&OutputFile> {
        self.active.as_ref().map(|active| &active.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexus_file::read_entry;

    const FEATURE_A: u64 = 10_138_143_369_737_381_149;
    const FEATURE_B: u64 = 17_055_242_037_422_131_565;

    fn start_command(path: &Path) -> StartCommand {
        StartCommand {
            job_id: None,
            file_path: path.to_string_lossy().to_string(),
            title: "Blend 1.9_SANS".to_string(),
            user_affiliation: "ISIS, STFC".to_string(),
            start_time: "2016-04-12T02:58:52".to_string(),
            use_swmr: true,
        }
    }

    fn stop_command(end_time: &str) -> StopCommand {
        StopCommand {
            job_id: None,
            end_time: end_time.to_string(),
        }
    }

    fn event(value: u64) -> EventRecord {
        EventRecord::new("2016-04-12T03:00:00", value)
    }

    #[test]
    fn full_lifecycle_writes_sealed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("output_file.nxs");
        let mut session = WriterSession::new(SessionOptions::default());

        session
            .handle_command(Command::Start(start_command(&path)))
            .expect("start");
        assert_eq!(session.state(), SessionState::Running);
        session.record_event(event(FEATURE_A)).expect("event a");
        session.record_event(event(FEATURE_B)).expect("event b");

        let ack = session
            .handle_command(Command::Stop(stop_command("2016-04-12T03:29:11")))
            .expect("stop");
        match ack {
            Ack::Stopped(report) => {
                assert_eq!(report.duration, 1819.0);
                assert_eq!(report.features_written, 2);
            }
            other => panic!("unexpected ack: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Stopped);

        assert_eq!(
            session.handle_command(Command::Exit),
            Ok(Ack::Exited { aborted: false })
        );
        assert_eq!(session.state(), SessionState::Terminated);

        let entry = read_entry(&path).expect("read entry");
        assert!(!entry.swmr_mode);
        assert_eq!(entry.start_time.as_deref(), Some("2016-04-12T02:58:52"));
        assert_eq!(entry.end_time.as_deref(), Some("2016-04-12T03:29:11"));
        assert_eq!(entry.duration, Some(1819.0));
        assert_eq!(entry.features, vec![FEATURE_A, FEATURE_B]);
        assert_eq!(entry.title.as_deref(), Some("Blend 1.9_SANS"));
        assert_eq!(entry.user_affiliation.as_deref(), Some("ISIS, STFC"));
    }

    #[test]
    fn stop_while_idle_fails_without_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut session = WriterSession::new(SessionOptions::default());

        let err = session
            .handle_command(Command::Stop(stop_command("2016-04-12T03:29:11")))
            .unwrap_err();
        assert_eq!(
            err,
            WriterError::NotRunning {
                state: SessionState::Idle
            }
        );
        assert_eq!(session.state(), SessionState::Idle);
        let entries = std::fs::read_dir(temp_dir.path()).expect("read dir").count();
        assert_eq!(entries, 0);
    }

    #[test]
    fn second_start_is_rejected_and_keeps_accumulation() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("first.nxs");
        let other = temp_dir.path().join("second.nxs");
        let mut session = WriterSession::new(SessionOptions::default());

        session.start(start_command(&path)).expect("start");
        session.record_event(event(1)).expect("event");

        let err = session.start(start_command(&other)).unwrap_err();
        assert_eq!(
            err,
            WriterError::AlreadyRunning {
                state: SessionState::Running
            }
        );
        assert!(!other.exists());
        assert_eq!(session.state(), SessionState::Running);

        session.record_event(event(2)).expect("event after reject");
        session
            .stop(stop_command("2016-04-12T03:29:11"))
            .expect("stop");
        assert_eq!(read_entry(&path).expect("read").features, vec![1, 2]);
    }

    #[test]
    fn start_after_stop_is_not_a_restart() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("a.nxs");
        let mut session = WriterSession::new(SessionOptions::default());
        session.start(start_command(&path)).expect("start");
        session.record_event(event(FEATURE_A)).expect("event");
        session
            .stop(stop_command("2016-04-12T03:29:11"))
            .expect("stop");
        let sealed = read_entry(&path).expect("read sealed");

        assert_eq!(
            session.handle_command(Command::Stop(stop_command("2016-04-12T04:00:00"))),
            Err(WriterError::NotRunning {
                state: SessionState::Stopped
            })
        );
        assert_eq!(
            session.record_event(event(FEATURE_B)),
            Err(WriterError::NotRunning {
                state: SessionState::Stopped
            })
        );
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(read_entry(&path).expect("read again"), sealed);

        let err = session
            .start(start_command(&temp_dir.path().join("b.nxs")))
            .unwrap_err();
        assert_eq!(
            err,
            WriterError::AlreadyRunning {
                state: SessionState::Stopped
            }
        );
    }

    #[test]
    fn invalid_path_terminates_session() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("no-such-dir").join("out.nxs");
        let mut session = WriterSession::new(SessionOptions::default());

        let err = session.start(start_command(&path)).unwrap_err();
        assert_eq!(err.code(), "invalid_path");
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(
            session.start(start_command(&temp_dir.path().join("ok.nxs"))),
            Err(WriterError::SessionClosed)
        );
        assert_eq!(session.exit(), Err(WriterError::SessionClosed));
    }

    #[test]
    fn events_outside_running_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut session = WriterSession::new(SessionOptions::default());

        assert_eq!(
            session.record_event(event(1)),
            Err(WriterError::NotRunning {
                state: SessionState::Idle
            })
        );
        assert_eq!(session.state(), SessionState::Idle);

        session
            .start(start_command(&temp_dir.path().join("x.nxs")))
            .expect("start");
        session.exit().expect("exit");
        assert_eq!(session.record_event(event(2)), Err(WriterError::SessionClosed));
        assert_eq!(session.status().events_rejected, 2);
        assert_eq!(session.status().events_accepted, 0);
    }

    #[test]
    fn exit_while_running_discards_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("aborted.nxs");
        let mut session = WriterSession::new(SessionOptions::default());

        session.start(start_command(&path)).expect("start");
        session.record_event(event(3)).expect("event");
        assert!(path.exists());

        assert_eq!(session.exit(), Ok(Ack::Exited { aborted: true }));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!path.exists());
    }

    #[test]
    fn stop_checks_job_id() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("job.nxs");
        let mut session = WriterSession::new(SessionOptions::default());
        let mut start = start_command(&path);
        start.job_id = Some("job-1".to_string());
        session.start(start).expect("start");

        let mismatch = session
            .stop(StopCommand {
                job_id: Some("job-2".to_string()),
                end_time: "2016-04-12T03:29:11".to_string(),
            })
            .unwrap_err();
        assert_eq!(mismatch.code(), "job_mismatch");
        assert_eq!(session.state(), SessionState::Running);

        let ack = session
            .stop(StopCommand {
                job_id: Some("job-1".to_string()),
                end_time: "2016-04-12T02:58:52".to_string(),
            })
            .expect("stop");
        assert!(matches!(ack, Ack::Stopped(ref report) if report.duration == 0.0));
    }

    #[test]
    fn stop_before_start_seals_negative_duration() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("reversed.nxs");
        let mut session = WriterSession::new(SessionOptions::default());
        let mut start = start_command(&path);
        start.start_time = "2016-04-12T03:29:11".to_string();
        session.start(start).expect("start");
        session.record_event(event(FEATURE_A)).expect("event");

        let ack = session
            .handle_command(Command::Stop(stop_command("2016-04-12T02:58:52")))
            .expect("stop");
        assert!(matches!(ack, Ack::Stopped(ref report) if report.duration == -1819.0));
        assert_eq!(session.state(), SessionState::Stopped);

        let entry = read_entry(&path).expect("read sealed");
        assert!(!entry.swmr_mode);
        assert_eq!(entry.duration, Some(-1819.0));
        assert_eq!(entry.features, vec![FEATURE_A]);
    }

    #[test]
    fn stop_rejects_unparseable_end_time() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut session = WriterSession::new(SessionOptions::default());
        session
            .start(start_command(&temp_dir.path().join("t.nxs")))
            .expect("start");

        let err = session.stop(stop_command("teatime")).unwrap_err();
        assert_eq!(err.code(), "malformed_message");
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn start_without_swmr_never_sets_indicator() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("plain.nxs");
        let mut session = WriterSession::new(SessionOptions { flush_every: 1 });
        let mut start = start_command(&path);
        start.use_swmr = false;
        session.start(start).expect("start");
        session.record_event(event(FEATURE_B)).expect("event");

        let mid = read_entry(&path).expect("read mid-run");
        assert!(!mid.swmr_mode);
        assert_eq!(mid.features, vec![FEATURE_B]);

        session
            .stop(stop_command("2016-04-12T03:29:11"))
            .expect("stop");
        let entry = read_entry(&path).expect("read sealed");
        assert!(!entry.swmr_mode);
        assert_eq!(entry.duration, Some(1819.0));
    }

    #[test]
    fn event_source_names_are_stored() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("sources.nxs");
        let mut session = WriterSession::new(SessionOptions::default());
        session.start(start_command(&path)).expect("start");

        let mut tagged = event(1);
        tagged.source_name = Some("detector_1".to_string());
        session.record_event(tagged).expect("tagged event");
        session.record_event(event(2)).expect("untagged event");
        session
            .stop(stop_command("2016-04-12T03:29:11"))
            .expect("stop");

        let entry = read_entry(&path).expect("read sealed");
        assert_eq!(entry.features, vec![1, 2]);
        assert_eq!(
            entry.feature_sources,
            vec![Some("detector_1".to_string()), None]
        );
    }

    #[test]
    fn flushes_incrementally_while_running() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("flush.nxs");
        let mut session = WriterSession::new(SessionOptions { flush_every: 2 });

        session.start(start_command(&path)).expect("start");
        for value in [7u64, 8, 9] {
            session.record_event(event(value)).expect("event");
        }

        let mid = read_entry(&path).expect("read mid-run");
        assert!(mid.swmr_mode);
        assert_eq!(mid.features, vec![7, 8]);
        assert_eq!(session.status().features_flushed, 2);

        session
            .stop(stop_command("2016-04-12T03:29:11"))
            .expect("stop");
        let entry = read_entry(&path).expect("read sealed");
        assert!(!entry.swmr_mode);
        assert_eq!(entry.features, vec![7, 8, 9]);
        assert_eq!(session.status().features_flushed, 3);
    }

    #[test]
    fn finalization_failure_terminates_and_removes_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("broken.nxs");
        let mut session = WriterSession::new(SessionOptions::default());

        session.start(start_command(&path)).expect("start");
        session.record_event(event(1)).expect("event");
        session
            .active_file()
            .expect("active file")
            .break_schema_for_test();

        let err = session
            .handle_command(Command::Stop(stop_command("2016-04-12T03:29:11")))
            .unwrap_err();
        assert_eq!(err.code(), "finalization_error");
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!path.exists());
        assert!(session.status().last_error.is_some());
        assert_eq!(
            session.handle_command(Command::Exit),
            Err(WriterError::SessionClosed)
        );
    }
}
