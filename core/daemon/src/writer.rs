//! Ingest queue between socket connections and the writer session.
//!
//! A single thread owns the [`WriterSession`] and drains a bounded FIFO.
//! Enqueue order is bus order: a Stop is handled only after every event that
//! was enqueued before it. Commands carry a reply channel and block their
//! sender until the session has acted on them.

use filewriter_protocol::{Command, EventRecord};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::WriterError;
use crate::session::{Ack, SessionStatus, WriterSession};

enum Message {
    Command(Command),
    Event(EventRecord),
    Status,
}

enum Reply {
    Ack(Result<Ack, WriterError>),
    Status(SessionStatus),
}

struct Envelope {
    message: Message,
    reply: Option<mpsc::Sender<Reply>>,
}

#[derive(Clone)]
pub struct WriterHandle {
    tx: SyncSender<Envelope>,
}

/// Moves `session` onto its own thread. The thread returns the session once
/// an Exit has been handled or every handle is dropped.
pub fn spawn_writer(
    session: WriterSession,
    capacity: usize,
) -> Result<(WriterHandle, JoinHandle<WriterSession>), String> {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let join = thread::Builder::new()
        .name("filewriter-session".to_string())
        .spawn(move || run(session, rx))
        .map_err(|err| format!("Failed to spawn writer thread: {}", err))?;
    Ok((WriterHandle { tx }, join))
}

fn run(mut session: WriterSession, rx: Receiver<Envelope>) -> WriterSession {
    for envelope in rx.iter() {
        let mut exit = false;
        let reply = match envelope.message {
            Message::Command(command) => {
                exit = matches!(command, Command::Exit);
                Reply::Ack(session.handle_command(command))
            }
            Message::Event(record) => {
                let result = session.record_event(record);
                if let Err(err) = &result {
                    warn!(code = err.code(), error = %err, "Event dropped");
                }
                Reply::Ack(result)
            }
            Message::Status => Reply::Status(session.status()),
        };

        if let Some(reply_tx) = envelope.reply {
            if reply_tx.send(reply).is_err() {
                debug!("Sender went away before reply");
            }
        }
        if exit {
            break;
        }
    }
    session
}

impl WriterHandle {
    /// Handles a command and waits for its acknowledgement.
    pub fn submit_command(&self, command: Command) -> Result<Ack, WriterError> {
        match self.request(Message::Command(command))? {
            Reply::Ack(result) => result,
            Reply::Status(_) => Err(WriterError::SessionClosed),
        }
    }

    /// Queues an event without waiting. Blocks only while the queue is full.
    pub fn enqueue_event(&self, record: EventRecord) -> Result<(), WriterError> {
        self.tx
            .send(Envelope {
                message: Message::Event(record),
                reply: None,
            })
            .map_err(|_| WriterError::SessionClosed)
    }

    pub fn status(&self) -> Result<SessionStatus, WriterError> {
        match self.request(Message::Status)? {
            Reply::Status(status) => Ok(status),
            Reply::Ack(_) => Err(WriterError::SessionClosed),
        }
    }

    fn request(&self, message: Message) -> Result<Reply, WriterError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Envelope {
                message,
                reply: Some(reply_tx),
            })
            .map_err(|_| WriterError::SessionClosed)?;
        reply_rx.recv().map_err(|_| WriterError::SessionClosed)
    }
}
