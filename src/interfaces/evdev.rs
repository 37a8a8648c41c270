//! Input event sources and the bell output of a line
//!
//! A reader task turns an evdev node into [`SourceMessage`]s on a per-line
//! queue and pokes the monitor. Console injection uses the same sender, so the
//! monitor cannot tell a synthetic key press from a real one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocols::input::{InputEvent, EVENT_SIZE};
use crate::{Error, Result};

/// What an event source delivers to its line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMessage {
    Event(InputEvent),
    /// The source broke and will not deliver anything else
    Failed(String),
}

/// Producer side of a line's event queue
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SourceMessage>,
    wake: Arc<Notify>,
}

impl EventSender {
    /// Queue an event and wake the monitor. Returns false once the line is gone.
    pub fn send(&self, event: InputEvent) -> bool {
        let sent = self.tx.send(SourceMessage::Event(event)).is_ok();
        self.wake.notify_one();
        sent
    }

    pub fn fail<S: Into<String>>(&self, reason: S) {
        let _ = self.tx.send(SourceMessage::Failed(reason.into()));
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, drained by whoever holds the line
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<SourceMessage>,
}

impl EventQueue {
    pub fn try_next(&mut self) -> Option<SourceMessage> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting events, already queued ones can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub fn event_channel(wake: Arc<Notify>) -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx, wake }, EventQueue { rx })
}

/// Forward records read from an evdev node until cancelled or the node fails
pub fn spawn_reader(path: PathBuf, sender: EventSender, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                sender.fail(format!("Failed to open event device {}: {}", path.display(), e));
                return;
            }
        };
        info!("Event device {} opened", path.display());

        let mut buffer = BytesMut::with_capacity(EVENT_SIZE * 64);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Event reader for {} cancelled", path.display());
                    break;
                }
                read = file.read_buf(&mut buffer) => match read {
                    Ok(0) => {
                        sender.fail(format!("Event device {} closed", path.display()));
                        break;
                    }
                    Ok(_) => {
                        while buffer.len() >= EVENT_SIZE {
                            let mut record = buffer.split_to(EVENT_SIZE);
                            match InputEvent::decode(&mut record) {
                                Ok(event) => {
                                    if !sender.send(event) {
                                        return;
                                    }
                                }
                                Err(e) => warn!("Dropping input record from {}: {}", path.display(), e),
                            }
                        }
                        buffer.reserve(EVENT_SIZE * 64);
                    }
                    Err(e) => {
                        sender.fail(format!("Failed to read event device {}: {}", path.display(), e));
                        break;
                    }
                }
            }
        }
    })
}

/// Where bell events for the ringer go
pub trait EventSink: Send {
    fn emit(&mut self, event: InputEvent) -> std::io::Result<()>;
}

/// evdev node accepting `EV_SND` writes
pub struct EvdevSink {
    file: File,
}

impl EvdevSink {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| Error::input(format!("Failed to open event output {}: {}", path, e)))?;
        info!("Event output {} opened", path);
        Ok(Self { file })
    }
}

impl EventSink for EvdevSink {
    fn emit(&mut self, event: InputEvent) -> std::io::Result<()> {
        self.file.write_all(&event.encode())
    }
}

/// Keeps every emitted event. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<InputEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InputEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: InputEvent) -> std::io::Result<()> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}
