use std::fmt;

use async_trait::async_trait;
use fleet_core::{Entity, LogEvent, StartParams, StatusSnapshot};
use tokio::sync::mpsc;

use crate::error::{RemoteError, SourceError};

/// Where the registry's entity list comes from.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn load_entities(&self) -> Result<Vec<Entity>, SourceError>;
}

/// The engine that executes the batch. The monitor never does the work
/// itself; it asks, listens, and polls.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    async fn request_start(&self, params: &StartParams) -> Result<(), RemoteError>;

    async fn request_stop(&self) -> Result<(), RemoteError>;

    /// `epoch` is the monitor's run counter at the time the poll was issued.
    /// Engines may ignore it.
    async fn poll_status(&self, epoch: u64) -> Result<StatusSnapshot, RemoteError>;

    /// Registers `sink` for pushed log events until the returned
    /// subscription is dropped.
    fn subscribe_logs(&self, sink: LogSink) -> LogSubscription;
}

/// Push side of the monitor's log queue. Emitting never blocks, so engines
/// can call it from any context.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl LogSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the monitor is gone.
    pub fn emit(&self, event: LogEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct LogSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl LogSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to undo.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for LogSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
