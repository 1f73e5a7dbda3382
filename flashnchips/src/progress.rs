//! Progress reporting
//!
//! A flashing run reports through a channel of [FlasherEvent]s, so it does
//! not need to know who is listening, or whether anyone is.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    mpsc::Sender,
    Arc,
};

use log::info;

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Notifications published by a flashing run, in the order they happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlasherEvent {
    /// Total number of bytes processed so far
    Progress(u32),
    /// A human readable description of the current step
    Status(String),
    /// The run is over
    Done { success: bool, message: String },
}

/// Publishes the events of a run
#[derive(Debug, Clone)]
pub struct EventSink {
    events: Option<Sender<FlasherEvent>>,
    progress: Arc<AtomicU32>,
}

impl EventSink {
    pub fn new(events: Sender<FlasherEvent>, progress: Arc<AtomicU32>) -> Self {
        EventSink {
            events: Some(events),
            progress,
        }
    }

    /// A sink nobody listens to
    pub fn detached() -> Self {
        EventSink {
            events: None,
            progress: Arc::default(),
        }
    }

    /// Bytes done so far
    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn set_progress(&self, done: usize) {
        let done = u32::try_from(done).unwrap_or(u32::MAX);
        self.progress.store(done, Ordering::Relaxed);
        self.send(FlasherEvent::Progress(done));
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.send(FlasherEvent::Status(message));
    }

    pub fn done(&self, success: bool, message: impl Into<String>) {
        self.send(FlasherEvent::Done {
            success,
            message: message.into(),
        });
    }

    fn send(&self, event: FlasherEvent) {
        if let Some(events) = &self.events {
            // A receiver which went away is not an error
            let _ = events.send(event);
        }
    }
}
