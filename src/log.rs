//! Diagnostic sink.
//!
//! The pipeline reports through a [`Log`] handle instead of printing, so the CLI can
//! forward everything to `tracing` while tests capture events in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageKind {
    Information,
    Warning,
    Error,
}

/// A captured notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Notify {
        kind: MessageKind,
        sender: Option<String>,
        message: String,
    },
    StartProgress {
        caption: String,
        max: u64,
    },
    StepProgress {
        position: u64,
    },
    EndProgress,
}

/// Receiver of diagnostics. Called concurrently from worker threads.
pub trait Log: Sync {
    fn notify(&self, kind: MessageKind, sender: Option<&str>, message: &str);
    fn start_progress(&self, caption: &str, max: u64);
    /// Advances the current stage by `value`.
    fn step_progress(&self, value: u64);
    fn end_progress(&self);

    fn info(&self, sender: Option<&str>, message: &str) {
        self.notify(MessageKind::Information, sender, message);
    }

    fn warning(&self, sender: Option<&str>, message: &str) {
        self.notify(MessageKind::Warning, sender, message);
    }
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default)]
pub struct TracingLog {
    position: AtomicU64,
    max: AtomicU64,
}

impl TracingLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for TracingLog {
    fn notify(&self, kind: MessageKind, sender: Option<&str>, message: &str) {
        let sender = sender.unwrap_or("-");
        match kind {
            MessageKind::Information => tracing::info!(sender, "{}", message),
            MessageKind::Warning => tracing::warn!(sender, "{}", message),
            MessageKind::Error => tracing::error!(sender, "{}", message),
        }
    }

    fn start_progress(&self, caption: &str, max: u64) {
        self.position.store(0, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
        tracing::info!("{} ({} items)", caption, max);
    }

    fn step_progress(&self, value: u64) {
        let position = self.position.fetch_add(value, Ordering::Relaxed) + value;
        tracing::trace!(position, max = self.max.load(Ordering::Relaxed), "progress");
    }

    fn end_progress(&self) {
        tracing::debug!(
            done = self.position.load(Ordering::Relaxed),
            max = self.max.load(Ordering::Relaxed),
            "stage finished"
        );
    }
}

/// Records every event, for inspection by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Mutex<Vec<Event>>,
    position: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Messages of the given kind, in emission order.
    pub fn messages(&self, kind: MessageKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Notify { kind: k, message, .. } if k == kind => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Log for MemoryLog {
    fn notify(&self, kind: MessageKind, sender: Option<&str>, message: &str) {
        self.push(Event::Notify {
            kind,
            sender: sender.map(str::to_owned),
            message: message.to_owned(),
        });
    }

    fn start_progress(&self, caption: &str, max: u64) {
        self.position.store(0, Ordering::Relaxed);
        self.push(Event::StartProgress {
            caption: caption.to_owned(),
            max,
        });
    }

    fn step_progress(&self, value: u64) {
        let position = self.position.fetch_add(value, Ordering::Relaxed) + value;
        self.push(Event::StepProgress { position });
    }

    fn end_progress(&self) {
        self.push(Event::EndProgress);
    }
}
