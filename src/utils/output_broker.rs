//! Per-session fan-out of shell events.
//!
//! Every session owns one broker. Reader tasks publish into it and any number of
//! consumers subscribe to a `tokio::broadcast` receiver. Publishing never waits on
//! a consumer: a subscriber that falls more than `capacity` events behind gets
//! `RecvError::Lagged` and must resynchronise on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::broadcast;
use tracing::trace;

/// A discrete event on a session's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TerminalEvent {
    /// A chunk read from the shell's stdout, or synthetic output such as a prompt.
    Output { data: String },
    /// A chunk read from stderr, or a built-in's error message.
    Error { data: String },
    /// The shell exited on its own.
    Exit { code: Option<i32> },
    /// The host could not wait on or read from the shell.
    ProcessError { message: String },
    /// Ask the display layer to wipe its view.
    Clear,
}

/// Last time anything went into or came out of a session.
#[derive(Debug)]
pub struct ActivityStamp(StdRwLock<DateTime<Utc>>);

impl ActivityStamp {
    pub fn new() -> Self {
        Self(StdRwLock::new(Utc::now()))
    }

    pub fn touch(&self) {
        let now = Utc::now();
        match self.0.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn last(&self) -> DateTime<Utc> {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for ActivityStamp {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct OutputBroker {
    session_id: String,
    sender: StdMutex<Option<broadcast::Sender<TerminalEvent>>>,
    activity: Arc<ActivityStamp>,
}

impl OutputBroker {
    pub fn new(session_id: impl Into<String>, capacity: usize, activity: Arc<ActivityStamp>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id: session_id.into(),
            sender: StdMutex::new(Some(sender)),
            activity,
        }
    }

    fn with_sender<R>(&self, f: impl FnOnce(&mut Option<broadcast::Sender<TerminalEvent>>) -> R) -> R {
        match self.sender.lock() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    /// Returns a receiver for all future events, or `None` once detached.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<TerminalEvent>> {
        self.with_sender(|sender| sender.as_ref().map(|s| s.subscribe()))
    }

    /// Publishes to every current subscriber and returns how many received it.
    /// Events published after [`detach`](Self::detach) are dropped.
    pub fn publish(&self, event: TerminalEvent) -> usize {
        let delivered = self.with_sender(|sender| match sender.as_ref() {
            // send() only fails when nobody is subscribed
            Some(s) => Some(s.send(event).unwrap_or(0)),
            None => None,
        });
        match delivered {
            Some(count) => {
                self.activity.touch();
                count
            }
            None => {
                trace!(sid = %self.session_id, "Dropping event published after detach");
                0
            }
        }
    }

    /// Drops the sender so every subscriber sees the channel close.
    pub fn detach(&self) {
        self.with_sender(|sender| {
            sender.take();
        });
    }

    pub fn is_detached(&self) -> bool {
        self.with_sender(|sender| sender.is_none())
    }

    pub fn subscriber_count(&self) -> usize {
        self.with_sender(|sender| sender.as_ref().map(|s| s.receiver_count()).unwrap_or(0))
    }
}
