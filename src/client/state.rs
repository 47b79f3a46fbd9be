//! Connection-state machine for [`super::ChatClient`].
//!
//! Pure bookkeeping: the driver task reports transport outcomes and fires the
//! single deadline timer; this type decides the next state. The retry count
//! and the active deadline (handshake timeout while connecting, retry delay
//! while disconnected) are plain fields.
//!
//! An open link is not proof of a healthy server: the retry budget is only
//! restored once the broker acknowledges the join (`join_success`), so a
//! peer that accepts and immediately drops connections still ends in
//! `fallback`.
//!
//! ```text
//! connecting ──ok──▶ connected
//!     │                  │ lost
//!     ▼ fail / timeout   ▼
//! disconnected ◀─────────┘ (retries left) ──delay──▶ connecting
//!     │ retries exhausted
//!     ▼
//!   error ──▶ fallback (until reconnect())
//! ```

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Fallback,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting   => "connecting",
            ConnectionState::Connected    => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error        => "error",
            ConnectionState::Fallback     => "fallback",
        };
        write!(f, "{s}")
    }
}

/// What the driver should do after a failed or lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFailure {
    /// Wait until the deadline, then try again.
    RetryAt(Instant),
    /// Retries used up; the machine is now in `error`.
    Exhausted,
}

/// What a fired deadline means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineAction {
    /// Retry delay elapsed; start connecting.
    Connect,
    /// Handshake did not complete in time.
    HandshakeTimedOut,
    /// No deadline was due.
    Nothing,
}

#[derive(Debug, Clone)]
pub struct Reconnector {
    state: ConnectionState,
    attempts: u32,
    max_retries: u32,
    retry_delay: std::time::Duration,
    handshake_timeout: std::time::Duration,
    deadline: Option<Instant>,
}

impl Reconnector {
    /// Starts in `connecting` with no deadline armed; call
    /// [`begin_connect`](Self::begin_connect) when the first attempt starts.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: ConnectionState::Connecting,
            attempts: 0,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            handshake_timeout: config.handshake_timeout(),
            deadline: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts used since the last acknowledged join.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A connect attempt starts now.
    pub fn begin_connect(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.deadline = Some(now + self.handshake_timeout);
    }

    /// Transport link is open. The retry budget is left as is.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.deadline = None;
    }

    /// The broker answered the join; the link is healthy.
    pub fn on_acknowledged(&mut self) {
        self.attempts = 0;
    }

    /// Handshake failure, handshake timeout or loss of an established link.
    pub fn on_failure(&mut self, now: Instant) -> AfterFailure {
        if self.attempts < self.max_retries {
            self.attempts += 1;
            self.state = ConnectionState::Disconnected;
            let at = now + self.retry_delay;
            self.deadline = Some(at);
            AfterFailure::RetryAt(at)
        } else {
            self.state = ConnectionState::Error;
            self.deadline = None;
            AfterFailure::Exhausted
        }
    }

    pub fn enter_fallback(&mut self) {
        self.state = ConnectionState::Fallback;
        self.deadline = None;
    }

    /// Called when the timer fires.
    pub fn on_deadline(&mut self, now: Instant) -> DeadlineAction {
        match self.deadline {
            Some(d) if d <= now => {}
            _ => return DeadlineAction::Nothing,
        }
        match self.state {
            ConnectionState::Disconnected => {
                self.begin_connect(now);
                DeadlineAction::Connect
            }
            ConnectionState::Connecting => {
                self.deadline = None;
                DeadlineAction::HandshakeTimedOut
            }
            _ => {
                self.deadline = None;
                DeadlineAction::Nothing
            }
        }
    }

    /// Manual `reconnect()`: clear the retry budget and start over.
    pub fn reset(&mut self, now: Instant) {
        self.attempts = 0;
        self.begin_connect(now);
    }
}
