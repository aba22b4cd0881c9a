//! Start/stop hysteresis for the output stream
//!
//! Connecting and disconnecting the output stream is costly and can click, so
//! the decision to stop is only taken on a slow timer and only after the queue
//! has stayed empty for a full idle period.
//!
//! ```text
//! Stopped ──first chunk──▶ Starting ──started──▶ Running
//!    ▲                                              │ empty for idle_timeout
//!    └──────────stopped────────── Stopping ◀────────┘
//! ```

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What the owner of the output stream should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    None,
    Start,
    Stop,
}

/// Timer-driven state machine for the output stream lifecycle
#[derive(Debug)]
pub struct PlaybackGate {
    state: PlaybackState,
    idle_timeout: Duration,
    check_interval: Duration,
    next_check: Option<Instant>,
    idle_since: Option<Instant>,
}

impl PlaybackGate {
    pub fn new(idle_timeout: Duration, check_interval: Duration) -> Self {
        Self {
            state: PlaybackState::Stopped,
            idle_timeout,
            check_interval,
            next_check: None,
            idle_since: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// A chunk was queued.
    ///
    /// Normally only the first chunk after an empty queue finds the gate stopped,
    /// but a failed start leaves data waiting, so any push while stopped restarts.
    pub fn on_chunk_queued(&mut self) -> GateAction {
        self.idle_since = None;
        match self.state {
            PlaybackState::Stopped | PlaybackState::Stopping => {
                self.state = PlaybackState::Starting;
                GateAction::Start
            }
            PlaybackState::Starting | PlaybackState::Running => GateAction::None,
        }
    }

    /// The output stream is playing
    pub fn on_started(&mut self) {
        if self.state == PlaybackState::Starting {
            self.state = PlaybackState::Running;
        }
    }

    /// Starting the output stream failed; go back to idle
    pub fn on_start_failed(&mut self) {
        if self.state == PlaybackState::Starting {
            self.state = PlaybackState::Stopped;
        }
    }

    /// The output stream is paused
    pub fn on_stopped(&mut self) {
        if self.state == PlaybackState::Stopping {
            self.state = PlaybackState::Stopped;
        }
    }

    /// Periodic check; `idle` is true when the engine is starving and the queue is empty.
    ///
    /// May be called more often than `check_interval`; extra calls are ignored.
    pub fn tick(&mut self, now: Instant, idle: bool) -> GateAction {
        if let Some(next) = self.next_check {
            if now < next {
                return GateAction::None;
            }
        }
        self.next_check = Some(now + self.check_interval);

        if self.state != PlaybackState::Running {
            return GateAction::None;
        }
        if !idle {
            self.idle_since = None;
            return GateAction::None;
        }

        let since = *self.idle_since.get_or_insert(now);
        if now.duration_since(since) >= self.idle_timeout {
            self.idle_since = None;
            self.state = PlaybackState::Stopping;
            return GateAction::Stop;
        }
        GateAction::None
    }
}
