//! Liveness monitor.
//!
//! Three deadlines share one clock: the heartbeat emitter, the staleness
//! checker and, in smart mode, the idle timer. The monitor never sleeps
//! itself; the driver waits on [`LivenessMonitor::next_deadline`] and calls
//! [`LivenessMonitor::poll`] when it passes. Stopping clears every deadline
//! at once, so no timer can outlive the connection it was armed for.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ChannelConfig;

/// What the driver should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Send a ping.
    Heartbeat,
    /// Nothing received within the staleness threshold; force-close.
    Stale,
    /// No task activity within the idle timeout; close to free the channel.
    Idle,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    heartbeat_interval: Duration,
    stale_check_interval: Duration,
    stale_threshold: Duration,
    idle_timeout: Option<Duration>,
    running: bool,
    task_active: bool,
    last_inbound: Option<Instant>,
    last_activity: Option<Instant>,
    next_heartbeat: Option<Instant>,
    next_stale_check: Option<Instant>,
}

impl LivenessMonitor {
    #[must_use]
    pub const fn new(config: &ChannelConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            stale_check_interval: config.stale_check_interval(),
            stale_threshold: config.stale_threshold(),
            idle_timeout: config.idle_timeout(),
            running: false,
            task_active: false,
            last_inbound: None,
            last_activity: None,
            next_heartbeat: None,
            next_stale_check: None,
        }
    }

    /// Arm all timers for a fresh connection.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.last_inbound = Some(now);
        self.last_activity = Some(now);
        self.next_heartbeat = Some(now + self.heartbeat_interval);
        self.next_stale_check = Some(now + self.stale_check_interval);
    }

    /// Cancel all timers.
    pub const fn stop(&mut self) {
        self.running = false;
        self.next_heartbeat = None;
        self.next_stale_check = None;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub const fn task_active(&self) -> bool {
        self.task_active
    }

    /// Any inbound frame resets the staleness clock. Application frames
    /// also count as activity for the idle timer.
    pub const fn record_inbound(&mut self, now: Instant, application: bool) {
        self.last_inbound = Some(now);
        if application {
            self.last_activity = Some(now);
        }
    }

    /// Outbound application traffic.
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Suppress the idle timer while a task is active. Clearing the flag
    /// restarts idle counting from `now`.
    pub const fn set_task_active(&mut self, active: bool, now: Instant) {
        if self.task_active && !active {
            self.last_activity = Some(now);
        }
        self.task_active = active;
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if !self.running || self.task_active {
            return None;
        }
        Some(self.last_activity? + self.idle_timeout?)
    }

    /// Earliest pending deadline, if running.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.next_heartbeat, self.next_stale_check, self.idle_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every deadline that has passed.
    ///
    /// `Stale` and `Idle` come before `Heartbeat`; the driver closes on
    /// either and discards the rest.
    pub fn poll(&mut self, now: Instant) -> Vec<LivenessAction> {
        let mut actions = Vec::new();
        if !self.running {
            return actions;
        }

        if self.next_stale_check.is_some_and(|at| at <= now) {
            self.next_stale_check = Some(now + self.stale_check_interval);
            let silent = self
                .last_inbound
                .map_or(Duration::ZERO, |at| now.duration_since(at));
            if silent > self.stale_threshold {
                actions.push(LivenessAction::Stale);
            }
        }

        if self.idle_deadline().is_some_and(|at| at <= now) {
            actions.push(LivenessAction::Idle);
        }

        if self.next_heartbeat.is_some_and(|at| at <= now) {
            self.next_heartbeat = Some(now + self.heartbeat_interval);
            actions.push(LivenessAction::Heartbeat);
        }

        actions
    }
}
