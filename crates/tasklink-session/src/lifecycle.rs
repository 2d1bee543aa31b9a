//! Connection lifecycle state machine.
//!
//! Pure bookkeeping: no I/O and no timers. The driver asks it whether an
//! attempt may start now, tells it how attempts end, and reads back the
//! delay for the next reconnect.

use std::{fmt, time::Duration};

use tasklink_core::Identity;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::ChannelConfig;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    /// Terminal. No further transitions are allowed.
    Destroyed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ReconnectScheduled => "RECONNECT_SCHEDULED",
            Self::Destroyed => "DESTROYED",
        }
    }

    fn allows(self, to: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Destroyed, Disconnected, ReconnectScheduled};
        matches!(
            (self, to),
            (Disconnected, Connecting | ReconnectScheduled)
                | (Connecting, Connected | ReconnectScheduled | Disconnected)
                | (Connected, Disconnected)
                | (ReconnectScheduled, Connecting | Disconnected)
        ) || (to == Destroyed && self != Destroyed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Connection has been destroyed")]
    Destroyed,
}

/// Whether a connect attempt may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Now,
    /// The minimum interval since the last attempt has not elapsed.
    DeferUntil(Instant),
}

/// Connection record and reconnect policy.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    identity: Option<Identity>,
    attempt: u32,
    last_attempt_at: Option<Instant>,
    pending_since: Option<Instant>,
    last_activity_at: Option<Instant>,
    min_interval: Duration,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Lifecycle {
    /// Create a lifecycle in `Disconnected`.
    #[must_use]
    pub const fn new(config: &ChannelConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            identity: None,
            attempt: 0,
            last_attempt_at: None,
            pending_since: None,
            last_activity_at: None,
            min_interval: config.min_connect_interval(),
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Reconnect attempts made since the last successful connect.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the in-flight attempt started.
    #[must_use]
    pub const fn pending_since(&self) -> Option<Instant> {
        self.pending_since
    }

    #[must_use]
    pub const fn last_activity_at(&self) -> Option<Instant> {
        self.last_activity_at
    }

    /// Bind the identity used for the next attempt.
    ///
    /// # Errors
    /// Returns error once destroyed.
    pub fn bind(&mut self, identity: Identity) -> Result<(), LifecycleError> {
        if self.state == ConnectionState::Destroyed {
            return Err(LifecycleError::Destroyed);
        }
        self.identity = Some(identity);
        Ok(())
    }

    /// Move to `to`. Transitioning to the current state is a no-op.
    ///
    /// # Errors
    /// Returns error if the transition is not in the state graph.
    pub fn transition(&mut self, to: ConnectionState) -> Result<(), LifecycleError> {
        if self.state == to {
            return if to == ConnectionState::Destroyed {
                Err(LifecycleError::Destroyed)
            } else {
                Ok(())
            };
        }
        if self.state == ConnectionState::Destroyed {
            return Err(LifecycleError::Destroyed);
        }
        if !self.state.allows(to) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!("Connection {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Check the minimum spacing between physical attempts.
    #[must_use]
    pub fn admit(&self, now: Instant) -> Admission {
        match self.last_attempt_at {
            Some(last) if now.duration_since(last) < self.min_interval => {
                Admission::DeferUntil(last + self.min_interval)
            }
            _ => Admission::Now,
        }
    }

    /// Record the start of a physical attempt.
    ///
    /// # Errors
    /// Returns error if the state graph forbids connecting.
    pub fn begin_attempt(&mut self, now: Instant) -> Result<(), LifecycleError> {
        self.transition(ConnectionState::Connecting)?;
        self.last_attempt_at = Some(now);
        self.pending_since = Some(now);
        Ok(())
    }

    /// Record a successful attempt. Resets the reconnect counter.
    ///
    /// # Errors
    /// Returns error if no attempt was in flight.
    pub fn attempt_succeeded(&mut self, now: Instant) -> Result<(), LifecycleError> {
        self.transition(ConnectionState::Connected)?;
        self.attempt = 0;
        self.pending_since = None;
        self.last_activity_at = Some(now);
        Ok(())
    }

    /// Note application traffic on the open connection.
    pub const fn touch(&mut self, now: Instant) {
        self.last_activity_at = Some(now);
    }

    /// Reconnect delay for the `n`th attempt: `base * 2^(n-1)`, capped.
    #[must_use]
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Consume one reconnect from the budget after a failure or drop.
    ///
    /// Returns the delay before the next attempt, or `None` when the budget
    /// is spent; the connection then settles in `Disconnected` and the
    /// counter resets so a manual connect starts a fresh budget.
    pub fn schedule_reconnect(&mut self) -> Option<Duration> {
        self.pending_since = None;
        if self.state == ConnectionState::Destroyed {
            return None;
        }
        if self.state == ConnectionState::Connected {
            let _ = self.transition(ConnectionState::Disconnected);
        }
        if self.attempt >= self.max_attempts {
            if self.max_attempts > 0 {
                tracing::info!("Giving up after {} reconnect attempts", self.attempt);
            }
            self.attempt = 0;
            let _ = self.transition(ConnectionState::Disconnected);
            return None;
        }
        if self.transition(ConnectionState::ReconnectScheduled).is_err() {
            return None;
        }
        self.attempt += 1;
        Some(self.backoff(self.attempt))
    }

    /// Stop without reconnecting, keeping the identity for the next demand.
    pub fn settle(&mut self) {
        self.pending_since = None;
        let _ = self.transition(ConnectionState::Disconnected);
    }

    /// Tear down: release the identity and move to `Disconnected`, or to
    /// `Destroyed` when `destroy` is set.
    pub fn release(&mut self, destroy: bool) {
        self.identity = None;
        self.attempt = 0;
        self.pending_since = None;
        if self.state == ConnectionState::Destroyed {
            return;
        }
        if destroy {
            self.state = ConnectionState::Destroyed;
        } else {
            self.state = ConnectionState::Disconnected;
        }
        tracing::debug!("Connection released ({})", self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(max_attempts: u32) -> Lifecycle {
        Lifecycle::new(&ChannelConfig {
            max_reconnect_attempts: max_attempts,
            ..ChannelConfig::default()
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut lc = lifecycle(5);
        let now = Instant::now();
        lc.begin_attempt(now).unwrap();
        assert_eq!(lc.state(), ConnectionState::Connecting);
        assert_eq!(lc.pending_since(), Some(now));
        lc.attempt_succeeded(now).unwrap();
        assert_eq!(lc.state(), ConnectionState::Connected);
        assert!(lc.pending_since().is_none());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut lc = lifecycle(5);
        let err = lc.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::IllegalTransition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connected,
            }
        );
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let mut lc = lifecycle(5);
        lc.bind(Identity::new("c")).unwrap();
        lc.release(true);
        assert_eq!(lc.state(), ConnectionState::Destroyed);
        assert!(lc.identity().is_none());
        assert_eq!(
            lc.transition(ConnectionState::Connecting),
            Err(LifecycleError::Destroyed)
        );
        assert_eq!(lc.bind(Identity::new("c")), Err(LifecycleError::Destroyed));
        assert!(lc.schedule_reconnect().is_none());
    }

    #[test]
    fn test_admit_enforces_min_interval() {
        let mut lc = lifecycle(5);
        let t0 = Instant::now();
        assert_eq!(lc.admit(t0), Admission::Now);
        lc.begin_attempt(t0).unwrap();

        let soon = t0 + Duration::from_millis(500);
        assert_eq!(
            lc.admit(soon),
            Admission::DeferUntil(t0 + Duration::from_secs(2))
        );
        assert_eq!(lc.admit(t0 + Duration::from_secs(2)), Admission::Now);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let lc = lifecycle(5);
        let delays: Vec<u64> = (1..=7)
            .map(|n| u64::try_from(lc.backoff(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(lc.backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn test_reconnect_budget_is_bounded() {
        let mut lc = lifecycle(3);
        let now = Instant::now();
        let mut scheduled = 0;
        lc.begin_attempt(now).unwrap();
        while lc.schedule_reconnect().is_some() {
            scheduled += 1;
            assert_eq!(lc.state(), ConnectionState::ReconnectScheduled);
            lc.begin_attempt(now).unwrap();
        }
        assert_eq!(scheduled, 3);
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(lc.attempt(), 0);
    }

    #[test]
    fn test_zero_attempts_never_schedules() {
        let mut lc = lifecycle(0);
        lc.begin_attempt(Instant::now()).unwrap();
        assert!(lc.schedule_reconnect().is_none());
        assert_eq!(lc.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_drop_from_connected_schedules_reconnect() {
        let mut lc = lifecycle(2);
        let now = Instant::now();
        lc.begin_attempt(now).unwrap();
        lc.attempt_succeeded(now).unwrap();
        assert_eq!(lc.schedule_reconnect(), Some(Duration::from_secs(1)));
        assert_eq!(lc.state(), ConnectionState::ReconnectScheduled);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut lc = lifecycle(5);
        let now = Instant::now();
        lc.begin_attempt(now).unwrap();
        lc.schedule_reconnect();
        lc.begin_attempt(now).unwrap();
        lc.schedule_reconnect();
        assert_eq!(lc.attempt(), 2);
        lc.begin_attempt(now).unwrap();
        lc.attempt_succeeded(now).unwrap();
        assert_eq!(lc.attempt(), 0);
    }

    #[test]
    fn test_settle_keeps_identity() {
        let mut lc = lifecycle(5);
        let now = Instant::now();
        lc.bind(Identity::new("keep")).unwrap();
        lc.begin_attempt(now).unwrap();
        lc.attempt_succeeded(now).unwrap();
        lc.settle();
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(lc.identity().map(Identity::as_str), Some("keep"));

        lc.release(false);
        assert!(lc.identity().is_none());
    }
}
