//! Session timers and administrative state

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Idle hold time before the first connection attempt
pub const INITIAL_IDLE_HOLD_TIME: Duration = Duration::ZERO;
/// Idle hold time after the first attempt
pub const DEFAULT_IDLE_HOLD_TIME: Duration = Duration::from_secs(5);
/// Hold time while waiting for the peer's OPEN (RFC 4271 Section 8.2.2)
pub const OPEN_SENT_HOLD_TIME: Duration = Duration::from_secs(240);
/// Time allowed to set up the TCP connection
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A one-shot timer that may be disarmed
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// A timer that fires after `after`
    #[must_use]
    pub fn armed(after: Duration) -> Self {
        let mut timer = Self::default();
        timer.arm(after);
        timer
    }

    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time until the timer fires
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Wait for the timer to fire, which disarms it
    ///
    /// Never completes while the timer is disarmed. Cancel safe.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// A ticker sending KEEPALIVEs every `seconds`, or every second for 0
#[must_use]
pub fn keepalive_ticker(seconds: u16) -> Interval {
    let period = Duration::from_secs(u64::from(seconds.max(1)));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Convert a hold time to a timer, where 0 means no timer
#[must_use]
pub fn hold_timer(seconds: u16) -> Timer {
    if seconds == 0 {
        Timer::default()
    } else {
        Timer::armed(Duration::from_secs(u64::from(seconds)))
    }
}

/// Administrative state of a peer
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AdminState {
    #[default]
    Up,
    Down,
    /// Shut down because the peer sent too many prefixes
    PfxCt,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::PfxCt => "pfx-ct",
        })
    }
}

/// A request to change the administrative state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminStateOperation {
    pub state: AdminState,
    /// Shutdown communication sent in the CEASE (RFC 9003)
    pub communication: String,
}

impl AdminStateOperation {
    #[must_use]
    pub fn new(state: AdminState, communication: &str) -> Self {
        Self {
            state,
            communication: communication.to_string(),
        }
    }
}
