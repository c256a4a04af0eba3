//! Reconnect policy and close-code classification.
//!
//! Reconnects use a constant delay and a bounded attempt count. The delay
//! does not grow between attempts and carries no jitter.

use std::time::Duration;

/// Close code for a normal, deliberate closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code sent when an endpoint is going away (page unload, shutdown).
pub const GOING_AWAY: u16 = 1001;
/// Close code reported when a close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
/// Default upper bound on reconnect attempts between successful opens.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Returns `true` for the two close codes that mean "closed on purpose".
pub fn is_normal_closure(code: u16) -> bool {
    code == NORMAL_CLOSURE || code == GOING_AWAY
}

/// Policy controlling whether and when a closed session reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether abnormal closures trigger reconnects at all.
    pub enabled: bool,
    /// Fixed delay before each reconnect attempt.
    pub interval: Duration,
    /// Maximum attempts before the session settles in `disconnected`.
    ///
    /// The counter resets on every successful open. `0` disables reconnects.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Policy with a fixed delay and attempt bound.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            enabled: true,
            interval,
            max_attempts,
        }
    }

    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Decides whether a closure with `close_code` should schedule a reconnect.
    ///
    /// `attempts` is the number of reconnects already made since the last
    /// successful open.
    pub fn should_reconnect(&self, close_code: u16, attempts: u32) -> bool {
        if !self.enabled || is_normal_closure(close_code) {
            return false;
        }
        attempts < self.max_attempts
    }

    /// Delay before the given reconnect attempt. Constant for every attempt.
    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}
