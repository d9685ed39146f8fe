//! Session value and reconnection policy

use std::fmt;
use std::time::Duration;

/// Socket lifecycle as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// How failed connection attempts are retried
///
/// The delay grows linearly: the k-th consecutive failure waits
/// `base_delay * k` before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Failures tolerated since the last successful open
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// What to do after a failed or dropped connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Per-connection bookkeeping, owned by the engine task
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub state: ConnectionState,
    pub conversation_id: Option<String>,
    pub reconnect_attempt: u32,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handshake succeeded
    pub fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.reconnect_attempt = 0;
    }

    /// Socket closed or failed; the conversation does not survive it
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.conversation_id = None;
    }

    /// Count a failure against `policy` and decide whether to try again
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        if self.reconnect_attempt > policy.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.reconnect_attempt,
            };
        }

        ReconnectDecision::Retry {
            attempt: self.reconnect_attempt,
            delay: policy.delay_for_attempt(self.reconnect_attempt),
        }
    }
}
