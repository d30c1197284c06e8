use std::time::Duration;
use tokio::time::Instant;

/// Whether incoming status samples may be trusted right now
///
/// The pad keeps reporting outdated telemetry for a while after it accepts a
/// write, so samples are discarded while a write is in flight and until the
/// settle window that follows it has passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandGuard {
    /// No write has been issued recently
    #[default]
    Idle,
    /// A write command is executing
    CommandInFlight,
    /// A write completed; samples are stale until `until`
    Settling {
        /// End of the stale window
        until: Instant,
    },
}

impl CommandGuard {
    /// Mark a write command as started
    pub fn begin_command(&mut self) {
        *self = Self::CommandInFlight;
    }

    /// Mark the current write command as finished at `now`
    pub fn finish_command(&mut self, now: Instant, window: Duration) {
        *self = Self::Settling { until: now + window };
    }

    /// Whether a sample arriving at `now` must be discarded
    ///
    /// An expired settle window collapses back to [`CommandGuard::Idle`].
    pub fn suppresses(&mut self, now: Instant) -> bool {
        match *self {
            Self::Idle => false,
            Self::CommandInFlight => true,
            Self::Settling { until } => {
                if now < until {
                    true
                } else {
                    *self = Self::Idle;
                    false
                }
            }
        }
    }

    /// Whether a write command is executing
    #[must_use]
    pub const fn is_command_in_flight(&self) -> bool {
        matches!(self, Self::CommandInFlight)
    }
}
