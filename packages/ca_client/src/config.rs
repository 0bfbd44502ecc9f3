use std::env;
use std::time::Duration;

use tracing::warn;

/// Environment variable holding the connection timeout in seconds.
pub const CONNECTION_TIMEOUT_ENV: &str = "EPICS_CA_CONN_TMO";

/// Default silence period after which a connection is probed.
pub const DEFAULT_CONNECTION_PERIOD: Duration = Duration::from_secs(30);

/// Default time a probe may stay unanswered.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest period or echo timeout a watchdog accepts. Shorter values are raised to this.
pub const MIN_CONNECTION_PERIOD: Duration = Duration::from_millis(100);

/// Longest period or echo timeout a watchdog accepts. Longer values are lowered to this.
pub const MAX_CONNECTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing parameters of a [`ConnectionWatchdog`][crate::ConnectionWatchdog].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionTimeouts {
    /// How long a connection may stay silent before it is probed.
    pub period: Duration,

    /// How long a probe may stay unanswered, capped by `period`.
    pub echo_timeout: Duration,
}

impl ConnectionTimeouts {
    /// Reads the period from [`CONNECTION_TIMEOUT_ENV`], keeping the default echo timeout.
    ///
    /// A missing variable yields the defaults. A malformed value is logged and ignored.
    /// Values outside [`MIN_CONNECTION_PERIOD`]..=[`MAX_CONNECTION_PERIOD`] are clamped into
    /// that range.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_value(env::var(CONNECTION_TIMEOUT_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        let defaults = Self::default();

        let Some(value) = value else {
            return defaults;
        };

        let seconds = match value.trim().parse::<f64>() {
            Ok(seconds) if seconds.is_finite() => seconds,
            _ => {
                warn!(
                    variable = CONNECTION_TIMEOUT_ENV,
                    value,
                    default = ?defaults.period,
                    "ignoring malformed connection timeout"
                );
                return defaults;
            }
        };

        let period = if seconds >= MAX_CONNECTION_PERIOD.as_secs_f64() {
            warn!(
                variable = CONNECTION_TIMEOUT_ENV,
                value,
                max = ?MAX_CONNECTION_PERIOD,
                "connection timeout too large, using the maximum"
            );
            MAX_CONNECTION_PERIOD
        } else {
            // Negative values fail the conversion and end up at the minimum.
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
        };

        Self {
            period,
            ..defaults
        }
        .clamped()
    }

    /// Brings both durations into the range a watchdog can schedule.
    #[must_use]
    pub(crate) fn clamped(self) -> Self {
        Self {
            period: self
                .period
                .clamp(MIN_CONNECTION_PERIOD, MAX_CONNECTION_PERIOD),
            echo_timeout: self
                .echo_timeout
                .clamp(MIN_CONNECTION_PERIOD, MAX_CONNECTION_PERIOD),
        }
    }
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            period: DEFAULT_CONNECTION_PERIOD,
            echo_timeout: DEFAULT_ECHO_TIMEOUT,
        }
    }
}
