use std::fmt;
use std::fmt::Display;

use chrono::Duration;

use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{Timestamp, TimestampTrait};

/// Prevents overflow when storing ms-precision time in i64.
pub const MAX_DURATION_MSECS: i64 = 100 * 365 * 24 * 3600 * 1000;

const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Deadline contains deadline with the corresponding timeout for pretty error messages.
///
/// The evaluator only passes it through; enforcing it is up to the storage implementation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Deadline {
    /// unix timestamp in milliseconds.
    pub deadline: Timestamp,
    pub timeout: Duration,
}

impl Deadline {
    /// Returns a deadline for the given timeout, starting now.
    pub fn new(timeout: Duration) -> RuntimeResult<Self> {
        Deadline::with_start_time(Timestamp::now(), timeout)
    }

    pub fn with_start_time(start_time: Timestamp, timeout: Duration) -> RuntimeResult<Self> {
        let millis = timeout.num_milliseconds();
        if millis > MAX_DURATION_MSECS {
            return Err(RuntimeError::ArgumentError(format!(
                "timeout value too large: {timeout}"
            )));
        }
        if millis < 0 {
            return Err(RuntimeError::ArgumentError(format!(
                "negative timeouts are not supported; got {timeout}"
            )));
        }
        Ok(Deadline {
            deadline: start_time + millis,
            timeout,
        })
    }

    /// returns true if deadline is exceeded.
    pub fn exceeded(&self) -> bool {
        Timestamp::now() > self.deadline
    }
}

impl Default for Deadline {
    fn default() -> Self {
        let timeout = Duration::seconds(DEFAULT_TIMEOUT_SECS);
        Deadline {
            deadline: Timestamp::now() + timeout.num_milliseconds(),
            timeout,
        }
    }
}

impl TryFrom<Duration> for Deadline {
    type Error = RuntimeError;

    fn try_from(timeout: Duration) -> Result<Self, Self::Error> {
        Deadline::new(timeout)
    }
}

impl Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let start_time = self.deadline - self.timeout.num_milliseconds();
        let elapsed = (Timestamp::now() - start_time) as f64 / 1e3;
        write!(
            f,
            "{:.3} seconds (elapsed {:.3} seconds)",
            self.timeout.num_milliseconds() as f64 / 1e3,
            elapsed
        )
    }
}
