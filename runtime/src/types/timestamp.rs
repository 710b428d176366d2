use chrono::{DateTime, SecondsFormat, Utc};

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

pub trait TimestampTrait {
    fn now() -> Self;
    fn from_secs(v: i64) -> Self;
    fn to_rfc3339(&self) -> String;
}

impl TimestampTrait for Timestamp {
    fn now() -> Self {
        Utc::now().timestamp_millis()
    }

    fn from_secs(v: i64) -> Self {
        v.saturating_mul(1000)
    }

    fn to_rfc3339(&self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(*self) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.to_string(),
        }
    }
}
