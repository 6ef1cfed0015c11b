//! Microsecond-precision timestamps.
//!
//! Every time value carried by a [`Record`](crate::Record) is a signed count
//! of microseconds since the Unix epoch. That covers roughly ±292,277 years
//! and gives records a total order regardless of which parser produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        millis.checked_mul(1_000).map(Self)
    }

    pub fn from_secs(secs: i64) -> Option<Self> {
        secs.checked_mul(1_000_000).map(Self)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    /// Converts back to a calendar time. Values outside chrono's supported
    /// range (about ±262,000 years) have no representation.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_micros(self.0)
    }

    pub fn now() -> Self {
        Self::from(Utc::now())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_micros())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(
                f,
                "{}",
                dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            ),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Describes what a timestamp means for the artifact (creation, last run, ...).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimestampDesc(String);

impl TimestampDesc {
    pub const CREATION: &'static str = "creation time";
    pub const MODIFICATION: &'static str = "modification time";
    pub const LAST_ACCESS: &'static str = "last access time";
    pub const METADATA_CHANGE: &'static str = "metadata modification time";
    pub const LAST_RUN: &'static str = "last run time";
    pub const WRITTEN: &'static str = "written time";
    pub const RECORDED: &'static str = "recorded time";

    pub fn new(desc: impl Into<String>) -> Self {
        Self(desc.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TimestampDesc {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for TimestampDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
