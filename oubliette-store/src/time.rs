//! Unix-seconds <-> `DateTime<Utc>` conversion shared by every table in
//! this crate.

use chrono::{DateTime, Utc};

pub fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

pub fn to_ts_opt(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ts)
}

pub fn from_ts_opt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(from_ts)
}
