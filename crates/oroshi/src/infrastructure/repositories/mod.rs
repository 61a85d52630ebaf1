pub mod offline;
pub mod queue;

use chrono::{DateTime, Utc};

pub(crate) fn to_millis(datetime: DateTime<Utc>) -> i64 {
    datetime.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn from_millis_opt(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}
