use bson::Timestamp;
use chrono::{DateTime, Utc};

pub fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.time as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
