use std::time::Duration;

use bson::{doc, Document, Timestamp};
use mongodb::options::{CursorType, FindOneOptions, FindOptions};
use mongodb::sync::Collection;

use crate::error::{Result, RiverError};
use crate::{CMD_COLLECTION, GRIDFS_FILES_SUFFIX, NAMESPACE_KEY, TIMESTAMP_KEY};

// upper bound on how long one getMore blocks awaiting new entries; keeps the
// tail loop responsive to the active flag.
const OPLOG_AWAIT: Duration = Duration::from_secs(2);

pub fn get_latest_ts(coll: &Collection<Document>) -> Result<Timestamp> {
    coll.find_one(
        None,
        FindOneOptions::builder().sort(doc! {"$natural": -1}).build(),
    )?
    .map(|d| d.get_timestamp(TIMESTAMP_KEY).map_err(RiverError::from))
    .unwrap_or(Err(RiverError::EmptyOplog))
}

/// Server-side filter for the tailing cursor: the watched namespace plus the
/// database command namespace, the optional user clause, and everything
/// strictly after the resume point.
pub fn oplog_filter(
    namespace: &str,
    db: &str,
    gridfs: bool,
    user_filter: Option<Document>,
    after: Timestamp,
) -> Document {
    let watched_ns = if gridfs {
        format!("{}{}", namespace, GRIDFS_FILES_SUFFIX)
    } else {
        namespace.to_string()
    };
    let command_ns = format!("{}.{}", db, CMD_COLLECTION);

    let mut clauses = vec![doc! {
        "$or": [
            { NAMESPACE_KEY: watched_ns },
            { NAMESPACE_KEY: command_ns },
        ]
    }];
    if let Some(user) = user_filter {
        clauses.push(user);
    }
    clauses.push(doc! { TIMESTAMP_KEY: { "$gt": after } });
    doc! { "$and": clauses }
}

pub fn tail_options() -> FindOptions {
    FindOptions::builder()
        .sort(doc! {"$natural": 1})
        .cursor_type(CursorType::TailableAwait)
        .max_await_time(OPLOG_AWAIT)
        .build()
}
