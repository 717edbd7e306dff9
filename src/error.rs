#![allow(missing_docs)]

use bson::document::ValueAccessError;
use crossbeam::channel::RecvError;
use mongodb::error::Error as MongoError;
use std::result::Result as StdResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RiverError {
    #[error("Mongodb driver error")]
    Mongo {
        #[from]
        source: MongoError,
    },
    #[error("Authentication failed for database {db:?}")]
    Auth { db: String, source: MongoError },
    #[error("Mongodb document value error")]
    Bson {
        #[from]
        source: ValueAccessError,
    },
    #[error("Invalid doc value for bson, get key: {key:?}, val: {val:?}")]
    BsonValue { key: String, val: String },
    #[error("Invalid filter expression")]
    Filter {
        #[from]
        source: serde_json::Error,
    },
    #[error("Invalid bson produced from filter expression")]
    FilterBson {
        #[from]
        source: bson::ser::Error,
    },
    #[error("Sink transport error")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("Sink request failed with status {status}: {reason}")]
    Sink { status: u16, reason: String },
    #[error("Sink cluster is not ready yet")]
    ClusterNotReady,
    #[error("Can't find collection local.oplog.rs, the source must be a replica set member")]
    OplogMissing,
    #[error("Oplog collection is empty")]
    EmptyOplog,
    #[error("Worker has been interrupted")]
    Interrupted,
    #[error("Event queue disconnected")]
    QueueDisconnected,
    #[error("Receiver task message error")]
    ReceiveStatus {
        #[from]
        source: RecvError,
    },
    #[error("Failed to spawn worker thread")]
    Spawn {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = StdResult<T, RiverError>;
