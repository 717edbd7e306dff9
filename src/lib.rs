mod checkpoint;
mod config;
mod error;
mod event;
mod mapping;
mod queue;
pub mod river;
pub mod sink;
mod transform;

const ADMIN_DB: &str = "admin";
const CONFIG_DB: &str = "config";
const OPLOG_DB: &str = "local";
const OPLOG_COLL: &str = "oplog.rs";

// oplog relative keys.
const NAMESPACE_KEY: &str = "ns";
const TIMESTAMP_KEY: &str = "ts";
const OP_KEY: &str = "op";
const OBJECT_KEY: &str = "o";
const UPDATE_KEY: &str = "o2";
const FROM_MIGRATE_KEY: &str = "fromMigrate";

const ID_FIELD: &str = "_id";
const CMD_COLLECTION: &str = "$cmd";
const DROP_COMMAND: &str = "drop";
const GRIDFS_FILES_SUFFIX: &str = ".files";
const GRIDFS_CHUNKS_SUFFIX: &str = ".chunks";

// persistence layout inside the river index.
const RIVER_TYPE: &str = "mongodb";
const LAST_TIMESTAMP_FIELD: &str = "_last_ts";
const STATUS_ID: &str = "_mongodbstatus";
const ENABLED_FIELD: &str = "enabled";

pub use checkpoint::CheckpointStore;
pub use config::{CredentialSource, RiverConfig};
pub use error::{Result, RiverError};
pub use event::{ChangeEvent, GridFsFile, Operation, Payload};
pub use queue::EventQueue;
pub use river::{Indexer, River, Slurper};
pub use sink::{BulkAction, BulkSummary, EsClient, MemorySink, SinkClient};
pub use transform::{NoopTransformer, ScriptContext, Transformer};
