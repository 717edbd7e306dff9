//! Per-namespace checkpoint records and the river status record, both stored
//! in the sink under the river index.

use std::sync::Arc;

use bson::Timestamp;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::sink::{BulkAction, SinkClient};
use crate::{ENABLED_FIELD, LAST_TIMESTAMP_FIELD, RIVER_TYPE, STATUS_ID};

/// Reads and writes the persisted river state.
///
/// Checkpoint writes never happen directly: [`CheckpointStore::checkpoint_action`]
/// returns a bulk action that the indexer appends to the same bulk as the
/// document writes, so a checkpoint can only become durable together with the
/// batch it covers.
pub struct CheckpointStore {
    sink: Arc<dyn SinkClient>,
    river_index: String,
    river_name: String,
}

impl CheckpointStore {
    pub fn new(sink: Arc<dyn SinkClient>, river_index: &str, river_name: &str) -> CheckpointStore {
        CheckpointStore {
            sink,
            river_index: river_index.to_string(),
            river_name: river_name.to_string(),
        }
    }

    /// Highest timestamp whose effects are durable in the sink for the given
    /// namespace, None when the river has never checkpointed it.
    pub fn last_timestamp(&self, namespace: &str) -> Result<Option<Timestamp>> {
        let source = self
            .sink
            .get_source(&self.river_index, &self.river_name, namespace)?;
        let ts = source
            .as_ref()
            .and_then(|doc| doc.pointer(&format!("/{}/{}", RIVER_TYPE, LAST_TIMESTAMP_FIELD)))
            .and_then(timestamp_from_json);
        debug!(namespace, last_ts = ?ts, "read checkpoint");
        Ok(ts)
    }

    /// Bulk action advancing the checkpoint for `namespace` to `ts`.
    pub fn checkpoint_action(&self, namespace: &str, ts: Timestamp) -> BulkAction {
        BulkAction::Index {
            index: self.river_index.clone(),
            doc_type: self.river_name.clone(),
            id: namespace.to_string(),
            routing: None,
            parent: None,
            source: json!({ (RIVER_TYPE): { (LAST_TIMESTAMP_FIELD): timestamp_to_json(ts) } }),
        }
    }

    /// Read the river enable flag. A missing status record means enabled so
    /// that a fresh deployment starts without manual intervention.
    pub fn is_enabled(&self) -> Result<bool> {
        let source = self
            .sink
            .get_source(&self.river_index, &self.river_name, STATUS_ID)?;
        Ok(source
            .as_ref()
            .and_then(|doc| doc.get(ENABLED_FIELD))
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    /// Write the river enable flag.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.sink.bulk(&[BulkAction::Index {
            index: self.river_index.clone(),
            doc_type: self.river_name.clone(),
            id: STATUS_ID.to_string(),
            routing: None,
            parent: None,
            source: json!({ (ENABLED_FIELD): enabled }),
        }])?;
        Ok(())
    }
}

fn timestamp_to_json(ts: Timestamp) -> Value {
    json!({"t": ts.time, "i": ts.increment})
}

fn timestamp_from_json(value: &Value) -> Option<Timestamp> {
    let time = value.get("t")?.as_u64()?;
    let increment = value.get("i")?.as_u64()?;
    Some(Timestamp {
        time: time as u32,
        increment: increment as u32,
    })
}
