//! Target index bootstrap performed once per river start.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Result, RiverError};
use crate::sink::SinkClient;

/// Create the target index and, for GridFS rivers, install the attachment
/// mapping.
///
/// "Already exists" is absorbed by the sink client. A cluster that has not
/// recovered yet is logged and treated as recoverable: indexing starts anyway
/// and the first bulk either succeeds once recovery completes or is retried
/// by the indexer loop. Any other failure aborts startup.
pub fn ensure_target_ready(
    sink: &dyn SinkClient,
    index: &str,
    doc_type: &str,
    gridfs: bool,
) -> Result<()> {
    match sink.create_index(index) {
        Ok(()) => info!(index, "target index ready"),
        Err(RiverError::ClusterNotReady) => {
            warn!(index, "cluster not recovered yet, indexing anyway");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    if gridfs {
        if let Err(e) = sink.put_mapping(index, doc_type, &gridfs_mapping(doc_type)) {
            warn!(index, doc_type, error = %e, "failed to set attachment mapping");
        }
    }
    Ok(())
}

/// Fixed field mapping for GridFS attachment documents.
pub fn gridfs_mapping(doc_type: &str) -> Value {
    json!({
        (doc_type): {
            "properties": {
                "content": { "type": "attachment" },
                "filename": { "type": "string" },
                "contentType": { "type": "string" },
                "md5": { "type": "string" },
                "length": { "type": "long" },
                "chunkSize": { "type": "long" },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_gridfs_mapping_fields() {
        let mapping = gridfs_mapping("files");
        let properties = &mapping["files"]["properties"];
        assert_eq!(properties["content"]["type"], "attachment");
        assert_eq!(properties["filename"]["type"], "string");
        assert_eq!(properties["contentType"]["type"], "string");
        assert_eq!(properties["md5"]["type"], "string");
        assert_eq!(properties["length"]["type"], "long");
        assert_eq!(properties["chunkSize"]["type"], "long");
    }

    #[test]
    fn test_ensure_target_ready_creates_index() {
        let sink = MemorySink::new();
        ensure_target_ready(&sink, "shop", "orders", false).unwrap();
        assert!(sink.has_index("shop"));
        assert!(sink.mapping_of("shop", "orders").is_none());
    }

    #[test]
    fn test_ensure_target_ready_installs_gridfs_mapping() {
        let sink = MemorySink::new();
        ensure_target_ready(&sink, "files", "fs", true).unwrap();
        let mapping = sink.mapping_of("files", "fs").unwrap();
        assert_eq!(mapping["fs"]["properties"]["content"]["type"], "attachment");
    }

    #[test]
    fn test_ensure_target_ready_is_idempotent() {
        let sink = MemorySink::new();
        ensure_target_ready(&sink, "shop", "orders", false).unwrap();
        ensure_target_ready(&sink, "shop", "orders", false).unwrap();
        assert!(sink.has_index("shop"));
    }
}
