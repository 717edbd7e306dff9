//! Typed view over raw oplog entries.
//!
//! Useful fields of an oplog document:
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type: "i" insert, "u" update, "d" delete, "c" command, "n" noop.
//! ns: The namespace on which to apply the operation. (String)
//! o: The operation applied. (Document)
//! o2: The update query, present only for updates. (Document)
//! fromMigrate: set on entries produced by the shard balancer.

use bson::{Bson, Document, Timestamp};

use crate::error::Result;
use crate::event::Operation;
use crate::{FROM_MIGRATE_KEY, ID_FIELD, NAMESPACE_KEY, OBJECT_KEY, OP_KEY, TIMESTAMP_KEY, UPDATE_KEY};

#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub op: Operation,
    pub ns: String,
    pub obj: Document,
    pub update_spec: Option<Document>,
    pub from_migrate: bool,
}

impl OplogEntry {
    /// Parse a raw oplog document. Returns None for noop entries and
    /// operations this river does not replicate.
    pub fn from_doc(doc: Document) -> Result<Option<OplogEntry>> {
        let op = match Operation::from_oplog(doc.get_str(OP_KEY)?) {
            Some(op) => op,
            None => return Ok(None),
        };
        let update_spec = doc.get_document(UPDATE_KEY).ok().cloned();
        Ok(Some(OplogEntry {
            ts: doc.get_timestamp(TIMESTAMP_KEY)?,
            op,
            ns: doc.get_str(NAMESPACE_KEY)?.to_string(),
            obj: doc.get_document(OBJECT_KEY)?.clone(),
            update_spec,
            from_migrate: doc.get_bool(FROM_MIGRATE_KEY).unwrap_or(false),
        }))
    }

    /// Extract `_id` from `o`, falling back to `o2`.
    pub fn object_id(&self) -> Option<&Bson> {
        self.obj.get(ID_FIELD).or_else(|| {
            self.update_spec
                .as_ref()
                .and_then(|update| update.get(ID_FIELD))
        })
    }
}

/// Remove excluded field paths from a document. Paths may be dotted to reach
/// into embedded documents.
pub fn strip_excluded(doc: &mut Document, excludes: &[String]) {
    for path in excludes {
        remove_path(doc, path);
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Ok(inner) = doc.get_document_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}
