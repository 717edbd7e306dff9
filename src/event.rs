//! Change events produced by slurpers and consumed by the indexer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bson::{Bson, Document, Timestamp};
use serde_json::{json, Value};

/// Operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Command,
}

impl Operation {
    /// Map an oplog `op` value. Returns None for noop and unknown operations.
    pub fn from_oplog(op: &str) -> Option<Operation> {
        match op {
            "i" => Some(Operation::Insert),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Delete),
            "c" => Some(Operation::Command),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Command => "command",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GridFS file assembled from the `.files` metadata document and its
/// ordered `.chunks` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GridFsFile {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub md5: String,
    pub length: i64,
    pub chunk_size: i64,
    pub data: Vec<u8>,
}

impl GridFsFile {
    /// Serialize the attachment envelope written to the sink.
    pub fn to_source(&self) -> Value {
        json!({
            "content": BASE64.encode(&self.data),
            "filename": self.filename,
            "contentType": self.content_type,
            "md5": self.md5,
            "length": self.length,
            "chunkSize": self.chunk_size,
        })
    }
}

/// Event payload: a plain document, a GridFS attachment or a database command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Document(Document),
    Attachment(GridFsFile),
    Command(Document),
}

/// One normalized oplog event on the queue.
///
/// Events produced by a single slurper preserve oplog order; `ts` is always
/// present so the indexer can checkpoint past every event it has seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: Option<String>,
    pub ts: Timestamp,
    pub op: Operation,
    pub payload: Payload,
}

impl ChangeEvent {
    pub fn document(id: Option<String>, ts: Timestamp, op: Operation, doc: Document) -> Self {
        ChangeEvent {
            id,
            ts,
            op,
            payload: Payload::Document(doc),
        }
    }

    pub fn attachment(ts: Timestamp, op: Operation, file: GridFsFile) -> Self {
        ChangeEvent {
            id: Some(file.id.clone()),
            ts,
            op,
            payload: Payload::Attachment(file),
        }
    }

    pub fn command(ts: Timestamp, doc: Document) -> Self {
        ChangeEvent {
            id: None,
            ts,
            op: Operation::Command,
            payload: Payload::Command(doc),
        }
    }
}

/// Render a document `_id` value as the sink document id.
pub fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(f) => f.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Binary(bin) => BASE64.encode(&bin.bytes),
        other => other.to_string(),
    }
}
