//! Sink client seam.
//!
//! The river core talks to the target cluster only through [`SinkClient`];
//! [`EsClient`] is the HTTP implementation and [`MemorySink`] an in-process
//! one used by tests and dry runs.

mod http;
mod memory;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bson::{Bson, Document};
use serde_json::{json, Map, Value};

use crate::error::Result;

pub use http::EsClient;
pub use memory::MemorySink;

/// One action inside a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    Index {
        index: String,
        doc_type: String,
        id: String,
        routing: Option<String>,
        parent: Option<String>,
        source: Value,
    },
    Delete {
        index: String,
        doc_type: String,
        id: String,
        routing: Option<String>,
        parent: Option<String>,
    },
}

impl BulkAction {
    pub fn id(&self) -> &str {
        match self {
            BulkAction::Index { id, .. } => id,
            BulkAction::Delete { id, .. } => id,
        }
    }
}

/// One failed item inside an otherwise accepted bulk request.
#[derive(Debug, Clone)]
pub struct BulkItemFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of a bulk request that reached the cluster.
#[derive(Debug, Clone, Default)]
pub struct BulkSummary {
    pub items: usize,
    pub failures: Vec<BulkItemFailure>,
}

impl BulkSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Operations the river core requires from the target cluster.
///
/// `create_index` absorbs "already exists" into Ok and reports a recovering
/// cluster as [`crate::RiverError::ClusterNotReady`]; a bulk transport
/// failure is an Err while per-item failures come back in the summary.
pub trait SinkClient: Send + Sync {
    fn create_index(&self, index: &str) -> Result<()>;
    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &Value) -> Result<()>;
    fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()>;
    fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<Value>>;
    fn refresh(&self, index: &str) -> Result<()>;
    fn get_source(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>>;
    fn bulk(&self, actions: &[BulkAction]) -> Result<BulkSummary>;
}

/// Convert a bson document into the JSON shape written to the sink.
///
/// ObjectIds become hex strings, datetimes RFC 3339 strings, binaries base64
/// and timestamps `{t, i}` objects; non-representable types degrade to null.
pub fn document_to_json(doc: &Document) -> Value {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        map.insert(key.clone(), bson_to_json(value));
    }
    Value::Object(map)
}

fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => document_to_json(doc),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null => Value::Null,
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| json!(dt.timestamp_millis())),
        Bson::Timestamp(ts) => json!({"t": ts.time, "i": ts.increment}),
        Bson::Binary(bin) => Value::String(BASE64.encode(&bin.bytes)),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::RegularExpression(re) => Value::String(re.pattern.clone()),
        Bson::Symbol(s) => Value::String(s.clone()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;
    use bson::spec::BinarySubtype;
    use bson::{doc, Binary, Timestamp};

    #[test]
    fn test_document_to_json_scalars() {
        let oid = ObjectId::parse_str("60a74505d6daac52c416bb3f").unwrap();
        let source = document_to_json(&doc! {
            "_id": oid,
            "name": "ada",
            "age": 36_i32,
            "visits": 9_000_000_000_i64,
            "score": 1.5,
            "active": true,
            "note": Bson::Null,
        });
        assert_eq!(source["_id"], "60a74505d6daac52c416bb3f");
        assert_eq!(source["name"], "ada");
        assert_eq!(source["age"], 36);
        assert_eq!(source["visits"], 9_000_000_000_i64);
        assert_eq!(source["score"], 1.5);
        assert_eq!(source["active"], true);
        assert_eq!(source["note"], Value::Null);
    }

    #[test]
    fn test_document_to_json_nested_and_binary() {
        let source = document_to_json(&doc! {
            "tags": ["a", "b"],
            "inner": { "x": 1 },
            "raw": Binary { subtype: BinarySubtype::Generic, bytes: b"hello".to_vec() },
            "ts": Timestamp { time: 7, increment: 3 },
        });
        assert_eq!(source["tags"], json!(["a", "b"]));
        assert_eq!(source["inner"]["x"], 1);
        assert_eq!(source["raw"], "aGVsbG8=");
        assert_eq!(source["ts"], json!({"t": 7, "i": 3}));
    }
}
