//! Batching consumer: drains the event queue, translates events into bulk
//! actions, applies the user transformation and checkpoints progress inside
//! the same bulk request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bson::{Document, Timestamp};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RiverConfig;
use crate::error::{Result, RiverError};
use crate::event::{ChangeEvent, GridFsFile, Operation, Payload};
use crate::queue::EventQueue;
use crate::sink::{document_to_json, BulkAction, SinkClient};
use crate::transform::{ScriptContext, Transformer};
use crate::DROP_COMMAND;

pub struct Indexer {
    config: Arc<RiverConfig>,
    queue: EventQueue,
    sink: Arc<dyn SinkClient>,
    checkpoints: Arc<CheckpointStore>,
    transformer: Arc<dyn Transformer>,
    active: Arc<AtomicBool>,
    namespace: String,
}

#[derive(Default)]
struct Batch {
    actions: Vec<BulkAction>,
    inserted: usize,
    updated: usize,
    deleted: usize,
    last_ts: Option<Timestamp>,
}

impl Batch {
    fn note_ts(&mut self, ts: Timestamp) {
        self.last_ts = Some(match self.last_ts {
            Some(prev) => prev.max(ts),
            None => ts,
        });
    }

    fn reset(&mut self) {
        self.actions.clear();
        self.inserted = 0;
        self.updated = 0;
        self.deleted = 0;
    }
}

impl Indexer {
    pub fn new(
        config: Arc<RiverConfig>,
        queue: EventQueue,
        sink: Arc<dyn SinkClient>,
        checkpoints: Arc<CheckpointStore>,
        transformer: Arc<dyn Transformer>,
        active: Arc<AtomicBool>,
    ) -> Indexer {
        let namespace = config.oplog_namespace();
        Indexer {
            config,
            queue,
            sink,
            checkpoints,
            transformer,
            active,
            namespace,
        }
    }

    /// Drain the queue until interrupted. Events buffered but not yet
    /// submitted when the loop exits are discarded; they replay from the
    /// stored checkpoint on the next start.
    pub fn run(&self) {
        while self.active.load(Ordering::Relaxed) {
            match self.index_batch() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => error!(error = %e, "indexer iteration failed"),
            }
        }
        debug!("indexer stopped");
    }

    /// Accumulate one batch and submit it. Returns Ok(false) on interruption.
    fn index_batch(&self) -> Result<bool> {
        let first = match self.queue.take() {
            Ok(event) => event,
            Err(RiverError::Interrupted) => return Ok(false),
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let mut batch = Batch::default();
        self.apply_event(first, &mut batch);
        while batch.actions.len() < self.config.get_bulk_size() {
            match self.queue.poll(self.config.get_bulk_timeout())? {
                Some(event) => self.apply_event(event, &mut batch),
                None => break,
            }
        }

        if let Some(last_ts) = batch.last_ts {
            batch
                .actions
                .push(self.checkpoints.checkpoint_action(&self.namespace, last_ts));
        }
        if batch.actions.is_empty() {
            return Ok(true);
        }

        match self.sink.bulk(&batch.actions) {
            Ok(summary) => {
                for failure in &summary.failures {
                    warn!(id = %failure.id, reason = %failure.reason, "bulk item failed");
                }
            }
            Err(e) => {
                // the checkpoint did not advance, the batch replays after
                // the slurper repositions.
                warn!(error = %e, "failed to execute bulk");
                return Ok(true);
            }
        }
        self.log_statistics(&batch, started);
        Ok(true)
    }

    fn apply_event(&self, event: ChangeEvent, batch: &mut Batch) {
        batch.note_ts(event.ts);
        if event.id.is_none() && event.op != Operation::Command {
            warn!(op = %event.op, "cannot get object id, skipping event");
            return;
        }
        match event.payload {
            Payload::Attachment(file) => self.apply_attachment(event.op, file, batch),
            Payload::Document(doc) | Payload::Command(doc) => {
                self.apply_document(event.op, event.id, doc, batch)
            }
        }
    }

    fn apply_document(
        &self,
        op: Operation,
        id: Option<String>,
        mut doc: Document,
        batch: &mut Batch,
    ) {
        let include_field = self.config.get_include_collection();
        if !include_field.is_empty() {
            doc.insert(include_field.to_string(), self.config.get_collection());
        }

        let mut ctx = ScriptContext::new(doc, op, id);
        let snapshot = ctx.clone();
        if let Err(e) = self.transformer.apply(&mut ctx) {
            warn!(error = %e, "transformation script failed, keeping original event");
            ctx = snapshot;
        }
        if ctx.ignore {
            debug!(id = ?ctx.id, "event ignored by script");
            return;
        }

        let op = if ctx.deleted {
            Operation::Delete
        } else {
            ctx.operation
        };
        let index = ctx
            .index
            .clone()
            .unwrap_or_else(|| self.config.get_index().to_string());
        let doc_type = ctx
            .doc_type
            .clone()
            .unwrap_or_else(|| self.config.get_doc_type().to_string());

        if op == Operation::Command {
            self.apply_command(&ctx.document, &index, &doc_type, batch);
            return;
        }

        let id = match ctx.id.clone() {
            Some(id) => id,
            None => {
                warn!(op = %op, "script produced no document id, skipping event");
                return;
            }
        };
        let routing = ctx.routing.clone();
        let parent = ctx.parent.clone();
        match op {
            Operation::Insert => {
                batch.actions.push(BulkAction::Index {
                    index,
                    doc_type,
                    id,
                    routing,
                    parent,
                    source: document_to_json(&ctx.document),
                });
                batch.inserted += 1;
            }
            Operation::Update => {
                batch.actions.push(BulkAction::Delete {
                    index: index.clone(),
                    doc_type: doc_type.clone(),
                    id: id.clone(),
                    routing: routing.clone(),
                    parent: parent.clone(),
                });
                batch.actions.push(BulkAction::Index {
                    index,
                    doc_type,
                    id,
                    routing,
                    parent,
                    source: document_to_json(&ctx.document),
                });
                batch.updated += 1;
            }
            Operation::Delete => {
                batch.actions.push(BulkAction::Delete {
                    index,
                    doc_type,
                    id,
                    routing,
                    parent,
                });
                batch.deleted += 1;
            }
            Operation::Command => (),
        }
    }

    fn apply_attachment(&self, op: Operation, file: GridFsFile, batch: &mut Batch) {
        let mut source = file.to_source();
        let include_field = self.config.get_include_collection();
        if !include_field.is_empty() {
            if let Some(map) = source.as_object_mut() {
                map.insert(
                    include_field.to_string(),
                    json!(self.config.get_collection()),
                );
            }
        }
        let index = self.config.get_index().to_string();
        let doc_type = self.config.get_doc_type().to_string();
        info!(id = %file.id, filename = %file.filename, index, "adding attachment");

        if op == Operation::Update {
            batch.actions.push(BulkAction::Delete {
                index: index.clone(),
                doc_type: doc_type.clone(),
                id: file.id.clone(),
                routing: None,
                parent: None,
            });
            batch.updated += 1;
        } else {
            batch.inserted += 1;
        }
        batch.actions.push(BulkAction::Index {
            index,
            doc_type,
            id: file.id,
            routing: None,
            parent: None,
            source,
        });
    }

    /// Observe a `drop <collection>` command: clear the pending actions,
    /// refresh the index and reinstall the type mapping, keeping any
    /// customized definition. Earlier checkpoints are untouched.
    fn apply_command(&self, doc: &Document, index: &str, doc_type: &str, batch: &mut Batch) {
        if doc.get_str(DROP_COMMAND).ok() != Some(self.config.get_collection()) {
            debug!(command = ?doc, "database command observed");
            return;
        }
        if !self.config.is_drop_collection() {
            info!(index, doc_type, "ignoring drop collection request, the option is disabled");
            return;
        }
        info!(index, doc_type, "drop collection request");
        batch.reset();
        if let Err(e) = self.reinstall_mapping(index, doc_type) {
            warn!(error = %e, "failed to reinstall mapping after drop");
        }
    }

    fn reinstall_mapping(&self, index: &str, doc_type: &str) -> Result<()> {
        self.sink.refresh(index)?;
        if let Some(mapping) = self.sink.get_mapping(index, doc_type)? {
            self.sink.delete_mapping(index, doc_type)?;
            self.sink.put_mapping(index, doc_type, &mapping)?;
        }
        Ok(())
    }

    fn log_statistics(&self, batch: &Batch, started: Instant) {
        let total = batch.inserted + batch.updated + batch.deleted;
        let elapsed = started.elapsed();
        let per_second = if elapsed.as_secs_f64() > 0.0 {
            (total as f64 / elapsed.as_secs_f64()) as u64
        } else {
            total as u64
        };
        info!(
            total,
            inserted = batch.inserted,
            updated = batch.updated,
            deleted = batch.deleted,
            elapsed_ms = elapsed.as_millis() as u64,
            per_second,
            "indexed documents"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::transform::NoopTransformer;
    use bson::doc;
    use serde_json::Value;

    fn test_config(index_extra: &str) -> Arc<RiverConfig> {
        let toml = format!(
            r#"
            [mongo]
            uri = "mongodb://localhost:27017"
            db = "shop"
            collection = "orders"

            [index]
            name = "shop"
            {}

            [elasticsearch]
            url = "http://localhost:9200"
            "#,
            index_extra
        );
        Arc::new(RiverConfig::from_toml(&toml).unwrap())
    }

    fn build_indexer(
        config: Arc<RiverConfig>,
        sink: Arc<MemorySink>,
        transformer: Arc<dyn Transformer>,
    ) -> (Indexer, EventQueue) {
        let active = Arc::new(AtomicBool::new(true));
        let queue = EventQueue::new(-1, active.clone());
        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", "mongodb"));
        let indexer = Indexer::new(config, queue.clone(), sink, checkpoints, transformer, active);
        (indexer, queue)
    }

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn insert(id: &str, time: u32, doc: Document) -> ChangeEvent {
        ChangeEvent::document(Some(id.to_string()), ts(time), Operation::Insert, doc)
    }

    fn checkpoint_of(sink: &MemorySink) -> Option<Value> {
        sink.document("_river", "mongodb", "shop.orders")
            .and_then(|doc| doc.pointer("/mongodb/_last_ts").cloned())
    }

    #[test]
    fn test_fresh_batch_indexes_documents() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue.put(insert("a", 1, doc! {"_id": "a"})).unwrap();
        queue.put(insert("b", 2, doc! {"_id": "b"})).unwrap();
        queue.put(insert("c", 3, doc! {"_id": "c"})).unwrap();

        assert!(indexer.index_batch().unwrap());
        assert_eq!(sink.ids("shop", "orders"), vec!["a", "b", "c"]);
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 3, "i": 0}));
        assert_eq!(sink.bulk_count(), 1);
    }

    #[test]
    fn test_update_produces_delete_then_index() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, _queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        let mut batch = Batch::default();
        indexer.apply_event(
            ChangeEvent::document(
                Some("x".to_string()),
                ts(4),
                Operation::Update,
                doc! {"_id": "x", "color": "blue"},
            ),
            &mut batch,
        );
        assert_eq!(batch.actions.len(), 2);
        assert!(matches!(&batch.actions[0], BulkAction::Delete { id, .. } if id == "x"));
        assert!(
            matches!(&batch.actions[1], BulkAction::Index { id, source, .. } if id == "x" && source["color"] == "blue")
        );
        assert_eq!(batch.updated, 1);
    }

    #[test]
    fn test_delete_event_removes_document() {
        let sink = Arc::new(MemorySink::new());
        sink.put_document("shop", "orders", "a", json!({"_id": "a"}));
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue
            .put(ChangeEvent::document(
                Some("a".to_string()),
                ts(5),
                Operation::Delete,
                doc! {"_id": "a"},
            ))
            .unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.document("shop", "orders", "a").is_none());
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 5, "i": 0}));
    }

    #[test]
    fn test_missing_id_skips_but_checkpoint_advances() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue
            .put(ChangeEvent::document(
                None,
                ts(9),
                Operation::Insert,
                doc! {"color": "red"},
            ))
            .unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.ids("shop", "orders").is_empty());
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 9, "i": 0}));
    }

    struct IgnoreAll;
    impl Transformer for IgnoreAll {
        fn apply(&self, ctx: &mut ScriptContext) -> Result<()> {
            ctx.ignore = true;
            Ok(())
        }
    }

    #[test]
    fn test_ignore_directive_still_advances_checkpoint() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) = build_indexer(test_config(""), sink.clone(), Arc::new(IgnoreAll));
        queue.put(insert("a", 7, doc! {"_id": "a"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.ids("shop", "orders").is_empty());
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 7, "i": 0}));
    }

    struct MarkDeleted;
    impl Transformer for MarkDeleted {
        fn apply(&self, ctx: &mut ScriptContext) -> Result<()> {
            ctx.deleted = true;
            Ok(())
        }
    }

    #[test]
    fn test_deleted_directive_overrides_operation() {
        let sink = Arc::new(MemorySink::new());
        sink.put_document("shop", "orders", "a", json!({"_id": "a"}));
        let (indexer, queue) = build_indexer(test_config(""), sink.clone(), Arc::new(MarkDeleted));
        queue.put(insert("a", 8, doc! {"_id": "a"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.document("shop", "orders", "a").is_none());
    }

    struct Failing;
    impl Transformer for Failing {
        fn apply(&self, ctx: &mut ScriptContext) -> Result<()> {
            ctx.ignore = true; // must not survive the failure
            Err(RiverError::BsonValue {
                key: "ctx".to_string(),
                val: "boom".to_string(),
            })
        }
    }

    #[test]
    fn test_script_error_keeps_original_event() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) = build_indexer(test_config(""), sink.clone(), Arc::new(Failing));
        queue.put(insert("a", 2, doc! {"_id": "a", "v": 1})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert_eq!(sink.document("shop", "orders", "a").unwrap()["v"], 1);
    }

    struct Reroute;
    impl Transformer for Reroute {
        fn apply(&self, ctx: &mut ScriptContext) -> Result<()> {
            ctx.index = Some("other".to_string());
            ctx.routing = Some("r1".to_string());
            ctx.id = Some("renamed".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_script_overrides_index_routing_and_id() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, _queue) = build_indexer(test_config(""), sink.clone(), Arc::new(Reroute));
        let mut batch = Batch::default();
        indexer.apply_event(insert("a", 3, doc! {"_id": "a"}), &mut batch);
        match &batch.actions[0] {
            BulkAction::Index {
                index, id, routing, ..
            } => {
                assert_eq!(index, "other");
                assert_eq!(id, "renamed");
                assert_eq!(routing.as_deref(), Some("r1"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_include_collection_injection() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) = build_indexer(
            test_config(r#"include_collection = "_collection""#),
            sink.clone(),
            Arc::new(NoopTransformer),
        );
        queue.put(insert("a", 1, doc! {"_id": "a"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert_eq!(
            sink.document("shop", "orders", "a").unwrap()["_collection"],
            "orders"
        );
    }

    #[test]
    fn test_drop_command_resets_pending_actions() {
        let sink = Arc::new(MemorySink::new());
        sink.put_mapping("shop", "orders", &json!({"orders": {"properties": {"color": {"type": "string"}}}}))
            .unwrap();
        let (indexer, queue) = build_indexer(
            test_config("drop_collection = true"),
            sink.clone(),
            Arc::new(NoopTransformer),
        );
        queue.put(insert("a", 1, doc! {"_id": "a"})).unwrap();
        queue
            .put(ChangeEvent::command(ts(2), doc! {"drop": "orders"}))
            .unwrap();

        assert!(indexer.index_batch().unwrap());
        // the pending insert was discarded, only the checkpoint was written.
        assert!(sink.ids("shop", "orders").is_empty());
        assert_eq!(sink.refresh_count(), 1);
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 2, "i": 0}));
        // customized mapping definition survived the drop.
        let mapping = sink.mapping_of("shop", "orders").unwrap();
        assert_eq!(mapping["orders"]["properties"]["color"]["type"], "string");
    }

    #[test]
    fn test_drop_command_ignored_when_policy_disabled() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue.put(insert("a", 1, doc! {"_id": "a"})).unwrap();
        queue
            .put(ChangeEvent::command(ts(2), doc! {"drop": "orders"}))
            .unwrap();

        assert!(indexer.index_batch().unwrap());
        assert_eq!(sink.ids("shop", "orders"), vec!["a"]);
        assert_eq!(sink.refresh_count(), 0);
    }

    #[test]
    fn test_unrelated_command_is_observed_only() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) = build_indexer(
            test_config("drop_collection = true"),
            sink.clone(),
            Arc::new(NoopTransformer),
        );
        queue
            .put(ChangeEvent::command(ts(4), doc! {"create": "other"}))
            .unwrap();
        assert!(indexer.index_batch().unwrap());
        assert_eq!(sink.refresh_count(), 0);
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 4, "i": 0}));
    }

    #[test]
    fn test_attachment_event_serializes_envelope() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        let file = GridFsFile {
            id: "f1".to_string(),
            filename: "hello.txt".to_string(),
            content_type: "text/plain".to_string(),
            md5: "5d41402abc4b2a76b9719d911017c592".to_string(),
            length: 5,
            chunk_size: 261120,
            data: b"hello".to_vec(),
        };
        queue
            .put(ChangeEvent::attachment(ts(6), Operation::Insert, file))
            .unwrap();
        assert!(indexer.index_batch().unwrap());
        let doc = sink.document("shop", "orders", "f1").unwrap();
        assert_eq!(doc["content"], "aGVsbG8=");
        assert_eq!(doc["filename"], "hello.txt");
        assert_eq!(doc["length"], 5);
    }

    #[test]
    fn test_transport_failure_leaves_checkpoint_untouched() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        sink.fail_next_bulk();
        queue.put(insert("a", 1, doc! {"_id": "a"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.ids("shop", "orders").is_empty());
        assert!(checkpoint_of(&sink).is_none());
    }

    #[test]
    fn test_per_item_failure_advances_past_item() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_id("bad");
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue.put(insert("bad", 1, doc! {"_id": "bad"})).unwrap();
        queue.put(insert("good", 2, doc! {"_id": "good"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert!(sink.document("shop", "orders", "bad").is_none());
        assert!(sink.document("shop", "orders", "good").is_some());
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 2, "i": 0}));
    }

    #[test]
    fn test_checkpoint_tracks_batch_maximum() {
        let sink = Arc::new(MemorySink::new());
        let (indexer, queue) =
            build_indexer(test_config(""), sink.clone(), Arc::new(NoopTransformer));
        queue.put(insert("b", 5, doc! {"_id": "b"})).unwrap();
        queue.put(insert("a", 3, doc! {"_id": "a"})).unwrap();
        assert!(indexer.index_batch().unwrap());
        assert_eq!(checkpoint_of(&sink).unwrap(), json!({"t": 5, "i": 0}));
    }
}
