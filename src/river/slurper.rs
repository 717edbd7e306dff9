//! Oplog tailing producer.
//!
//! One slurper owns one source connection (per replica set, or per shard in a
//! sharded topology) and turns raw oplog entries into normalized change
//! events on the queue. It never propagates errors to the supervisor: it
//! either heals by reconnecting or stops its own thread on fatal conditions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::FindOptions;
use mongodb::sync::{Client, Collection, Database};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RiverConfig;
use crate::error::{Result, RiverError};
use crate::event::{id_to_string, ChangeEvent, Operation};
use crate::queue::EventQueue;
use crate::river::oplog::{strip_excluded, OplogEntry};
use crate::river::{bootstrap, gridfs, oplog_helper, time_helper};
use crate::{ADMIN_DB, GRIDFS_CHUNKS_SUFFIX, GRIDFS_FILES_SUFFIX, ID_FIELD, OPLOG_COLL, OPLOG_DB};

// pause between outer iterations, avoids tight reconnect spins.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct Slurper {
    label: String,
    uri: String,
    fallback_uri: Option<String>,
    config: Arc<RiverConfig>,
    queue: EventQueue,
    checkpoints: Arc<CheckpointStore>,
    active: Arc<AtomicBool>,
}

impl Slurper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: String,
        uri: String,
        fallback_uri: Option<String>,
        config: Arc<RiverConfig>,
        queue: EventQueue,
        checkpoints: Arc<CheckpointStore>,
        active: Arc<AtomicBool>,
    ) -> Slurper {
        Slurper {
            label,
            uri,
            fallback_uri,
            config,
            queue,
            checkpoints,
            active,
        }
    }

    /// Tail the oplog until interrupted. Transient driver errors restart the
    /// outer loop with a fresh connection and cursor position; a missing
    /// oplog collection or a local credential failure stops this slurper.
    pub fn run(&self) {
        let namespace = self.config.oplog_namespace();
        while self.active.load(Ordering::Relaxed) {
            match self.tail_once(&namespace) {
                Ok(()) => {
                    // the tailing cursor died without an error (e.g. the
                    // oplog rolled over), reopen it from the checkpoint.
                }
                Err(RiverError::Interrupted) | Err(RiverError::QueueDisconnected) => break,
                Err(e @ RiverError::OplogMissing) | Err(e @ RiverError::Auth { .. }) => {
                    error!(shard = %self.label, error = %e, "slurper cannot continue");
                    break;
                }
                Err(e) => {
                    error!(shard = %self.label, error = %e, "oplog tailing failed, reconnecting");
                }
            }
            std::thread::sleep(RECONNECT_DELAY);
        }
        debug!(shard = %self.label, "slurper stopped");
    }

    fn tail_once(&self, namespace: &str) -> Result<()> {
        let client = self.connect()?;
        let oplog = Self::oplog_collection(&client)?;
        let db = client.database(self.config.get_db());
        let source_coll = db.collection::<Document>(self.config.get_collection());

        let resume = match self.checkpoints.last_timestamp(namespace)? {
            Some(ts) => ts,
            None => match self.config.get_initial_timestamp() {
                Some(ts) => {
                    info!(shard = %self.label, start = ?ts, "starting from configured initial timestamp");
                    ts
                }
                None => self.bootstrap(&db, &source_coll, &oplog)?,
            },
        };

        let filter = oplog_helper::oplog_filter(
            namespace,
            self.config.get_db(),
            self.config.is_gridfs(),
            self.config.oplog_user_filter()?,
            resume,
        );
        info!(
            shard = %self.label,
            start = ?resume,
            start_time = %time_helper::to_datetime(resume),
            "tailing oplog"
        );
        let cursor = oplog.find(filter, oplog_helper::tail_options())?;
        for entry in cursor {
            if !self.active.load(Ordering::Relaxed) {
                return Err(RiverError::Interrupted);
            }
            self.process_entry(&db, &source_coll, entry?)?;
        }
        warn!(shard = %self.label, "oplog cursor ended");
        Ok(())
    }

    /// Connect with admin credentials, degrading to the local credential
    /// pair when admin authentication fails. A local failure is fatal.
    fn connect(&self) -> Result<Client> {
        let client = Client::with_uri_str(&self.uri)?;
        match client.database(ADMIN_DB).run_command(doc! {"ping": 1}, None) {
            Ok(_) => Ok(client),
            Err(e) if is_auth_error(&e) => match &self.fallback_uri {
                Some(fallback) => {
                    warn!(shard = %self.label, "admin authentication failed, trying local credentials");
                    let client = Client::with_uri_str(fallback)?;
                    client
                        .database(OPLOG_DB)
                        .run_command(doc! {"ping": 1}, None)
                        .map_err(|e| RiverError::Auth {
                            db: OPLOG_DB.to_string(),
                            source: e,
                        })?;
                    Ok(client)
                }
                None => Err(RiverError::Auth {
                    db: ADMIN_DB.to_string(),
                    source: e,
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn oplog_collection(client: &Client) -> Result<Collection<Document>> {
        let local = client.database(OPLOG_DB);
        let names = local.list_collection_names(None)?;
        if !names.iter().any(|name| name == OPLOG_COLL) {
            return Err(RiverError::OplogMissing);
        }
        Ok(local.collection(OPLOG_COLL))
    }

    /// No checkpoint and no configured start point: capture the current
    /// oplog head, stream the whole collection as inserts stamped with it,
    /// then tail strictly after it.
    fn bootstrap(
        &self,
        db: &Database,
        source_coll: &Collection<Document>,
        oplog: &Collection<Document>,
    ) -> Result<bson::Timestamp> {
        let start = oplog_helper::get_latest_ts(oplog)?;
        info!(
            shard = %self.label,
            start = ?start,
            "no checkpoint found, bootstrapping full collection"
        );
        let count = if self.config.is_gridfs() {
            bootstrap::stream_gridfs_bucket(db, self.config.get_collection(), &self.queue, start)?
        } else {
            bootstrap::stream_collection(
                source_coll,
                &self.queue,
                start,
                self.config.get_exclude_fields(),
                self.config.get_bootstrap_concurrent(),
            )?
        };
        info!(shard = %self.label, count, "full collection bootstrap complete");
        Ok(start)
    }

    fn process_entry(
        &self,
        db: &Database,
        source_coll: &Collection<Document>,
        raw: Document,
    ) -> Result<()> {
        let entry = match OplogEntry::from_doc(raw)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if entry.from_migrate {
            debug!(shard = %self.label, ns = %entry.ns, "balancer migration entry, skipped");
            return Ok(());
        }
        // chunk writes are covered by the .files sentinel entry.
        if entry.ns.ends_with(GRIDFS_CHUNKS_SUFFIX) {
            return Ok(());
        }

        if entry.op == Operation::Command {
            debug!(shard = %self.label, command = ?entry.obj, "command entry");
            return self.queue.put(ChangeEvent::command(entry.ts, entry.obj));
        }

        let raw_id = entry.object_id().cloned();
        if self.config.is_gridfs()
            && entry.ns.ends_with(GRIDFS_FILES_SUFFIX)
            && matches!(entry.op, Operation::Insert | Operation::Update)
        {
            if let Some(id) = &raw_id {
                match gridfs::find_file(db, self.config.get_collection(), id)? {
                    Some(file) => {
                        info!(shard = %self.label, id = %file.id, filename = %file.filename, "caught file");
                        return self
                            .queue
                            .put(ChangeEvent::attachment(entry.ts, entry.op, file));
                    }
                    None => {
                        warn!(shard = %self.label, id = %id_to_string(id), "cannot find file for oplog entry");
                    }
                }
            }
        }

        if entry.op == Operation::Update {
            return self.fan_out_update(source_coll, &entry);
        }

        let mut doc = entry.obj;
        strip_excluded(&mut doc, self.config.get_exclude_fields());
        let id = raw_id.as_ref().map(id_to_string);
        self.queue
            .put(ChangeEvent::document(id, entry.ts, entry.op, doc))
    }

    /// Oplog update entries carry the mutation, not the new document:
    /// re-query the collection with the update selector and emit the current
    /// state of every matched document. Documents deleted since the entry
    /// was written no longer match and silently drop; this is latest-state
    /// replication, not a point-in-time mutation log.
    fn fan_out_update(&self, source_coll: &Collection<Document>, entry: &OplogEntry) -> Result<()> {
        let selector = match &entry.update_spec {
            Some(selector) => selector.clone(),
            None => {
                warn!(shard = %self.label, "update entry without selector, skipped");
                return Ok(());
            }
        };
        let options = FindOptions::builder()
            .projection(self.config.exclude_projection())
            .build();
        let cursor = source_coll.find(selector, options)?;
        for doc in cursor {
            let doc = doc?;
            let id = doc.get(ID_FIELD).map(id_to_string);
            self.queue
                .put(ChangeEvent::document(id, entry.ts, Operation::Update, doc))?;
        }
        Ok(())
    }
}

fn is_auth_error(error: &MongoError) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Authentication { .. } => true,
        // 13 Unauthorized, 18 AuthenticationFailed
        ErrorKind::Command(command) => command.code == 13 || command.code == 18,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::sink::MemorySink;
    use bson::Timestamp;

    // the insert/delete/command/skip paths never talk to the server, so a
    // lazy, never-connected client handle is enough to exercise them.
    fn test_slurper(config_extra: &str) -> (Slurper, EventQueue, Database, Collection<Document>) {
        let toml = format!(
            r#"
            [mongo]
            uri = "mongodb://localhost:27017"
            db = "shop"
            collection = "orders"
            {}

            [index]
            name = "shop"

            [elasticsearch]
            url = "http://localhost:9200"
            "#,
            config_extra
        );
        let config = Arc::new(crate::config::RiverConfig::from_toml(&toml).unwrap());
        let active = Arc::new(AtomicBool::new(true));
        let queue = EventQueue::new(-1, active.clone());
        let checkpoints = Arc::new(CheckpointStore::new(
            Arc::new(MemorySink::new()),
            "_river",
            "mongodb",
        ));
        let client = Client::with_uri_str("mongodb://localhost:27017").unwrap();
        let db = client.database("shop");
        let coll = db.collection::<Document>("orders");
        let slurper = Slurper::new(
            "main".to_string(),
            "mongodb://localhost:27017".to_string(),
            None,
            config,
            queue.clone(),
            checkpoints,
            active,
        );
        (slurper, queue, db, coll)
    }

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    #[test]
    fn test_insert_entry_becomes_document_event() {
        let (slurper, queue, db, coll) = test_slurper("");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(3),
                    "op": "i",
                    "ns": "shop.orders",
                    "o": { "_id": "a", "color": "red" },
                },
            )
            .unwrap();
        let event = queue.take().unwrap();
        assert_eq!(event.id.as_deref(), Some("a"));
        assert_eq!(event.ts, ts(3));
        assert_eq!(event.op, Operation::Insert);
        match event.payload {
            Payload::Document(doc) => assert_eq!(doc.get_str("color").unwrap(), "red"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_insert_entry_strips_excluded_fields() {
        let (slurper, queue, db, coll) = test_slurper(r#"exclude_fields = ["secret"]"#);
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(4),
                    "op": "i",
                    "ns": "shop.orders",
                    "o": { "_id": "a", "secret": "x", "keep": 1 },
                },
            )
            .unwrap();
        match queue.take().unwrap().payload {
            Payload::Document(doc) => {
                assert!(!doc.contains_key("secret"));
                assert_eq!(doc.get_i32("keep").unwrap(), 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_delete_entry_becomes_delete_event() {
        let (slurper, queue, db, coll) = test_slurper("");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(5),
                    "op": "d",
                    "ns": "shop.orders",
                    "o": { "_id": "a" },
                },
            )
            .unwrap();
        let event = queue.take().unwrap();
        assert_eq!(event.op, Operation::Delete);
        assert_eq!(event.id.as_deref(), Some("a"));
    }

    #[test]
    fn test_command_entry_becomes_command_event() {
        let (slurper, queue, db, coll) = test_slurper("");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(6),
                    "op": "c",
                    "ns": "shop.$cmd",
                    "o": { "drop": "orders" },
                },
            )
            .unwrap();
        let event = queue.take().unwrap();
        assert_eq!(event.op, Operation::Command);
        assert!(event.id.is_none());
        match event.payload {
            Payload::Command(doc) => assert_eq!(doc.get_str("drop").unwrap(), "orders"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_from_migrate_entry_is_suppressed() {
        let (slurper, queue, db, coll) = test_slurper("");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(7),
                    "op": "i",
                    "ns": "shop.orders",
                    "o": { "_id": "a" },
                    "fromMigrate": true,
                },
            )
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_chunks_entry_is_suppressed() {
        let (slurper, queue, db, coll) = test_slurper("gridfs = true");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(8),
                    "op": "i",
                    "ns": "shop.fs.chunks",
                    "o": { "_id": "a", "files_id": "f", "n": 0 },
                },
            )
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_noop_entry_is_suppressed() {
        let (slurper, queue, db, coll) = test_slurper("");
        slurper
            .process_entry(
                &db,
                &coll,
                doc! {
                    "ts": ts(9),
                    "op": "n",
                    "ns": "shop.orders",
                    "o": { "msg": "periodic noop" },
                },
            )
            .unwrap();
        assert!(queue.is_empty());
    }
}
