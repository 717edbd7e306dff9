//! River lifecycle: the supervisor owns every worker handle and passes
//! configuration and queue references downward only.

mod bootstrap;
mod gridfs;
mod oplog_helper;
mod time_helper;
pub mod indexer;
pub mod oplog;
pub mod slurper;

pub use indexer::Indexer;
pub use slurper::Slurper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bson::{doc, Document};
use mongodb::sync::Client;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{CredentialSource, RiverConfig};
use crate::error::Result;
use crate::mapping;
use crate::queue::EventQueue;
use crate::sink::SinkClient;
use crate::transform::Transformer;
use crate::{ADMIN_DB, CONFIG_DB, ID_FIELD};

const STATUS_PERIOD: Duration = Duration::from_secs(1);

/// Supervisor for one river instance.
///
/// `run` is the status loop reacting to the persisted enable flag; `start`
/// and `close` are idempotent and serialized through one lock, so a late
/// status transition can never race a concurrent one. Every `start` creates
/// a fresh worker generation with its own active flag: workers of a closed
/// generation can never resume after the river is re-enabled.
pub struct River {
    config: Arc<RiverConfig>,
    sink: Arc<dyn SinkClient>,
    transformer: Arc<dyn Transformer>,
    checkpoints: Arc<CheckpointStore>,
    state: Mutex<WorkerSet>,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct WorkerSet {
    active: Option<Arc<AtomicBool>>,
    workers: Vec<JoinHandle<()>>,
}

struct SlurperTarget {
    label: String,
    uri: String,
    fallback_uri: Option<String>,
}

impl River {
    pub fn new(
        config: Arc<RiverConfig>,
        sink: Arc<dyn SinkClient>,
        transformer: Arc<dyn Transformer>,
    ) -> River {
        let checkpoints = Arc::new(CheckpointStore::new(
            sink.clone(),
            config.get_river_index(),
            config.get_river_name(),
        ));
        River {
            config,
            sink,
            transformer,
            checkpoints,
            state: Mutex::new(WorkerSet::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_state()
            .active
            .as_ref()
            .map_or(false, |active| active.load(Ordering::Relaxed))
    }

    /// Monitor loop: read the enable flag from the sink about once a second
    /// and start or stop the pipeline on transitions.
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.checkpoints.is_enabled() {
                Ok(true) if !self.is_active() => {
                    info!(river = %self.config.get_river_name(), "about to start river");
                    if let Err(e) = self.start() {
                        error!(error = %e, "failed to start river, disabling");
                        if let Err(e) = self.checkpoints.set_enabled(false) {
                            error!(error = %e, "failed to persist disabled status");
                        }
                    }
                }
                Ok(false) if self.is_active() => {
                    info!(river = %self.config.get_river_name(), "about to stop river");
                    self.close();
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "status flag read failed, keeping current state"),
            }
            thread::sleep(STATUS_PERIOD);
        }
    }

    /// End the status loop and stop the pipeline.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.close();
    }

    /// Bring the pipeline up: bootstrap the target index, discover the
    /// source topology once and spawn one slurper per shard (or a single
    /// one) plus one indexer. A no-op when already active.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state
            .active
            .as_ref()
            .map_or(false, |active| active.load(Ordering::Relaxed))
        {
            return Ok(());
        }

        info!(
            db = %self.config.get_db(),
            collection = %self.config.get_collection(),
            gridfs = self.config.is_gridfs(),
            drop_collection = self.config.is_drop_collection(),
            throttle_size = self.config.get_throttle_size(),
            index = %self.config.get_index(),
            doc_type = %self.config.get_doc_type(),
            "starting mongodb river"
        );
        mapping::ensure_target_ready(
            self.sink.as_ref(),
            self.config.get_index(),
            self.config.get_doc_type(),
            self.config.is_gridfs(),
        )?;

        let targets = self.discover_topology()?;
        let active = Arc::new(AtomicBool::new(true));
        let queue = EventQueue::new(self.config.get_throttle_size(), active.clone());

        match self.spawn_workers(targets, queue, &active) {
            Ok(workers) => {
                state.active = Some(active);
                state.workers = workers;
                Ok(())
            }
            Err(e) => {
                // workers spawned before the failure observe the cleared
                // flag and exit.
                active.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn spawn_workers(
        &self,
        targets: Vec<SlurperTarget>,
        queue: EventQueue,
        active: &Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(targets.len() + 1);
        for target in targets {
            let slurper = Slurper::new(
                target.label.clone(),
                target.uri,
                target.fallback_uri,
                self.config.clone(),
                queue.clone(),
                self.checkpoints.clone(),
                active.clone(),
            );
            workers.push(
                thread::Builder::new()
                    .name(format!("river-slurper-{}", target.label))
                    .spawn(move || slurper.run())?,
            );
        }

        let indexer = Indexer::new(
            self.config.clone(),
            queue,
            self.sink.clone(),
            self.checkpoints.clone(),
            self.transformer.clone(),
            active.clone(),
        );
        workers.push(
            thread::Builder::new()
                .name("river-indexer".to_string())
                .spawn(move || indexer.run())?,
        );
        Ok(workers)
    }

    /// Interrupt every worker of the current generation and clear the
    /// registry. Safe to call repeatedly and on a never-started river.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if let Some(active) = state.active.take() {
            info!(river = %self.config.get_river_name(), "closing river");
            active.store(false, Ordering::Relaxed);
        }
        // workers observe the cleared flag and exit on their own; a blocked
        // oplog cursor wakes at the next await window.
        state.workers.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerSet> {
        self.state.lock().expect("river state lock poisoned")
    }

    /// One slurper for a replica set; one per shard when the source is a
    /// mongos router.
    fn discover_topology(&self) -> Result<Vec<SlurperTarget>> {
        let uri = self.config.get_client_uri(CredentialSource::Admin);
        let client = Client::with_uri_str(&uri)?;
        if self.is_mongos(&client) {
            let shards = client.database(CONFIG_DB).collection::<Document>("shards");
            let mut targets = Vec::new();
            for shard in shards.find(None, None)? {
                if let Some(target) = self.shard_target(&shard?) {
                    targets.push(target);
                }
            }
            if !targets.is_empty() {
                return Ok(targets);
            }
            warn!("mongos reported no shards, falling back to a single slurper");
        }
        Ok(vec![SlurperTarget {
            label: "main".to_string(),
            uri,
            fallback_uri: self.config.get_local_uri(),
        }])
    }

    fn shard_target(&self, shard: &Document) -> Option<SlurperTarget> {
        let host = shard.get_str("host").ok()?;
        let label = shard.get_str(ID_FIELD).unwrap_or("shard").to_string();
        info!(shard = %label, host, "discovered shard");
        Some(SlurperTarget {
            label,
            uri: self.config.shard_uri(host, CredentialSource::Admin),
            fallback_uri: self
                .config
                .get_local_uri()
                .map(|_| self.config.shard_uri(host, CredentialSource::Local)),
        })
    }

    fn is_mongos(&self, client: &Client) -> bool {
        match client
            .database(ADMIN_DB)
            .run_command(doc! {"serverStatus": 1}, None)
        {
            Ok(status) => status
                .get_str("process")
                .map(|process| process.to_lowercase().contains("mongos"))
                .unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "serverStatus failed, assuming replica set topology");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::transform::NoopTransformer;

    fn test_river() -> River {
        let config = Arc::new(
            RiverConfig::from_toml(
                r#"
                [mongo]
                uri = "mongodb://localhost:27017"
                db = "shop"
                collection = "orders"

                [index]
                name = "shop"

                [elasticsearch]
                url = "http://localhost:9200"
                "#,
            )
            .unwrap(),
        );
        River::new(config, Arc::new(MemorySink::new()), Arc::new(NoopTransformer))
    }

    #[test]
    fn test_close_is_idempotent_without_start() {
        let river = test_river();
        assert!(!river.is_active());
        river.close();
        river.close();
        assert!(!river.is_active());
    }

    #[test]
    fn test_shard_target_builds_per_shard_uri() {
        let river = test_river();
        let target = river
            .shard_target(&doc! {"_id": "rs0", "host": "rs0/h1:27017,h2:27017"})
            .unwrap();
        assert_eq!(target.label, "rs0");
        assert!(target.uri.starts_with("mongodb://h1:27017,h2:27017/?"));
        assert!(target.uri.contains("replicaSet=rs0"));
        assert!(target.fallback_uri.is_none());
    }

    #[test]
    fn test_shard_target_requires_host() {
        let river = test_river();
        assert!(river.shard_target(&doc! {"_id": "rs0"}).is_none());
    }
}
