//! In-process [`SinkClient`] used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Result, RiverError};

use super::{BulkAction, BulkItemFailure, BulkSummary, SinkClient};

#[derive(Default)]
struct State {
    indices: HashSet<String>,
    documents: BTreeMap<(String, String, String), Value>,
    mappings: HashMap<(String, String), Value>,
    refreshes: usize,
    bulks: usize,
    fail_next_bulk: bool,
    failing_ids: HashSet<String>,
}

#[derive(Default)]
pub struct MemorySink {
    state: Mutex<State>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory sink lock poisoned")
    }

    /// Seed a document directly, bypassing the bulk path.
    pub fn put_document(&self, index: &str, doc_type: &str, id: &str, source: Value) {
        self.lock().documents.insert(
            (index.to_string(), doc_type.to_string(), id.to_string()),
            source,
        );
    }

    pub fn document(&self, index: &str, doc_type: &str, id: &str) -> Option<Value> {
        self.lock()
            .documents
            .get(&(index.to_string(), doc_type.to_string(), id.to_string()))
            .cloned()
    }

    /// Document ids currently stored under (index, type), in order.
    pub fn ids(&self, index: &str, doc_type: &str) -> Vec<String> {
        self.lock()
            .documents
            .keys()
            .filter(|(i, t, _)| i == index && t == doc_type)
            .map(|(_, _, id)| id.clone())
            .collect()
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.lock().indices.contains(index)
    }

    pub fn mapping_of(&self, index: &str, doc_type: &str) -> Option<Value> {
        self.lock()
            .mappings
            .get(&(index.to_string(), doc_type.to_string()))
            .cloned()
    }

    pub fn refresh_count(&self) -> usize {
        self.lock().refreshes
    }

    pub fn bulk_count(&self) -> usize {
        self.lock().bulks
    }

    /// Make the next bulk request fail at the transport level.
    pub fn fail_next_bulk(&self) {
        self.lock().fail_next_bulk = true;
    }

    /// Make every action targeting `id` fail as a per-item error.
    pub fn fail_id(&self, id: &str) {
        self.lock().failing_ids.insert(id.to_string());
    }
}

impl SinkClient for MemorySink {
    fn create_index(&self, index: &str) -> Result<()> {
        self.lock().indices.insert(index.to_string());
        Ok(())
    }

    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &Value) -> Result<()> {
        self.lock()
            .mappings
            .insert((index.to_string(), doc_type.to_string()), mapping.clone());
        Ok(())
    }

    fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()> {
        self.lock()
            .mappings
            .remove(&(index.to_string(), doc_type.to_string()));
        Ok(())
    }

    fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<Value>> {
        Ok(self
            .lock()
            .mappings
            .get(&(index.to_string(), doc_type.to_string()))
            .cloned())
    }

    fn refresh(&self, _index: &str) -> Result<()> {
        self.lock().refreshes += 1;
        Ok(())
    }

    fn get_source(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.document(index, doc_type, id))
    }

    fn bulk(&self, actions: &[BulkAction]) -> Result<BulkSummary> {
        let mut state = self.lock();
        if state.fail_next_bulk {
            state.fail_next_bulk = false;
            return Err(RiverError::Sink {
                status: 503,
                reason: "injected transport failure".to_string(),
            });
        }
        state.bulks += 1;

        let mut summary = BulkSummary {
            items: actions.len(),
            failures: vec![],
        };
        for action in actions {
            if state.failing_ids.contains(action.id()) {
                summary.failures.push(BulkItemFailure {
                    id: action.id().to_string(),
                    reason: "injected item failure".to_string(),
                });
                continue;
            }
            match action {
                BulkAction::Index {
                    index,
                    doc_type,
                    id,
                    source,
                    ..
                } => {
                    state.documents.insert(
                        (index.clone(), doc_type.clone(), id.clone()),
                        source.clone(),
                    );
                }
                BulkAction::Delete {
                    index,
                    doc_type,
                    id,
                    ..
                } => {
                    state
                        .documents
                        .remove(&(index.clone(), doc_type.clone(), id.clone()));
                }
            }
        }
        Ok(summary)
    }
}
