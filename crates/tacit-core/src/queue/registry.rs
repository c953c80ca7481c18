//! Queue registry: named FIFO sequences of operations, mirrored into the store.
//!
//! The registry owns every live `QueuedOperation`. Durable operations are
//! written through on every change; the store is never read back except by
//! [`QueueRegistry::restore_from_store`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use super::storage::{self, QueueIndex, StorageKeys};
use crate::domain::errors::QueueError;
use crate::domain::ids::OperationId;
use crate::domain::operation::{Position, QueuedOperation};
use crate::ports::DurableStore;

/// A persisted entry that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub key: String,
    pub reason: String,
}

/// Result of reading the persisted queues.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// `false` when the index itself could not be read or decoded.
    pub restored_ok: bool,

    /// Queue name → operations in persisted order.
    pub queues: BTreeMap<String, Vec<QueuedOperation>>,

    pub skipped: Vec<SkippedEntry>,
}

impl RestoreReport {
    pub fn operation_count(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }
}

pub struct QueueRegistry {
    store: Arc<dyn DurableStore>,
    keys: StorageKeys,
    default_queue: String,
    queues: BTreeMap<String, VecDeque<OperationId>>,
    operations: HashMap<OperationId, QueuedOperation>,

    /// Persisted ids from a previous run are not in memory yet; index writes
    /// must carry them over.
    awaiting_restore: bool,
}

impl QueueRegistry {
    pub fn new(
        store: Arc<dyn DurableStore>,
        keys: StorageKeys,
        default_queue: impl Into<String>,
    ) -> Self {
        let default_queue = default_queue.into();
        let mut queues = BTreeMap::new();
        queues.insert(default_queue.clone(), VecDeque::new());
        Self {
            store,
            keys,
            default_queue,
            queues,
            operations: HashMap::new(),
            awaiting_restore: true,
        }
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// Adds an operation to its queue.
    ///
    /// Durable operations are persisted (body, then index) before this
    /// returns; a store failure undoes the in-memory insert.
    pub fn enqueue(
        &mut self,
        operation: QueuedOperation,
        position: Position,
    ) -> Result<(), QueueError> {
        let id = operation.id;
        if self.operations.contains_key(&id) {
            return Err(QueueError::InvalidState(format!("{id} is already queued")));
        }

        let queue_name = operation.queue_name.clone();
        let durable = operation.durable;
        let sequence = self.queues.entry(queue_name.clone()).or_default();
        match position {
            Position::Tail => sequence.push_back(id),
            Position::Head => {
                let head_in_flight = sequence
                    .front()
                    .and_then(|head| self.operations.get(head))
                    .is_some_and(|head| head.status.is_in_flight());
                let at = usize::from(head_in_flight).min(sequence.len());
                sequence.insert(at, id);
            }
        }
        self.operations.insert(id, operation);

        if durable && let Err(e) = self.persist_new(id) {
            self.detach(id);
            return Err(e);
        }

        debug!(queue = %queue_name, operation = %id, ?position, durable, "operation enqueued");
        Ok(())
    }

    fn persist_new(&self, id: OperationId) -> Result<(), QueueError> {
        let key = self.keys.operation(id);
        self.write_body(id)?;
        if let Err(e) = self.write_index() {
            if let Err(cleanup) = self.store.remove(&key) {
                warn!(key = %key, error = %cleanup, "failed to delete body after index write failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Removes an operation from memory and store. Removing an absent id is a no-op.
    ///
    /// The in-memory removal always happens; a store failure is still reported.
    pub fn remove(&mut self, id: OperationId) -> Result<Option<QueuedOperation>, QueueError> {
        let Some(operation) = self.detach(id) else {
            return Ok(None);
        };
        if operation.durable {
            self.write_index()?;
            self.store.remove(&self.keys.operation(id))?;
        }
        debug!(queue = %operation.queue_name, operation = %id, "operation removed");
        Ok(Some(operation))
    }

    /// Drops an operation from memory only.
    fn detach(&mut self, id: OperationId) -> Option<QueuedOperation> {
        let operation = self.operations.remove(&id)?;
        if let Some(sequence) = self.queues.get_mut(&operation.queue_name) {
            sequence.retain(|queued| *queued != id);
            if sequence.is_empty() && operation.queue_name != self.default_queue {
                self.queues.remove(&operation.queue_name);
            }
        }
        Some(operation)
    }

    /// Mutates an operation in place and persists it if durable.
    ///
    /// Returns `Ok(false)` when the operation is unknown. The in-memory change
    /// is kept even when persisting fails.
    pub fn update<F>(&mut self, id: OperationId, f: F) -> Result<bool, QueueError>
    where
        F: FnOnce(&mut QueuedOperation),
    {
        let Some(operation) = self.operations.get_mut(&id) else {
            return Ok(false);
        };
        f(operation);
        if operation.durable {
            self.write_body(id)?;
        }
        Ok(true)
    }

    fn write_body(&self, id: OperationId) -> Result<(), QueueError> {
        let Some(operation) = self.operations.get(&id) else {
            return Ok(());
        };
        let raw = storage::encode_operation(operation)?;
        self.store.set(&self.keys.operation(id), &raw)?;
        Ok(())
    }

    /// Rewrites the index from the durable operations currently in memory.
    ///
    /// Before the first merge, ids persisted by a previous run stay listed
    /// ahead of the in-memory ones.
    fn write_index(&self) -> Result<(), QueueError> {
        let mut index = if self.awaiting_restore {
            self.carried_index()
        } else {
            QueueIndex::new()
        };
        for (name, sequence) in &self.queues {
            let durable = sequence
                .iter()
                .filter(|id| self.operations.get(id).is_some_and(|op| op.durable))
                .copied();
            index.entry(name.clone()).or_default().extend(durable);
        }
        index.retain(|_, ids| !ids.is_empty());
        self.store
            .set(&self.keys.index(), &storage::encode_index(&index)?)?;
        Ok(())
    }

    /// The persisted index minus ids that are live in memory. Unreadable
    /// indexes carry nothing over.
    fn carried_index(&self) -> QueueIndex {
        let key = self.keys.index();
        let persisted = match self.store.get(&key) {
            Ok(Some(raw)) => storage::decode_index(&key, &raw).unwrap_or_default(),
            Ok(None) => QueueIndex::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read queue index");
                QueueIndex::new()
            }
        };
        persisted
            .into_iter()
            .map(|(name, ids)| {
                let carried: Vec<OperationId> = ids
                    .into_iter()
                    .filter(|id| !self.operations.contains_key(id))
                    .collect();
                (name, carried)
            })
            .collect()
    }

    /// Reads the persisted queues without touching the in-memory state.
    ///
    /// Missing or corrupt bodies are skipped and reported. An unreadable index
    /// yields an empty report with `restored_ok == false`.
    pub fn restore_from_store(&self) -> RestoreReport {
        let index_key = self.keys.index();
        let raw = match self.store.get(&index_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return RestoreReport {
                    restored_ok: true,
                    ..RestoreReport::default()
                };
            }
            Err(e) => {
                warn!(key = %index_key, error = %e, "failed to read queue index");
                return RestoreReport {
                    restored_ok: false,
                    queues: BTreeMap::new(),
                    skipped: vec![SkippedEntry {
                        key: index_key,
                        reason: e.to_string(),
                    }],
                };
            }
        };
        let index = match storage::decode_index(&index_key, &raw) {
            Ok(index) => index,
            Err(e) => {
                warn!(key = %index_key, error = %e, "corrupt queue index");
                return RestoreReport {
                    restored_ok: false,
                    queues: BTreeMap::new(),
                    skipped: vec![SkippedEntry {
                        key: index_key,
                        reason: e.to_string(),
                    }],
                };
            }
        };

        let mut report = RestoreReport {
            restored_ok: true,
            ..RestoreReport::default()
        };
        let mut seen = HashSet::new();
        for (queue_name, ids) in index {
            let mut restored = Vec::with_capacity(ids.len());
            for id in ids {
                let key = self.keys.operation(id);
                if !seen.insert(id) {
                    report.skipped.push(SkippedEntry {
                        key,
                        reason: "listed in more than one queue".to_string(),
                    });
                    continue;
                }
                match self.read_body(&key, id) {
                    Ok(mut operation) => {
                        operation.queue_name = queue_name.clone();
                        restored.push(operation);
                    }
                    Err(reason) => {
                        warn!(key = %key, reason = %reason, "skipping persisted operation");
                        report.skipped.push(SkippedEntry { key, reason });
                    }
                }
            }
            if !restored.is_empty() {
                report.queues.insert(queue_name, restored);
            }
        }
        report
    }

    fn read_body(&self, key: &str, id: OperationId) -> Result<QueuedOperation, String> {
        let raw = self
            .store
            .get(key)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "missing body".to_string())?;
        storage::decode_operation(key, id, &raw).map_err(|e| e.to_string())
    }

    /// Puts restored operations ahead of whatever is already queued, keeping
    /// their persisted order. Ids already present are ignored.
    pub fn merge_restored(
        &mut self,
        restored: BTreeMap<String, Vec<QueuedOperation>>,
    ) -> Result<usize, QueueError> {
        let carried_over = std::mem::replace(&mut self.awaiting_restore, false);
        let mut merged = 0;
        let mut any_durable = carried_over;
        for (queue_name, operations) in restored {
            let fresh: Vec<QueuedOperation> = operations
                .into_iter()
                .filter(|op| !self.operations.contains_key(&op.id))
                .collect();
            let sequence = self.queues.entry(queue_name).or_default();
            for (at, operation) in fresh.into_iter().enumerate() {
                sequence.insert(at, operation.id);
                any_durable |= operation.durable;
                self.operations.insert(operation.id, operation);
                merged += 1;
            }
        }
        if any_durable {
            self.write_index()?;
        }
        Ok(merged)
    }

    pub fn get(&self, id: OperationId) -> Option<&QueuedOperation> {
        self.operations.get(&id)
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.operations.contains_key(&id)
    }

    /// Head of a queue.
    pub fn front(&self, queue_name: &str) -> Option<&QueuedOperation> {
        self.queues
            .get(queue_name)?
            .front()
            .and_then(|id| self.operations.get(id))
    }

    /// Ordered clones of one queue's operations (empty for an unknown queue).
    pub fn snapshot(&self, queue_name: &str) -> Vec<QueuedOperation> {
        self.queues
            .get(queue_name)
            .map(|sequence| {
                sequence
                    .iter()
                    .filter_map(|id| self.operations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Names of queues that currently hold operations.
    pub fn non_empty_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, sequence)| !sequence.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Total number of queued operations across queues.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.operations.values()
    }
}
