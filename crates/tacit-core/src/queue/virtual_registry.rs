//! Virtual value registry: placeholder arena plus the op-level dependency graph.
//!
//! The registry only holds ids. Rewriting dependent requests is left to the
//! engine, which owns the operations (see [`Resolution`]).

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use super::dependency::DependencyGraph;
use crate::domain::errors::QueueError;
use crate::domain::ids::{OperationId, VirtualId};
use crate::domain::operation::QueuedOperation;
use crate::domain::virtual_value::{
    self, Dependent, FieldPath, VirtualRef, VirtualValue, collect_refs, substitute,
};

/// Outcome of a first resolution: the request fields that must be rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub virtual_id: VirtualId,
    pub value: Value,
    /// Sorted by operation, then path.
    pub dependents: Vec<Dependent>,
}

impl Resolution {
    /// Distinct operations among the dependents.
    pub fn operations(&self) -> Vec<OperationId> {
        let ids: BTreeSet<OperationId> = self.dependents.iter().map(|d| d.operation_id).collect();
        ids.into_iter().collect()
    }
}

/// A placeholder an operation still waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDependency {
    pub virtual_id: VirtualId,
    pub producer: Option<OperationId>,
    /// A producer was declared and left without resolving the value.
    pub producer_gone: bool,
}

#[derive(Debug, Default)]
pub struct VirtualRegistry {
    values: HashMap<VirtualId, VirtualValue>,
    graph: DependencyGraph,
    /// Unresolved values whose producer failed or was removed.
    orphaned: HashSet<VirtualId>,
}

impl VirtualRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: VirtualId, shape: Value) -> VirtualValue {
        let value = VirtualValue::new(id, shape);
        self.values.insert(id, value.clone());
        value
    }

    pub fn get(&self, id: VirtualId) -> Option<&VirtualValue> {
        self.values.get(&id)
    }

    fn entry(&mut self, id: VirtualId) -> &mut VirtualValue {
        self.values
            .entry(id)
            .or_insert_with(|| VirtualValue::new(id, Value::Null))
    }

    /// Declares `operation_id` as the producer of `virtual_id`.
    pub fn set_producer(
        &mut self,
        virtual_id: VirtualId,
        operation_id: OperationId,
    ) -> Result<(), QueueError> {
        let value = self
            .values
            .get(&virtual_id)
            .ok_or(QueueError::UnknownVirtual(virtual_id))?;
        match value.producer {
            Some(existing) if existing == operation_id => return Ok(()),
            Some(existing) => {
                return Err(QueueError::InvalidState(format!(
                    "{virtual_id} is already produced by {existing}"
                )));
            }
            None => {}
        }
        if value.is_resolved() {
            return Err(QueueError::InvalidState(format!(
                "{virtual_id} is already resolved"
            )));
        }

        let waiting: BTreeSet<OperationId> =
            value.dependents.iter().map(|d| d.operation_id).collect();
        let mut added = Vec::new();
        for dependent in waiting {
            if let Err(cycle) = self.graph.try_add_dependency(dependent, operation_id) {
                for done in added {
                    self.graph.remove_dependency(done, operation_id);
                }
                return Err(QueueError::DependencyCycle { cycle });
            }
            added.push(dependent);
        }
        self.entry(virtual_id).producer = Some(operation_id);
        self.orphaned.remove(&virtual_id);
        Ok(())
    }

    /// Records that resolving `virtual_id` must rewrite `field_path` of `operation_id`.
    ///
    /// Fails with `DependencyCycle` when the operation (transitively) produces
    /// the value it waits for.
    pub fn register_dependency(
        &mut self,
        virtual_id: VirtualId,
        operation_id: OperationId,
        field_path: FieldPath,
    ) -> Result<(), QueueError> {
        let value = self
            .values
            .get(&virtual_id)
            .ok_or(QueueError::UnknownVirtual(virtual_id))?;
        if let Some(producer) = value.producer {
            self.graph
                .try_add_dependency(operation_id, producer)
                .map_err(|cycle| QueueError::DependencyCycle { cycle })?;
        }
        self.entry(virtual_id).dependents.insert(Dependent {
            operation_id,
            path: field_path,
        });
        Ok(())
    }

    /// Resolves a placeholder, optionally with a projection of `real_value`.
    ///
    /// Returns `Ok(None)` when it was already resolved to the same value.
    pub fn resolve(
        &mut self,
        virtual_id: VirtualId,
        real_value: Value,
        projection: Option<&FieldPath>,
    ) -> Result<Option<Resolution>, QueueError> {
        let value = match projection {
            Some(path) if !path.is_root() => match real_value.pointer(path.as_str()) {
                Some(found) => found.clone(),
                None => {
                    warn!(
                        virtual_id = %virtual_id,
                        projection = %path,
                        "projection missing from the response, resolving to null"
                    );
                    Value::Null
                }
            },
            _ => real_value,
        };

        let entry = self
            .values
            .get_mut(&virtual_id)
            .ok_or(QueueError::UnknownVirtual(virtual_id))?;
        if let Some(existing) = &entry.resolved {
            if *existing == value {
                return Ok(None);
            }
            return Err(QueueError::DoubleResolution { virtual_id });
        }

        entry.resolved = Some(value.clone());
        let dependents: Vec<Dependent> = std::mem::take(&mut entry.dependents).into_iter().collect();
        let producer = entry.producer;
        self.orphaned.remove(&virtual_id);

        let resolution = Resolution {
            virtual_id,
            value,
            dependents,
        };
        if let Some(producer) = producer {
            for dependent in resolution.operations() {
                self.graph.remove_dependency(dependent, producer);
            }
        }
        debug!(virtual_id = %virtual_id, dependents = resolution.dependents.len(), "virtual value resolved");
        Ok(Some(resolution))
    }

    /// Unresolved placeholders `operation` still references through markers.
    ///
    /// Fields registered with [`register_dependency`](Self::register_dependency)
    /// that hold no marker do not gate dispatch; they are rewritten whenever the
    /// value resolves.
    pub fn pending_for(&self, operation: &QueuedOperation) -> Vec<PendingDependency> {
        let ids: BTreeSet<VirtualId> = operation
            .virtual_dependencies()
            .into_iter()
            .map(|(found, _)| found.id)
            .collect();
        ids.into_iter()
            .filter_map(|virtual_id| match self.values.get(&virtual_id) {
                Some(value) if value.is_resolved() => None,
                Some(value) => Some(PendingDependency {
                    virtual_id,
                    producer: value.producer,
                    producer_gone: self.orphaned.contains(&virtual_id),
                }),
                None => Some(PendingDependency {
                    virtual_id,
                    producer: None,
                    producer_gone: false,
                }),
            })
            .collect()
    }

    /// Drops every back-reference to an operation that left its queue.
    /// Values it was supposed to produce lose their producer and are marked orphaned.
    pub fn forget_operation(&mut self, operation_id: OperationId) {
        for value in self.values.values_mut() {
            value.dependents.retain(|d| d.operation_id != operation_id);
            if value.producer == Some(operation_id) && !value.is_resolved() {
                value.producer = None;
                self.orphaned.insert(value.id);
            }
        }
        self.graph.remove_operation(operation_id);
    }

    pub fn is_virtual(&self, value: &Value) -> bool {
        virtual_value::is_virtual(value)
    }

    /// Structural equality where a resolved placeholder equals its value.
    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        a == b || self.substitute_resolved(a.clone()) == self.substitute_resolved(b.clone())
    }

    /// Storage form: resolved placeholders are replaced by their values and
    /// unresolved ones stay as markers.
    pub fn dehydrate(&self, value: &Value) -> Value {
        self.substitute_resolved(value.clone())
    }

    /// Re-links every marker in `value` to a registry entry (creating
    /// unresolved entries for unseen ids) and substitutes resolved ones.
    pub fn hydrate(&mut self, value: &Value) -> Value {
        for found in referenced_ids(value) {
            self.entry(found);
        }
        self.substitute_resolved(value.clone())
    }

    /// Rebuilds producer and dependent links from a restored operation.
    pub fn relink(&mut self, operation: &QueuedOperation) -> Result<(), QueueError> {
        if let Some(binding) = &operation.produces {
            self.entry(binding.virtual_id);
            if !self.values[&binding.virtual_id].is_resolved() {
                self.set_producer(binding.virtual_id, operation.id)?;
            }
        }
        for (found, path) in operation.virtual_dependencies() {
            self.entry(found.id);
            self.register_dependency(found.id, operation.id, path)?;
        }
        Ok(())
    }

    fn substitute_resolved(&self, mut value: Value) -> Value {
        for id in referenced_ids(&value) {
            if let Some(resolved) = self.values.get(&id).and_then(|v| v.resolved.as_ref()) {
                substitute(&mut value, id, resolved);
            }
        }
        value
    }
}

fn referenced_ids(value: &Value) -> BTreeSet<VirtualId> {
    let mut refs: Vec<(VirtualRef, FieldPath)> = Vec::new();
    collect_refs(value, &FieldPath::root(), &mut refs);
    refs.into_iter().map(|(found, _)| found.id).collect()
}
