//! Batched document mutations.
//!
//! The engine stages creates/updates/deletes into a [`Batch`] and commits
//! them with as few facade calls as possible. Ordering on flush is fixed:
//! creates, then merged updates, then deletes, because later-staged updates
//! may target ids created in the same batch.

use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::Value;
use tracing::warn;

use crate::facade::{DocumentApi, ShapeCreate, ShapeUpdate};

/// Transient accumulator of staged document mutations.
#[derive(Debug, Default)]
pub struct Batch {
    creates: Vec<ShapeCreate>,
    updates: Vec<ShapeUpdate>,
    deletes: BTreeSet<String>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Stage a shape creation. A repeated id replaces the earlier staged
    /// payload.
    pub fn stage_create(&mut self, create: ShapeCreate) {
        if let Some(existing) = self.creates.iter_mut().find(|c| c.id == create.id) {
            *existing = create;
        } else {
            self.creates.push(create);
        }
    }

    /// Stage a partial update. Multiple updates to the same id are merged:
    /// later top-level fields win, `props` is deep-merged key-wise.
    pub fn stage_update(&mut self, update: ShapeUpdate) {
        if update.is_empty() {
            return;
        }
        if let Some(existing) = self.updates.iter_mut().find(|u| u.id == update.id) {
            merge_update(existing, update);
        } else {
            self.updates.push(update);
        }
    }

    /// Stage a deletion. Deletes always win over any pending create or
    /// update to the same id, so "create X; delete X" is lossless without
    /// producing a visual artifact.
    pub fn stage_delete(&mut self, id: impl Into<String>) {
        self.deletes.insert(id.into());
    }

    /// Commit staged mutations. An empty batch performs zero facade calls.
    pub fn flush(mut self, doc: &mut dyn DocumentApi) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        // Deletes win: drop staged work targeting a deleted id before it
        // ever reaches the document.
        self.creates.retain(|create| !self.deletes.contains(&create.id));
        self.updates.retain(|update| !self.deletes.contains(&update.id));

        if !self.creates.is_empty() {
            if let Err(err) = doc.create_shapes(&self.creates) {
                // Bulk path failed; retry shape-by-shape so one bad payload
                // doesn't sink its siblings.
                warn!(error = %err, count = self.creates.len(), "bulk create failed, retrying per shape");
                for create in &self.creates {
                    if let Err(err) = doc.create_shape(create) {
                        warn!(error = %err, id = %create.id, "shape create failed");
                    }
                }
            }
        }

        if !self.updates.is_empty() {
            if let Err(err) = doc.update_shapes(&self.updates) {
                warn!(error = %err, count = self.updates.len(), "shape update batch failed");
            }
        }

        if !self.deletes.is_empty() {
            let ids: Vec<String> = self.deletes.iter().cloned().collect();
            if let Err(err) = doc.delete_shapes(&ids) {
                warn!(error = %err, count = ids.len(), "shape delete failed");
            }
        }

        Ok(())
    }
}

/// Merge `incoming` over `existing`: top-level fields overwrite, props
/// deep-merge.
fn merge_update(existing: &mut ShapeUpdate, incoming: ShapeUpdate) {
    if incoming.x.is_some() {
        existing.x = incoming.x;
    }
    if incoming.y.is_some() {
        existing.y = incoming.y;
    }
    if incoming.w.is_some() {
        existing.w = incoming.w;
    }
    if incoming.h.is_some() {
        existing.h = incoming.h;
    }
    for (key, value) in incoming.props {
        match (existing.props.get_mut(&key), value) {
            (Some(Value::Object(old)), Value::Object(new)) => {
                merge_objects(old, new);
            }
            (slot, value) => {
                if let Some(slot) = slot {
                    *slot = value;
                } else {
                    existing.props.insert(key, value);
                }
            }
        }
    }
}

fn merge_objects(
    old: &mut serde_json::Map<String, Value>,
    new: serde_json::Map<String, Value>,
) {
    for (key, value) in new {
        match (old.get_mut(&key), value) {
            (Some(Value::Object(nested_old)), Value::Object(nested_new)) => {
                merge_objects(nested_old, nested_new);
            }
            (slot, value) => {
                if let Some(slot) = slot {
                    *slot = value;
                } else {
                    old.insert(key, value);
                }
            }
        }
    }
}
