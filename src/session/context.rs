//! Context items attached to agent requests, with dedup on add.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::facade::{Bounds, Point};

/// A piece of document context the user has attached to the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    Shape { id: String },
    ShapeGroup { ids: Vec<String> },
    Area { bounds: Bounds },
    Point { point: Point },
}

/// Deduplicating collection of context items.
#[derive(Debug, Default, Clone)]
pub struct ContextSet {
    items: Vec<ContextItem>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Shape ids already covered by any item in the set.
    fn known_shape_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .flat_map(|item| match item {
                ContextItem::Shape { id } => std::slice::from_ref(id),
                ContextItem::ShapeGroup { ids } => ids.as_slice(),
                _ => &[],
            })
            .map(String::as_str)
            .collect()
    }

    /// Add an item, deduplicating against what is already known:
    /// a shape covered by a registered group is dropped, and a group
    /// contributes only the shape ids not yet known - collapsing to a
    /// single-shape item if one remains, or to nothing if none do.
    pub fn add(&mut self, item: ContextItem) {
        match item {
            ContextItem::Shape { id } => {
                if self.known_shape_ids().contains(&id.as_str()) {
                    return;
                }
                self.items.push(ContextItem::Shape { id });
            }
            ContextItem::ShapeGroup { ids } => {
                let known = self.known_shape_ids();
                let mut seen = HashSet::new();
                let mut fresh: Vec<String> = ids
                    .into_iter()
                    .filter(|id| !known.contains(&id.as_str()) && seen.insert(id.clone()))
                    .collect();
                match fresh.len() {
                    0 => {}
                    1 => self.items.push(ContextItem::Shape {
                        id: fresh.remove(0),
                    }),
                    _ => self.items.push(ContextItem::ShapeGroup { ids: fresh }),
                }
            }
            other => {
                if !self.items.contains(&other) {
                    self.items.push(other);
                }
            }
        }
    }
}
