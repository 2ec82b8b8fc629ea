//! Per-action change tracking and revert.
//!
//! A streamed action may arrive incomplete and be superseded by its
//! successor (a draw stroke extended token by token). The session controller
//! applies each action through a [`ChangeTracker`] so it can capture an
//! [`ActionDiff`] and reverse just that action's effect - not a whole
//! document snapshot, because a human or another session may have edited
//! unrelated shapes in between and those edits must survive the revert.

use anyhow::Result;
use tracing::warn;

use crate::facade::{Bounds, DocumentApi, ShapeCreate, ShapeSnapshot, ShapeUpdate, ZOrder};

/// Inverse of one recorded mutation.
#[derive(Debug, Clone)]
enum InverseOp {
    /// The tracked action created this shape; revert deletes it.
    Delete(String),
    /// The tracked action updated this shape; revert restores the
    /// before-image state.
    Restore(ShapeSnapshot),
    /// The tracked action deleted this shape; revert recreates it.
    Recreate(ShapeSnapshot),
}

/// The captured, revertible effect of a single action.
#[derive(Debug, Clone, Default)]
pub struct ActionDiff {
    inverse: Vec<InverseOp>,
}

impl ActionDiff {
    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }

    /// Undo the tracked action by replaying inverses in reverse order.
    /// Best-effort: individual failures are logged and skipped.
    pub fn revert(&self, doc: &mut dyn DocumentApi) {
        for op in self.inverse.iter().rev() {
            let result = match op {
                InverseOp::Delete(id) => doc.delete_shapes(std::slice::from_ref(id)),
                // Updates merge props, so restoring a before-image through an
                // update would leave keys the action added. Recreating from
                // the snapshot restores the exact prior state (at the cost of
                // the shape jumping to the front of the z-order).
                InverseOp::Restore(snapshot) | InverseOp::Recreate(snapshot) => {
                    let _ = doc.delete_shapes(std::slice::from_ref(&snapshot.id));
                    doc.create_shape(&ShapeCreate {
                        id: snapshot.id.clone(),
                        kind: snapshot.kind.clone(),
                        x: snapshot.x,
                        y: snapshot.y,
                        w: Some(snapshot.w),
                        h: Some(snapshot.h),
                        props: snapshot.props.clone(),
                    })
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "revert step failed");
            }
        }
    }
}

/// Facade wrapper that records inverse operations for shape CRUD while
/// passing everything through to the underlying document.
///
/// Non-CRUD mutations (grouping, z-order, viewport, pages) pass through
/// untracked; an incomplete action's provisional effect is its shape edits.
pub struct ChangeTracker<'a> {
    doc: &'a mut dyn DocumentApi,
    diff: ActionDiff,
}

impl<'a> ChangeTracker<'a> {
    pub fn new(doc: &'a mut dyn DocumentApi) -> Self {
        Self {
            doc,
            diff: ActionDiff::default(),
        }
    }

    pub fn into_diff(self) -> ActionDiff {
        self.diff
    }

    fn record_before_update(&mut self, updates: &[ShapeUpdate]) {
        for update in updates {
            if let Some(snapshot) = self.doc.get_shape(&update.id) {
                self.diff.inverse.push(InverseOp::Restore(snapshot));
            }
        }
    }
}

impl DocumentApi for ChangeTracker<'_> {
    fn create_shapes(&mut self, shapes: &[ShapeCreate]) -> Result<()> {
        self.doc.create_shapes(shapes)?;
        for shape in shapes {
            self.diff.inverse.push(InverseOp::Delete(shape.id.clone()));
        }
        Ok(())
    }

    fn create_shape(&mut self, shape: &ShapeCreate) -> Result<()> {
        self.doc.create_shape(shape)?;
        self.diff.inverse.push(InverseOp::Delete(shape.id.clone()));
        Ok(())
    }

    fn update_shapes(&mut self, updates: &[ShapeUpdate]) -> Result<()> {
        self.record_before_update(updates);
        self.doc.update_shapes(updates)
    }

    fn delete_shapes(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if let Some(snapshot) = self.doc.get_shape(id) {
                self.diff.inverse.push(InverseOp::Recreate(snapshot));
            }
        }
        self.doc.delete_shapes(ids)
    }

    fn get_shape(&self, id: &str) -> Option<ShapeSnapshot> {
        self.doc.get_shape(id)
    }

    fn get_shape_page_bounds(&self, id: &str) -> Option<Bounds> {
        self.doc.get_shape_page_bounds(id)
    }

    fn zoom_to_bounds(&mut self, bounds: Bounds) -> Result<()> {
        self.doc.zoom_to_bounds(bounds)
    }

    fn fit_bounds_to_content(&mut self, id: &str, bounds: Bounds) -> Result<bool> {
        if let Some(snapshot) = self.doc.get_shape(id) {
            self.diff.inverse.push(InverseOp::Restore(snapshot));
        }
        self.doc.fit_bounds_to_content(id, bounds)
    }

    fn group_shapes(&mut self, ids: &[String], group_id: &str) -> Result<()> {
        self.doc.group_shapes(ids, group_id)
    }

    fn ungroup_shapes(&mut self, ids: &[String]) -> Result<()> {
        self.doc.ungroup_shapes(ids)
    }

    fn reorder_shapes(&mut self, ids: &[String], order: ZOrder) -> Result<()> {
        self.doc.reorder_shapes(ids, order)
    }

    fn rotate_shapes(&mut self, ids: &[String], radians: f64) -> Result<()> {
        self.doc.rotate_shapes(ids, radians)
    }

    fn create_page(&mut self, name: &str) -> Result<()> {
        self.doc.create_page(name)
    }

    fn switch_page(&mut self, name: &str) -> Result<()> {
        self.doc.switch_page(name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::facade::MemoryDocument;

    fn create(id: &str, x: f64) -> ShapeCreate {
        ShapeCreate {
            id: id.into(),
            kind: "geo".into(),
            x,
            y: 0.0,
            w: Some(10.0),
            h: Some(10.0),
            props: Default::default(),
        }
    }

    #[test]
    fn reverting_a_create_deletes_the_shape() {
        let mut doc = MemoryDocument::new();
        let diff = {
            let mut tracker = ChangeTracker::new(&mut doc);
            tracker.create_shape(&create("a", 0.0)).unwrap();
            tracker.into_diff()
        };
        assert!(doc.get_shape("a").is_some());
        diff.revert(&mut doc);
        assert!(doc.get_shape("a").is_none());
    }

    #[test]
    fn reverting_an_update_restores_the_before_image() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 5.0)).unwrap();

        let diff = {
            let mut tracker = ChangeTracker::new(&mut doc);
            let mut update = ShapeUpdate::new("a");
            update.x = Some(50.0);
            update.props.insert("fill".into(), json!("red"));
            tracker.update_shapes(&[update]).unwrap();
            tracker.into_diff()
        };
        assert_eq!(doc.get_shape("a").unwrap().x, 50.0);
        diff.revert(&mut doc);
        let snap = doc.get_shape("a").unwrap();
        assert_eq!(snap.x, 5.0);
        assert!(snap.props.get("fill").is_none());
    }

    #[test]
    fn reverting_a_delete_recreates_the_shape() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 5.0)).unwrap();
        let diff = {
            let mut tracker = ChangeTracker::new(&mut doc);
            tracker.delete_shapes(&["a".into()]).unwrap();
            tracker.into_diff()
        };
        assert!(doc.get_shape("a").is_none());
        diff.revert(&mut doc);
        assert_eq!(doc.get_shape("a").unwrap().x, 5.0);
    }

    #[test]
    fn revert_leaves_untracked_shapes_alone() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("human", 1.0)).unwrap();

        let diff = {
            let mut tracker = ChangeTracker::new(&mut doc);
            tracker.create_shape(&create("agent", 2.0)).unwrap();
            tracker.into_diff()
        };

        // A human edit lands between the incomplete action and its revert.
        let mut human_edit = ShapeUpdate::new("human");
        human_edit.x = Some(99.0);
        doc.update_shapes(&[human_edit]).unwrap();

        diff.revert(&mut doc);
        assert!(doc.get_shape("agent").is_none());
        assert_eq!(doc.get_shape("human").unwrap().x, 99.0);
    }
}
