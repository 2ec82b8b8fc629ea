//! Document facade - the mutation contract for the underlying canvas.
//!
//! The editor substrate is an external collaborator. This module defines the
//! trait the engine mutates through, the payload/snapshot types that cross
//! that boundary, and `MemoryDocument`, an in-process implementation used by
//! tests and headless embedders.
//!
//! All facade calls are best-effort from the engine's perspective: every call
//! site wraps them in a failure boundary and continues, so an implementation
//! may fail any individual operation without aborting the action stream.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// JSON property bag carried by shapes and components.
pub type Props = serde_json::Map<String, serde_json::Value>;

/// A 2D point in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }
}

/// Payload for creating a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeCreate {
    pub id: String,
    /// Facade-level shape family, e.g. "geo", "text", "arrow", "line", "draw".
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub w: Option<f64>,
    pub h: Option<f64>,
    pub props: Props,
}

/// Partial update for an existing shape. `None` fields are left untouched;
/// `props` entries are merged over the shape's current props.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeUpdate {
    pub id: String,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub w: Option<f64>,
    pub h: Option<f64>,
    pub props: Props,
}

impl ShapeUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// True when the update carries no field changes at all.
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.w.is_none()
            && self.h.is_none()
            && self.props.is_empty()
    }
}

/// Point-in-time view of a shape, read on demand from the facade.
///
/// Never cached across actions - the facade is the source of truth and a
/// human (or another session) may have mutated the shape in between.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSnapshot {
    pub id: String,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub props: Props,
}

/// Z-order operations the facade may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZOrder {
    ToFront,
    ToBack,
    Forward,
    Backward,
}

/// The mutation API of the underlying document.
///
/// Methods with default implementations are optional capabilities: an
/// implementation that lacks them reports `unsupported` (or `Ok(false)`)
/// and the engine falls back to a cruder path.
pub trait DocumentApi: Send {
    /// Bulk-create shapes. Implementations may reject the whole batch; the
    /// flusher then retries shape-by-shape via [`DocumentApi::create_shape`].
    fn create_shapes(&mut self, shapes: &[ShapeCreate]) -> Result<()>;

    /// Create a single shape (per-shape fallback path).
    fn create_shape(&mut self, shape: &ShapeCreate) -> Result<()>;

    /// Apply partial updates to existing shapes. Unknown ids are skipped.
    fn update_shapes(&mut self, updates: &[ShapeUpdate]) -> Result<()>;

    /// Delete shapes by id. Unknown ids are ignored.
    fn delete_shapes(&mut self, ids: &[String]) -> Result<()>;

    /// Read a shape's current state, if it exists.
    fn get_shape(&self, id: &str) -> Option<ShapeSnapshot>;

    /// Read a shape's bounding box in page coordinates.
    fn get_shape_page_bounds(&self, id: &str) -> Option<Bounds>;

    /// Move the caller's camera to show the given bounds.
    fn zoom_to_bounds(&mut self, bounds: Bounds) -> Result<()>;

    /// Resize a shape so its content fits the given bounds. Returns
    /// `Ok(false)` when the capability is unsupported, in which case the
    /// engine writes raw dimensions instead.
    fn fit_bounds_to_content(&mut self, _id: &str, _bounds: Bounds) -> Result<bool> {
        Ok(false)
    }

    /// Group shapes together under the given group id.
    fn group_shapes(&mut self, _ids: &[String], _group_id: &str) -> Result<()> {
        Err(anyhow!("grouping not supported by this document"))
    }

    /// Dissolve any groups containing the given shapes.
    fn ungroup_shapes(&mut self, _ids: &[String]) -> Result<()> {
        Err(anyhow!("grouping not supported by this document"))
    }

    /// Change the z-order of shapes.
    fn reorder_shapes(&mut self, _ids: &[String], _order: ZOrder) -> Result<()> {
        Err(anyhow!("reordering not supported by this document"))
    }

    /// Rotate shapes around their own centers.
    fn rotate_shapes(&mut self, _ids: &[String], _radians: f64) -> Result<()> {
        Err(anyhow!("rotation not supported by this document"))
    }

    /// Create a new page.
    fn create_page(&mut self, _name: &str) -> Result<()> {
        Err(anyhow!("pages not supported by this document"))
    }

    /// Switch to an existing page by name.
    fn switch_page(&mut self, _name: &str) -> Result<()> {
        Err(anyhow!("pages not supported by this document"))
    }
}

/// Default shape extent used when a creation payload omits dimensions.
const DEFAULT_EXTENT: f64 = 100.0;

#[derive(Debug, Clone)]
struct StoredShape {
    kind: String,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    props: Props,
    group: Option<String>,
}

/// In-memory document implementing the full facade contract.
///
/// Keeps shapes in insertion order so z-order operations are observable.
#[derive(Default)]
pub struct MemoryDocument {
    shapes: HashMap<String, StoredShape>,
    /// Ids in z-order, back to front.
    order: Vec<String>,
    pages: Vec<String>,
    current_page: Option<String>,
    pub viewport: Option<Bounds>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shapes currently in the document.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Ids in z-order, back to front.
    pub fn z_order(&self) -> &[String] {
        &self.order
    }

    pub fn shape_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    fn snapshot_of(&self, id: &str, shape: &StoredShape) -> ShapeSnapshot {
        ShapeSnapshot {
            id: id.to_string(),
            kind: shape.kind.clone(),
            x: shape.x,
            y: shape.y,
            w: shape.w,
            h: shape.h,
            props: shape.props.clone(),
        }
    }
}

impl DocumentApi for MemoryDocument {
    fn create_shapes(&mut self, shapes: &[ShapeCreate]) -> Result<()> {
        for shape in shapes {
            self.create_shape(shape)?;
        }
        Ok(())
    }

    fn create_shape(&mut self, shape: &ShapeCreate) -> Result<()> {
        if !self.shapes.contains_key(&shape.id) {
            self.order.push(shape.id.clone());
        }
        self.shapes.insert(
            shape.id.clone(),
            StoredShape {
                kind: shape.kind.clone(),
                x: shape.x,
                y: shape.y,
                w: shape.w.unwrap_or(DEFAULT_EXTENT),
                h: shape.h.unwrap_or(DEFAULT_EXTENT),
                props: shape.props.clone(),
                group: None,
            },
        );
        Ok(())
    }

    fn update_shapes(&mut self, updates: &[ShapeUpdate]) -> Result<()> {
        for update in updates {
            let Some(shape) = self.shapes.get_mut(&update.id) else {
                continue;
            };
            if let Some(x) = update.x {
                shape.x = x;
            }
            if let Some(y) = update.y {
                shape.y = y;
            }
            if let Some(w) = update.w {
                shape.w = w;
            }
            if let Some(h) = update.h {
                shape.h = h;
            }
            for (key, value) in &update.props {
                shape.props.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn delete_shapes(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if self.shapes.remove(id).is_some() {
                self.order.retain(|existing| existing != id);
            }
        }
        Ok(())
    }

    fn get_shape(&self, id: &str) -> Option<ShapeSnapshot> {
        self.shapes.get(id).map(|shape| self.snapshot_of(id, shape))
    }

    fn get_shape_page_bounds(&self, id: &str) -> Option<Bounds> {
        self.shapes
            .get(id)
            .map(|shape| Bounds::new(shape.x, shape.y, shape.w, shape.h))
    }

    fn zoom_to_bounds(&mut self, bounds: Bounds) -> Result<()> {
        self.viewport = Some(bounds);
        Ok(())
    }

    fn fit_bounds_to_content(&mut self, id: &str, bounds: Bounds) -> Result<bool> {
        let Some(shape) = self.shapes.get_mut(id) else {
            return Ok(false);
        };
        shape.x = bounds.x;
        shape.y = bounds.y;
        shape.w = bounds.w;
        shape.h = bounds.h;
        Ok(true)
    }

    fn group_shapes(&mut self, ids: &[String], group_id: &str) -> Result<()> {
        for id in ids {
            if let Some(shape) = self.shapes.get_mut(id) {
                shape.group = Some(group_id.to_string());
            }
        }
        Ok(())
    }

    fn ungroup_shapes(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if let Some(shape) = self.shapes.get_mut(id) {
                shape.group = None;
            }
        }
        Ok(())
    }

    fn reorder_shapes(&mut self, ids: &[String], order: ZOrder) -> Result<()> {
        for id in ids {
            let Some(pos) = self.order.iter().position(|existing| existing == id) else {
                continue;
            };
            let id = self.order.remove(pos);
            match order {
                ZOrder::ToFront => self.order.push(id),
                ZOrder::ToBack => self.order.insert(0, id),
                ZOrder::Forward => {
                    let target = (pos + 1).min(self.order.len());
                    self.order.insert(target, id);
                }
                ZOrder::Backward => {
                    self.order.insert(pos.saturating_sub(1), id);
                }
            }
        }
        Ok(())
    }

    fn rotate_shapes(&mut self, ids: &[String], radians: f64) -> Result<()> {
        for id in ids {
            if let Some(shape) = self.shapes.get_mut(id) {
                let current = shape
                    .props
                    .get("rotation")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                shape
                    .props
                    .insert("rotation".into(), serde_json::json!(current + radians));
            }
        }
        Ok(())
    }

    fn create_page(&mut self, name: &str) -> Result<()> {
        if !self.pages.iter().any(|page| page == name) {
            self.pages.push(name.to_string());
        }
        Ok(())
    }

    fn switch_page(&mut self, name: &str) -> Result<()> {
        if self.pages.iter().any(|page| page == name) {
            self.current_page = Some(name.to_string());
            Ok(())
        } else {
            Err(anyhow!("no such page: {}", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(id: &str, x: f64, y: f64) -> ShapeCreate {
        ShapeCreate {
            id: id.into(),
            kind: "geo".into(),
            x,
            y,
            w: Some(10.0),
            h: Some(10.0),
            props: Props::new(),
        }
    }

    #[test]
    fn update_merges_props_and_fields() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 0.0, 0.0)).unwrap();

        let mut update = ShapeUpdate::new("a");
        update.x = Some(5.0);
        update.props.insert("fill".into(), serde_json::json!("red"));
        doc.update_shapes(&[update]).unwrap();

        let snap = doc.get_shape("a").unwrap();
        assert_eq!(snap.x, 5.0);
        assert_eq!(snap.y, 0.0);
        assert_eq!(snap.props.get("fill"), Some(&serde_json::json!("red")));
    }

    #[test]
    fn fit_bounds_reports_whether_a_shape_was_resized() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 0.0, 0.0)).unwrap();

        let resized = doc
            .fit_bounds_to_content("a", Bounds::new(1.0, 2.0, 30.0, 40.0))
            .unwrap();
        assert!(resized);
        let snap = doc.get_shape("a").unwrap();
        assert_eq!((snap.x, snap.y, snap.w, snap.h), (1.0, 2.0, 30.0, 40.0));

        let resized = doc
            .fit_bounds_to_content("missing", Bounds::new(0.0, 0.0, 5.0, 5.0))
            .unwrap();
        assert!(!resized);
    }

    #[test]
    fn delete_unknown_id_is_a_noop() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 0.0, 0.0)).unwrap();
        doc.delete_shapes(&["missing".into(), "a".into()]).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn reorder_moves_shape_to_front() {
        let mut doc = MemoryDocument::new();
        doc.create_shape(&create("a", 0.0, 0.0)).unwrap();
        doc.create_shape(&create("b", 1.0, 0.0)).unwrap();
        doc.create_shape(&create("c", 2.0, 0.0)).unwrap();

        doc.reorder_shapes(&["a".into()], ZOrder::ToFront).unwrap();
        assert_eq!(doc.z_order(), ["b", "c", "a"]);

        doc.reorder_shapes(&["c".into()], ZOrder::Backward).unwrap();
        assert_eq!(doc.z_order(), ["c", "b", "a"]);
    }
}
