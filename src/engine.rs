//! Action engine - interprets agent actions and drives the normalizer and
//! batcher against the document facade.
//!
//! Each action is processed to completion or skipped; no state persists
//! between actions other than the per-session idempotency sets. Dispatch is
//! an exhaustive match over [`ActionKind`], so adding a kind without a
//! handler fails at compile time.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::Batch;
use crate::facade::{Bounds, DocumentApi, ShapeSnapshot, ShapeUpdate};
use crate::normalize::{is_directly_resizable, is_text_bearing, normalize_create, sanitize_update};
use crate::protocol::{
    Action, ActionEnvelope, ActionKind, Alignment, Axis, TodoItem, PROTOCOL_VERSION,
};

/// Result of applying one envelope.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    /// Actions dispatched for the first time.
    pub applied: usize,
    /// Actions skipped as replays of already-applied ids.
    pub skipped: usize,
    /// True when the whole envelope was dropped (protocol version mismatch).
    pub dropped: bool,
    /// Todo items surfaced by `todo` actions, for follow-up scheduling.
    pub todos: Vec<TodoItem>,
}

/// Result of applying a single action.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// False when the action was a replay and nothing was dispatched.
    pub applied: bool,
    pub todos: Vec<TodoItem>,
}

/// The command-application state machine.
///
/// Holds per-session sets of already-applied action ids so replayed or
/// duplicated envelopes produce no additional mutation. The sets only grow;
/// they are cleared when a session ends via [`Engine::end_session`].
pub struct Engine {
    applied: HashMap<String, HashSet<String>>,
    /// Whether this caller owns the viewport. Non-host sessions must not
    /// hijack another viewer's camera, so `set_viewport` is ignored.
    is_host: bool,
}

impl Engine {
    pub fn new(is_host: bool) -> Self {
        Self {
            applied: HashMap::new(),
            is_host,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Forget a session's applied-id set. Call when the session ends.
    pub fn end_session(&mut self, session_id: &str) {
        self.applied.remove(session_id);
    }

    /// Apply a whole envelope: version check, then per-action idempotency
    /// check and dispatch, with one batched commit at the end.
    pub fn apply_envelope(
        &mut self,
        doc: &mut dyn DocumentApi,
        envelope: &ActionEnvelope,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        if envelope.v != PROTOCOL_VERSION {
            warn!(
                got = envelope.v,
                expected = PROTOCOL_VERSION,
                session = %envelope.session_id,
                "dropping envelope with mismatched protocol version"
            );
            report.dropped = true;
            return Ok(report);
        }

        let mut batch = Batch::new();
        for action in &envelope.actions {
            if !self.should_apply(&envelope.session_id, action) {
                report.skipped += 1;
                continue;
            }
            self.dispatch(doc, &mut batch, action, &mut report.todos)?;
            report.applied += 1;
        }
        batch.flush(doc)?;

        Ok(report)
    }

    /// Apply a single action, staging and flushing its mutations atomically.
    ///
    /// This is the streaming-consumption entry point: the session controller
    /// applies each action as it arrives, never splitting a mutation across
    /// an await boundary.
    pub fn apply_action(
        &mut self,
        doc: &mut dyn DocumentApi,
        session_id: &str,
        action: &Action,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if !self.should_apply(session_id, action) {
            return Ok(outcome);
        }
        let mut batch = Batch::new();
        self.dispatch(doc, &mut batch, action, &mut outcome.todos)?;
        batch.flush(doc)?;
        outcome.applied = true;
        Ok(outcome)
    }

    /// Per-session idempotency check. An id is only burned once its action
    /// arrives complete: an in-progress action is provisional, and its
    /// revised successor reuses the same id.
    fn should_apply(&mut self, session_id: &str, action: &Action) -> bool {
        let seen = self.applied.entry(session_id.to_string()).or_default();
        if seen.contains(&action.id) {
            return false;
        }
        if action.is_complete() {
            seen.insert(action.id.clone());
        }
        true
    }

    fn dispatch(
        &mut self,
        doc: &mut dyn DocumentApi,
        batch: &mut Batch,
        action: &Action,
        todos: &mut Vec<TodoItem>,
    ) -> Result<()> {
        match &action.kind {
            ActionKind::CreateShape(spec) => {
                let normalized = normalize_create(spec);
                let id = normalized.payload.id.clone();
                let kind = normalized.payload.kind.clone();
                batch.stage_create(normalized.payload);
                // Two-phase creation: the facade rejects rich-text fields at
                // creation time, so text lands in a follow-up update.
                if let Some(text) = normalized.pending_text {
                    if is_text_bearing(&kind) {
                        let mut update = ShapeUpdate::new(id);
                        update.props.insert("text".into(), json!(text));
                        batch.stage_update(update);
                    }
                }
            }
            ActionKind::UpdateShape(params) => {
                flush_pending(doc, batch)?;
                // The agent's view of the document may be stale; referencing
                // a deleted shape is dropped silently, not an error.
                let Some(snapshot) = doc.get_shape(&params.id) else {
                    debug!(id = %params.id, "update targets missing shape, skipping");
                    return Ok(());
                };
                let mut update = ShapeUpdate {
                    id: params.id.clone(),
                    x: params.x,
                    y: params.y,
                    w: params.w,
                    h: params.h,
                    props: params.props.clone(),
                };
                sanitize_update(&snapshot.kind, &mut update);
                batch.stage_update(update);
            }
            ActionKind::DeleteShape(params) => {
                for id in params.all_ids() {
                    batch.stage_delete(id);
                }
            }
            ActionKind::Move(params) => {
                flush_pending(doc, batch)?;
                for id in unique(&params.ids) {
                    let Some(snapshot) = doc.get_shape(&id) else {
                        continue;
                    };
                    let mut update = ShapeUpdate::new(id.clone());
                    if let Some(target) = params.target {
                        // Preserve the shape's internal anchor offset from
                        // its page bounds.
                        let bounds = doc
                            .get_shape_page_bounds(&id)
                            .unwrap_or(Bounds::new(snapshot.x, snapshot.y, snapshot.w, snapshot.h));
                        update.x = Some(target.x + (snapshot.x - bounds.x));
                        update.y = Some(target.y + (snapshot.y - bounds.y));
                    } else {
                        update.x = Some(snapshot.x + params.dx);
                        update.y = Some(snapshot.y + params.dy);
                    }
                    batch.stage_update(update);
                }
            }
            ActionKind::Resize(params) => {
                flush_pending(doc, batch)?;
                if params.scale_x.is_some() || params.scale_y.is_some() {
                    self.resize_by_scale(doc, batch, params);
                } else {
                    self.resize_to_dimensions(doc, batch, params);
                }
            }
            ActionKind::Align(params) => {
                flush_pending(doc, batch)?;
                align(doc, batch, &params.ids, params.alignment);
            }
            ActionKind::Distribute(params) => {
                flush_pending(doc, batch)?;
                distribute(doc, batch, &params.ids, params.axis);
            }
            ActionKind::Stack(params) => {
                flush_pending(doc, batch)?;
                stack(doc, batch, &params.ids, params.axis, params.gap);
            }
            ActionKind::Reorder(params) => {
                flush_pending(doc, batch)?;
                // Best-effort: a failed z-order change must not abort the
                // rest of the action stream.
                if let Err(err) = doc.reorder_shapes(&params.ids, params.operation) {
                    warn!(error = %err, "reorder failed");
                }
            }
            ActionKind::Rotate(params) => {
                flush_pending(doc, batch)?;
                if let Err(err) = doc.rotate_shapes(&params.ids, params.radians) {
                    warn!(error = %err, "rotate failed");
                }
            }
            ActionKind::Group(params) => {
                flush_pending(doc, batch)?;
                let group_id = params
                    .group_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                if let Err(err) = doc.group_shapes(&params.ids, &group_id) {
                    warn!(error = %err, "group failed");
                }
            }
            ActionKind::Ungroup(params) => {
                flush_pending(doc, batch)?;
                if let Err(err) = doc.ungroup_shapes(&params.ids) {
                    warn!(error = %err, "ungroup failed");
                }
            }
            ActionKind::SetViewport(params) => {
                if self.is_host {
                    if let Err(err) = doc.zoom_to_bounds(params.bounds) {
                        warn!(error = %err, "viewport change failed");
                    }
                } else {
                    debug!("ignoring set_viewport from non-host session");
                }
            }
            ActionKind::CreatePage(params) => {
                flush_pending(doc, batch)?;
                if let Err(err) = doc.create_page(&params.name) {
                    warn!(error = %err, "create_page failed");
                }
            }
            ActionKind::SwitchPage(params) => {
                flush_pending(doc, batch)?;
                if let Err(err) = doc.switch_page(&params.name) {
                    warn!(error = %err, "switch_page failed");
                }
            }
            ActionKind::Todo(params) => {
                todos.extend(params.items.iter().cloned());
            }
            // Chat/context bookkeeping only; no document effect.
            ActionKind::Think(_) | ActionKind::AddDetail(_) => {}
            ActionKind::Unknown => {
                debug!(id = %action.id, "ignoring unknown action kind");
            }
        }
        Ok(())
    }

    /// Direct-dimension resize. Shapes without directly resizable
    /// dimensions go through the fit-bounds capability when present, else a
    /// raw dimension write.
    fn resize_to_dimensions(
        &self,
        doc: &mut dyn DocumentApi,
        batch: &mut Batch,
        params: &crate::protocol::ResizeParams,
    ) {
        for id in unique(&params.ids) {
            let Some(snapshot) = doc.get_shape(&id) else {
                continue;
            };
            let w = params.w.unwrap_or(snapshot.w);
            let h = params.h.unwrap_or(snapshot.h);

            if is_directly_resizable(&snapshot.kind) {
                let mut update = ShapeUpdate::new(id);
                update.w = Some(w);
                update.h = Some(h);
                batch.stage_update(update);
                continue;
            }

            let bounds = Bounds::new(snapshot.x, snapshot.y, w, h);
            match doc.fit_bounds_to_content(&id, bounds) {
                Ok(true) => {}
                Ok(false) => {
                    let mut update = ShapeUpdate::new(id);
                    update.w = Some(w);
                    update.h = Some(h);
                    batch.stage_update(update);
                }
                Err(err) => {
                    warn!(error = %err, id = %id, "fit_bounds_to_content failed");
                    let mut update = ShapeUpdate::new(id);
                    update.w = Some(w);
                    update.h = Some(h);
                    batch.stage_update(update);
                }
            }
        }
    }

    /// Scale-variant resize: recomputes absolute position and dimensions
    /// about an origin, and rescales line endpoint deltas proportionally.
    fn resize_by_scale(
        &self,
        doc: &mut dyn DocumentApi,
        batch: &mut Batch,
        params: &crate::protocol::ResizeParams,
    ) {
        let origin = params.origin.unwrap_or_default();
        let sx = params.scale_x.unwrap_or(1.0);
        let sy = params.scale_y.unwrap_or(1.0);

        for id in unique(&params.ids) {
            let Some(snapshot) = doc.get_shape(&id) else {
                continue;
            };
            let mut update = ShapeUpdate::new(id);
            update.x = Some(origin.x + (snapshot.x - origin.x) * sx);
            update.y = Some(origin.y + (snapshot.y - origin.y) * sy);
            update.w = Some(snapshot.w * sx);
            update.h = Some(snapshot.h * sy);
            if snapshot.kind == "line" {
                if let Some(points) = scaled_line_points(&snapshot, sx, sy) {
                    update.props.insert("points".into(), points);
                }
            }
            batch.stage_update(update);
        }
    }
}

/// Commit any staged work so a read-dependent operation observes ids
/// created earlier in the same envelope.
fn flush_pending(doc: &mut dyn DocumentApi, batch: &mut Batch) -> Result<()> {
    std::mem::take(batch).flush(doc)
}

fn unique(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Rescale a line's relative endpoint deltas.
fn scaled_line_points(snapshot: &ShapeSnapshot, sx: f64, sy: f64) -> Option<Value> {
    let Value::Object(points) = snapshot.props.get("points")? else {
        return None;
    };
    let mut scaled = serde_json::Map::new();
    for (key, point) in points {
        let Value::Object(point) = point else {
            scaled.insert(key.clone(), point.clone());
            continue;
        };
        let mut point = point.clone();
        if let Some(x) = point.get("x").and_then(Value::as_f64) {
            point.insert("x".into(), json!(x * sx));
        }
        if let Some(y) = point.get("y").and_then(Value::as_f64) {
            point.insert("y".into(), json!(y * sy));
        }
        scaled.insert(key.clone(), Value::Object(point));
    }
    Some(Value::Object(scaled))
}

/// Geometry observed for one layout target.
struct Placed {
    shape_x: f64,
    shape_y: f64,
    bounds: Bounds,
    update: ShapeUpdate,
}

fn collect_placed(doc: &dyn DocumentApi, ids: &[String]) -> Vec<Placed> {
    unique(ids)
        .into_iter()
        .filter_map(|id| {
            let snapshot = doc.get_shape(&id)?;
            let bounds = doc
                .get_shape_page_bounds(&id)
                .unwrap_or(Bounds::new(snapshot.x, snapshot.y, snapshot.w, snapshot.h));
            Some(Placed {
                shape_x: snapshot.x,
                shape_y: snapshot.y,
                bounds,
                update: ShapeUpdate::new(id),
            })
        })
        .collect()
}

/// Align shapes to a shared extremum (min/max/center) on one axis.
/// No-ops below two shapes.
fn align(doc: &mut dyn DocumentApi, batch: &mut Batch, ids: &[String], alignment: Alignment) {
    let mut placed = collect_placed(doc, ids);
    if placed.len() < 2 {
        return;
    }

    let min_x = placed.iter().map(|p| p.bounds.x).fold(f64::INFINITY, f64::min);
    let max_x = placed
        .iter()
        .map(|p| p.bounds.x + p.bounds.w)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_y = placed.iter().map(|p| p.bounds.y).fold(f64::INFINITY, f64::min);
    let max_y = placed
        .iter()
        .map(|p| p.bounds.y + p.bounds.h)
        .fold(f64::NEG_INFINITY, f64::max);

    for p in &mut placed {
        match alignment {
            Alignment::Left => {
                p.update.x = Some(p.shape_x + (min_x - p.bounds.x));
            }
            Alignment::Right => {
                p.update.x = Some(p.shape_x + (max_x - p.bounds.w - p.bounds.x));
            }
            Alignment::CenterHorizontal => {
                let center = (min_x + max_x) / 2.0;
                p.update.x = Some(p.shape_x + (center - p.bounds.w / 2.0 - p.bounds.x));
            }
            Alignment::Top => {
                p.update.y = Some(p.shape_y + (min_y - p.bounds.y));
            }
            Alignment::Bottom => {
                p.update.y = Some(p.shape_y + (max_y - p.bounds.h - p.bounds.y));
            }
            Alignment::CenterVertical => {
                let center = (min_y + max_y) / 2.0;
                p.update.y = Some(p.shape_y + (center - p.bounds.h / 2.0 - p.bounds.y));
            }
        }
    }

    for p in placed {
        batch.stage_update(p.update);
    }
}

/// Space shapes evenly between the first and last along one axis.
/// No-ops below three shapes.
fn distribute(doc: &mut dyn DocumentApi, batch: &mut Batch, ids: &[String], axis: Axis) {
    let mut placed = collect_placed(doc, ids);
    if placed.len() < 3 {
        return;
    }

    // Sort by current position so the result is independent of the order
    // the ids arrived in; ties break on id for determinism.
    placed.sort_by(|a, b| {
        let (pa, pb) = match axis {
            Axis::Horizontal => (a.bounds.x, b.bounds.x),
            Axis::Vertical => (a.bounds.y, b.bounds.y),
        };
        pa.partial_cmp(&pb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.update.id.cmp(&b.update.id))
    });

    let (span_start, span_end, total_extent) = match axis {
        Axis::Horizontal => (
            placed[0].bounds.x,
            placed.last().map(|p| p.bounds.x + p.bounds.w).unwrap_or(0.0),
            placed.iter().map(|p| p.bounds.w).sum::<f64>(),
        ),
        Axis::Vertical => (
            placed[0].bounds.y,
            placed.last().map(|p| p.bounds.y + p.bounds.h).unwrap_or(0.0),
            placed.iter().map(|p| p.bounds.h).sum::<f64>(),
        ),
    };

    let gap = (span_end - span_start - total_extent) / (placed.len() - 1) as f64;
    let mut cursor = span_start;
    for p in &mut placed {
        match axis {
            Axis::Horizontal => {
                p.update.x = Some(p.shape_x + (cursor - p.bounds.x));
                cursor += p.bounds.w + gap;
            }
            Axis::Vertical => {
                p.update.y = Some(p.shape_y + (cursor - p.bounds.y));
                cursor += p.bounds.h + gap;
            }
        }
    }

    for p in placed {
        batch.stage_update(p.update);
    }
}

/// Lay shapes out sequentially along one axis with a fixed gap, preserving
/// the cross-axis coordinate. No-ops below two shapes.
fn stack(doc: &mut dyn DocumentApi, batch: &mut Batch, ids: &[String], axis: Axis, gap: f64) {
    let mut placed = collect_placed(doc, ids);
    if placed.len() < 2 {
        return;
    }

    placed.sort_by(|a, b| {
        let (pa, pb) = match axis {
            Axis::Horizontal => (a.bounds.x, b.bounds.x),
            Axis::Vertical => (a.bounds.y, b.bounds.y),
        };
        pa.partial_cmp(&pb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.update.id.cmp(&b.update.id))
    });

    let mut cursor = match axis {
        Axis::Horizontal => placed[0].bounds.x,
        Axis::Vertical => placed[0].bounds.y,
    };
    for p in &mut placed {
        match axis {
            Axis::Horizontal => {
                p.update.x = Some(p.shape_x + (cursor - p.bounds.x));
                cursor += p.bounds.w + gap;
            }
            Axis::Vertical => {
                p.update.y = Some(p.shape_y + (cursor - p.bounds.y));
                cursor += p.bounds.h + gap;
            }
        }
    }

    for p in placed {
        batch.stage_update(p.update);
    }
}
