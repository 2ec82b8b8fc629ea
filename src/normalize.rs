//! Command normalizer - turns declarative shape descriptions into the
//! concrete payloads the document facade accepts.
//!
//! Normalization is pure and total: it never fails. Agent-produced input is
//! untrusted, so malformed geometry degrades to a safe default instead of
//! erroring, and unknown shape types pass through with their raw type string
//! and unmodified props.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::facade::{Props, ShapeCreate, ShapeUpdate};
use crate::protocol::ShapeSpec;

/// High-level kinds that normalize to a generic "geo" shape.
const GEO_KINDS: &[&str] = &[
    "rectangle", "ellipse", "triangle", "diamond", "rhombus", "hexagon", "star",
];

/// Keys that carry text content in agent-issued props.
const TEXT_KEYS: &[&str] = &["text", "label", "content"];

/// Default arrow when the agent supplies no endpoint data: 100 units to the
/// right of the shape origin.
const DEFAULT_ARROW_REACH: f64 = 100.0;

/// Result of normalizing a creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCreate {
    pub payload: ShapeCreate,
    /// Text stripped from the creation payload. Text-bearing shapes get their
    /// content in a follow-up update because the facade validates creation
    /// payloads strictly and rejects rich-text fields at creation time.
    pub pending_text: Option<String>,
}

/// True for facade-level kinds that carry text content.
pub fn is_text_bearing(kind: &str) -> bool {
    matches!(kind, "geo" | "text")
}

/// True for facade-level kinds whose dimensions can be written directly.
pub fn is_directly_resizable(kind: &str) -> bool {
    matches!(kind, "geo" | "text")
}

/// Normalize a declarative shape description into a creation payload.
pub fn normalize_create(spec: &ShapeSpec) -> NormalizedCreate {
    let id = spec
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut props = spec.props.clone();
    let mut pending_text = spec.text.clone();

    let kind = if GEO_KINDS.contains(&spec.kind.as_str()) {
        pending_text = strip_text(&mut props).or(pending_text);
        props.insert("geo".into(), json!(spec.kind));
        "geo".to_string()
    } else if spec.kind == "note" || spec.kind == "text" {
        pending_text = strip_text(&mut props).or(pending_text);
        "text".to_string()
    } else if spec.kind == "arrow" {
        normalize_arrow_props(spec, &mut props);
        spec.kind.clone()
    } else if spec.kind == "line" {
        normalize_line_props(spec, &mut props);
        spec.kind.clone()
    } else if spec.kind == "draw" || spec.kind == "pen" {
        normalize_draw_props(&mut props);
        "draw".to_string()
    } else {
        // Unknown types pass through untouched.
        spec.kind.clone()
    };

    NormalizedCreate {
        payload: ShapeCreate {
            id,
            kind,
            x: spec.x,
            y: spec.y,
            w: spec.w,
            h: spec.h,
            props,
        },
        pending_text,
    }
}

/// Strip fields that are invalid for the given shape family from an update,
/// mirroring the creation rules.
pub fn sanitize_update(kind: &str, update: &mut ShapeUpdate) {
    match kind {
        "arrow" => {
            for key in ["fromId", "toId", "x1", "y1", "x2", "y2"] {
                update.props.remove(key);
            }
        }
        "line" => {
            update.props.remove("startPoint");
            update.props.remove("endPoint");
            for key in ["x1", "y1", "x2", "y2"] {
                update.props.remove(key);
            }
        }
        _ => {}
    }
}

/// Remove the first present text-like key from props, returning its value.
fn strip_text(props: &mut Props) -> Option<String> {
    let mut found = None;
    for key in TEXT_KEYS {
        if let Some(value) = props.remove(*key) {
            if found.is_none() {
                found = match value {
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                };
            }
        }
    }
    found
}

fn finite_f64(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|n| n.is_finite())
}

/// Arrows carry relative `start`/`end` offsets. Non-schema endpoint fields
/// are stripped; absolute endpoint pairs are converted to offsets from the
/// shape origin when provided.
fn normalize_arrow_props(spec: &ShapeSpec, props: &mut Props) {
    props.remove("fromId");
    props.remove("toId");
    let x1 = finite_f64(props.get("x1"));
    let y1 = finite_f64(props.get("y1"));
    let x2 = finite_f64(props.get("x2"));
    let y2 = finite_f64(props.get("y2"));
    for key in ["x1", "y1", "x2", "y2"] {
        props.remove(key);
    }

    let (start, end) = match (x1, y1, x2, y2) {
        (Some(x1), Some(y1), Some(x2), Some(y2)) => (
            json!({"x": x1 - spec.x, "y": y1 - spec.y}),
            json!({"x": x2 - spec.x, "y": y2 - spec.y}),
        ),
        _ => (
            endpoint_or(props.get("start"), 0.0, 0.0),
            endpoint_or(props.get("end"), DEFAULT_ARROW_REACH, 0.0),
        ),
    };
    props.insert("start".into(), start);
    props.insert("end".into(), end);
}

/// Keep an existing endpoint object when it has finite coordinates,
/// otherwise fall back to the given default.
fn endpoint_or(existing: Option<&Value>, default_x: f64, default_y: f64) -> Value {
    if let Some(Value::Object(map)) = existing {
        let x = finite_f64(map.get("x"));
        let y = finite_f64(map.get("y"));
        if let (Some(x), Some(y)) = (x, y) {
            return json!({"x": x, "y": y});
        }
    }
    json!({"x": default_x, "y": default_y})
}

/// Lines use an indexed two-point structure relative to the shape origin.
fn normalize_line_props(spec: &ShapeSpec, props: &mut Props) {
    let start = point_from(props.get("startPoint"))
        .or_else(|| pair_from(props.get("x1"), props.get("y1")));
    let end = point_from(props.get("endPoint"))
        .or_else(|| pair_from(props.get("x2"), props.get("y2")));
    props.remove("startPoint");
    props.remove("endPoint");
    for key in ["x1", "y1", "x2", "y2"] {
        props.remove(key);
    }

    // Absolute coordinates are rebased by subtracting the shape origin.
    let (a1, a2) = match (start, end) {
        (Some(start), Some(end)) => (
            (start.0 - spec.x, start.1 - spec.y),
            (end.0 - spec.x, end.1 - spec.y),
        ),
        _ => ((0.0, 0.0), (DEFAULT_ARROW_REACH, 0.0)),
    };

    props.insert(
        "points".into(),
        json!({
            "a1": {"id": "a1", "index": "a1", "x": a1.0, "y": a1.1},
            "a2": {"id": "a2", "index": "a2", "x": a2.0, "y": a2.1},
        }),
    );
}

fn point_from(value: Option<&Value>) -> Option<(f64, f64)> {
    let Value::Object(map) = value? else {
        return None;
    };
    Some((finite_f64(map.get("x"))?, finite_f64(map.get("y"))?))
}

fn pair_from(x: Option<&Value>, y: Option<&Value>) -> Option<(f64, f64)> {
    Some((
        finite_f64(x)?,
        finite_f64(y)?,
    ))
}

/// Draw strokes are wrapped in a single "free" segment with defaulted
/// pressure values.
fn normalize_draw_props(props: &mut Props) {
    let raw_points = match props.remove("points") {
        Some(Value::Array(points)) => points,
        Some(other) => {
            // Malformed points payload: keep the value out of the schema but
            // still produce a valid empty stroke.
            tracing::debug!(?other, "discarding malformed draw points");
            Vec::new()
        }
        None => Vec::new(),
    };

    let points: Vec<Value> = raw_points
        .into_iter()
        .enumerate()
        .map(|(index, point)| {
            let (x, y, z) = match &point {
                Value::Object(map) => (
                    finite_f64(map.get("x")).unwrap_or(0.0),
                    finite_f64(map.get("y")).unwrap_or(0.0),
                    finite_f64(map.get("z")),
                ),
                _ => (0.0, 0.0, None),
            };
            let z = z.unwrap_or(if index == 0 { 0.5 } else { 0.6 });
            json!({"x": x, "y": y, "z": z})
        })
        .collect();

    props.insert(
        "segments".into(),
        json!([{"type": "free", "points": points}]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str, x: f64, y: f64, props: Value) -> ShapeSpec {
        ShapeSpec {
            id: Some("s1".into()),
            kind: kind.into(),
            x,
            y,
            props: props.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn rectangle_normalizes_to_geo_with_text_stripped() {
        let normalized = normalize_create(&spec(
            "rectangle",
            0.0,
            0.0,
            json!({"text": "hello", "color": "red"}),
        ));
        assert_eq!(normalized.payload.kind, "geo");
        assert_eq!(normalized.payload.props.get("geo"), Some(&json!("rectangle")));
        assert!(normalized.payload.props.get("text").is_none());
        assert_eq!(normalized.pending_text.as_deref(), Some("hello"));
    }

    #[test]
    fn note_normalizes_to_text_shape() {
        let normalized = normalize_create(&spec("note", 0.0, 0.0, json!({"text": "memo"})));
        assert_eq!(normalized.payload.kind, "text");
        assert_eq!(normalized.pending_text.as_deref(), Some("memo"));
    }

    #[test]
    fn arrow_derives_relative_endpoints() {
        let normalized = normalize_create(&spec(
            "arrow",
            10.0,
            10.0,
            json!({"x1": 10.0, "y1": 10.0, "x2": 60.0, "y2": 40.0, "fromId": "a", "toId": "b"}),
        ));
        let props = &normalized.payload.props;
        assert!(props.get("fromId").is_none());
        assert!(props.get("x1").is_none());
        assert_eq!(props.get("start"), Some(&json!({"x": 0.0, "y": 0.0})));
        assert_eq!(props.get("end"), Some(&json!({"x": 50.0, "y": 30.0})));
    }

    #[test]
    fn arrow_without_endpoints_gets_default_reach() {
        let normalized = normalize_create(&spec("arrow", 0.0, 0.0, json!({})));
        let props = &normalized.payload.props;
        assert_eq!(props.get("start"), Some(&json!({"x": 0.0, "y": 0.0})));
        assert_eq!(props.get("end"), Some(&json!({"x": 100.0, "y": 0.0})));
    }

    #[test]
    fn line_rebases_endpoints_to_shape_origin() {
        let normalized = normalize_create(&spec(
            "line",
            -180.0,
            -20.0,
            json!({"startPoint": {"x": -180.0, "y": -20.0}, "endPoint": {"x": -180.0, "y": 150.0}}),
        ));
        let points = normalized.payload.props.get("points").unwrap();
        assert_eq!(points["a1"]["x"], json!(0.0));
        assert_eq!(points["a1"]["y"], json!(0.0));
        assert_eq!(points["a2"]["x"], json!(0.0));
        assert_eq!(points["a2"]["y"], json!(170.0));
    }

    #[test]
    fn draw_points_get_default_pressure() {
        let normalized = normalize_create(&spec(
            "draw",
            0.0,
            0.0,
            json!({"points": [{"x": 1.0, "y": 2.0}, {"x": 3.0, "y": 4.0, "z": 0.9}, {"x": 5.0, "y": 6.0}]}),
        ));
        let segments = normalized.payload.props.get("segments").unwrap();
        let points = &segments[0]["points"];
        assert_eq!(segments[0]["type"], json!("free"));
        assert_eq!(points[0]["z"], json!(0.5));
        assert_eq!(points[1]["z"], json!(0.9));
        assert_eq!(points[2]["z"], json!(0.6));
    }

    fn update(props: Value) -> ShapeUpdate {
        ShapeUpdate {
            props: props.as_object().cloned().unwrap_or_default(),
            ..ShapeUpdate::new("s1")
        }
    }

    #[test]
    fn arrow_update_drops_binding_and_endpoint_fields() {
        let mut upd = update(json!({
            "fromId": "a", "toId": "b",
            "x1": 1.0, "y1": 2.0, "x2": 3.0, "y2": 4.0,
            "color": "red",
        }));
        sanitize_update("arrow", &mut upd);
        for key in ["fromId", "toId", "x1", "y1", "x2", "y2"] {
            assert!(upd.props.get(key).is_none(), "{key} should be stripped");
        }
        assert_eq!(upd.props.get("color"), Some(&json!("red")));
    }

    #[test]
    fn line_update_drops_point_fields() {
        let mut upd = update(json!({
            "startPoint": {"x": 0.0, "y": 0.0},
            "endPoint": {"x": 5.0, "y": 5.0},
            "x1": 1.0, "y2": 4.0,
            "dash": "dotted",
        }));
        sanitize_update("line", &mut upd);
        for key in ["startPoint", "endPoint", "x1", "y2"] {
            assert!(upd.props.get(key).is_none(), "{key} should be stripped");
        }
        assert_eq!(upd.props.get("dash"), Some(&json!("dotted")));
    }

    #[test]
    fn sanitize_leaves_other_kinds_alone() {
        let mut upd = update(json!({"x1": 1.0, "geo": "rectangle"}));
        sanitize_update("geo", &mut upd);
        assert_eq!(upd.props.get("x1"), Some(&json!(1.0)));
    }

    #[test]
    fn unknown_type_passes_through_untouched() {
        let normalized = normalize_create(&spec(
            "hologram",
            1.0,
            2.0,
            json!({"text": "kept", "weird": true}),
        ));
        assert_eq!(normalized.payload.kind, "hologram");
        assert_eq!(normalized.payload.props.get("text"), Some(&json!("kept")));
        assert_eq!(normalized.pending_text, None);
    }
}
