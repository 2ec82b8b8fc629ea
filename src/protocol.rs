//! Wire protocol for agent-issued document actions.
//!
//! An agent emits an ordered sequence of [`Action`]s, batched into
//! [`ActionEnvelope`]s. The envelope is the unit of versioning and replay
//! protection: a version mismatch drops the whole envelope, and every action
//! carries an id that is unique within its session so replays can be
//! detected via the `sessionId::actionId` idempotency key.

use serde::{Deserialize, Serialize};

use crate::facade::{Bounds, Point, Props};

/// Protocol version this implementation speaks. Envelopes carrying any other
/// version are dropped entirely (forward-compat fail-safe).
pub const PROTOCOL_VERSION: u32 = 1;

/// One declarative document edit instruction from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique within one originating session; `sessionId::id` is the global
    /// idempotency key.
    pub id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// `Some(false)` marks a speculative action that may be superseded by
    /// its successor before being finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            kind,
            complete: None,
        }
    }

    /// An action is incomplete only when explicitly marked so.
    pub fn is_complete(&self) -> bool {
        self.complete.unwrap_or(true)
    }
}

/// A versioned, session-scoped batch of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    pub v: u32,
    pub session_id: String,
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// True while the originating response is still streaming.
    #[serde(default)]
    pub partial: bool,
    pub actions: Vec<Action>,
}

impl ActionEnvelope {
    pub fn new(session_id: impl Into<String>, seq: u64, actions: Vec<Action>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            session_id: session_id.into(),
            seq,
            ts: 0,
            partial: false,
            actions,
        }
    }
}

/// Every action kind the engine understands.
///
/// Deserialized from the wire `name`/`params` pair. Unrecognized names land
/// on [`ActionKind::Unknown`] so a newer agent never fails an older engine;
/// they dispatch to a logged no-op. Deserialization is hand-written because
/// the fallback must also swallow whatever `params` payload the unknown
/// action carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", content = "params", rename_all = "snake_case")]
pub enum ActionKind {
    CreateShape(ShapeSpec),
    UpdateShape(UpdateShapeParams),
    DeleteShape(DeleteShapeParams),
    Move(MoveParams),
    Resize(ResizeParams),
    Align(AlignParams),
    Distribute(DistributeParams),
    Stack(StackParams),
    Reorder(ReorderParams),
    Rotate(RotateParams),
    Group(GroupParams),
    Ungroup(UngroupParams),
    SetViewport(SetViewportParams),
    CreatePage(PageParams),
    SwitchPage(PageParams),
    Think(ThinkParams),
    Todo(TodoParams),
    AddDetail(AddDetailParams),
    Unknown,
}

impl<'de> Deserialize<'de> for ActionKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawKind {
            name: String,
            #[serde(default)]
            params: serde_json::Value,
        }

        fn params<T, E>(value: serde_json::Value) -> Result<T, E>
        where
            T: serde::de::DeserializeOwned,
            E: serde::de::Error,
        {
            // An absent params field means "all defaults" for kinds whose
            // fields are all optional.
            let value = match value {
                serde_json::Value::Null => serde_json::Value::Object(Props::new()),
                other => other,
            };
            serde_json::from_value(value).map_err(E::custom)
        }

        let raw = RawKind::deserialize(deserializer)?;
        Ok(match raw.name.as_str() {
            "create_shape" => ActionKind::CreateShape(params::<_, D::Error>(raw.params)?),
            "update_shape" => ActionKind::UpdateShape(params::<_, D::Error>(raw.params)?),
            "delete_shape" => ActionKind::DeleteShape(params::<_, D::Error>(raw.params)?),
            "move" => ActionKind::Move(params::<_, D::Error>(raw.params)?),
            "resize" => ActionKind::Resize(params::<_, D::Error>(raw.params)?),
            "align" => ActionKind::Align(params::<_, D::Error>(raw.params)?),
            "distribute" => ActionKind::Distribute(params::<_, D::Error>(raw.params)?),
            "stack" => ActionKind::Stack(params::<_, D::Error>(raw.params)?),
            "reorder" => ActionKind::Reorder(params::<_, D::Error>(raw.params)?),
            "rotate" => ActionKind::Rotate(params::<_, D::Error>(raw.params)?),
            "group" => ActionKind::Group(params::<_, D::Error>(raw.params)?),
            "ungroup" => ActionKind::Ungroup(params::<_, D::Error>(raw.params)?),
            "set_viewport" => ActionKind::SetViewport(params::<_, D::Error>(raw.params)?),
            "create_page" => ActionKind::CreatePage(params::<_, D::Error>(raw.params)?),
            "switch_page" => ActionKind::SwitchPage(params::<_, D::Error>(raw.params)?),
            "think" => ActionKind::Think(params::<_, D::Error>(raw.params)?),
            "todo" => ActionKind::Todo(params::<_, D::Error>(raw.params)?),
            "add_detail" => ActionKind::AddDetail(params::<_, D::Error>(raw.params)?),
            // Forward compatibility: a newer agent's action no-ops here,
            // params payload and all.
            _ => ActionKind::Unknown,
        })
    }
}

/// Declarative description of a shape to create, as the agent speaks it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// High-level kind: "rectangle", "ellipse", "note", "arrow", "line",
    /// "draw", ... Unknown kinds pass through to the facade untouched.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub props: Props,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateShapeParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    #[serde(default)]
    pub props: Props,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteShapeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
}

impl DeleteShapeParams {
    /// All target ids, whichever wire field carried them.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = self.ids.clone();
        if let Some(id) = &self.id {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveParams {
    #[serde(default)]
    pub ids: Vec<String>,
    /// Absolute destination; takes precedence over `dx`/`dy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Point>,
    #[serde(default)]
    pub dx: f64,
    #[serde(default)]
    pub dy: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    /// Scale-variant fields: when `scale_x`/`scale_y` are present the resize
    /// is a proportional rescale about `origin` instead of a dimension write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    Left,
    Right,
    Top,
    Bottom,
    CenterHorizontal,
    CenterVertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignParams {
    #[serde(default)]
    pub ids: Vec<String>,
    pub alignment: Alignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeParams {
    #[serde(default)]
    pub ids: Vec<String>,
    pub axis: Axis,
}

fn default_stack_gap() -> f64 {
    16.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackParams {
    #[serde(default)]
    pub ids: Vec<String>,
    pub axis: Axis,
    #[serde(default = "default_stack_gap")]
    pub gap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderParams {
    #[serde(default)]
    pub ids: Vec<String>,
    pub operation: crate::facade::ZOrder,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateParams {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub radians: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupParams {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UngroupParams {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetViewportParams {
    pub bounds: Bounds,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkParams {
    #[serde(default)]
    pub text: String,
}

/// A single agent todo item, used for post-request continuation scheduling.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoParams {
    #[serde(default)]
    pub items: Vec<TodoItem>,
}

/// Component-bound side payload: routed to the component registry rather
/// than the document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDetailParams {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub component_type: String,
    #[serde(default)]
    pub props: Props,
}
