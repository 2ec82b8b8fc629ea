//! Synchronization core for an AI-agent/human shared canvas.
//!
//! The agent speaks a versioned action envelope protocol; this crate turns
//! those streamed actions into batched, idempotent mutations against a
//! document behind the [`facade::DocumentApi`] trait, tracks diffs so
//! provisional actions can be reverted without disturbing concurrent human
//! edits, and keeps a versioned registry of live UI components with
//! last-writer-wins conflict resolution.
//!
//! The main pieces:
//!
//! - [`protocol`]: wire types for actions and envelopes.
//! - [`facade`]: the document abstraction the engine mutates.
//! - [`normalize`]: shape-spec normalization from agent dialect to facade
//!   payloads.
//! - [`batch`] and [`engine`]: staged mutation batching and the command
//!   dispatcher.
//! - [`undo`]: diff-based change tracking and revert.
//! - [`stream`]: text-event-stream decoding of agent output.
//! - [`session`]: the request lifecycle controller.
//! - [`registry`]: the live component store.

pub mod batch;
pub mod engine;
pub mod facade;
pub mod normalize;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stream;
pub mod undo;

pub use engine::{ApplyOutcome, ApplyReport, Engine};
pub use facade::{Bounds, DocumentApi, MemoryDocument, Point, Props};
pub use protocol::{Action, ActionEnvelope, ActionKind, PROTOCOL_VERSION};
pub use registry::{ComponentRegistry, RegistrationInfo, UpdateOptions, UpdateOutcome};
pub use session::{AgentRequest, AgentSession, AgentTransport, CancelHandle, SessionConfig};
pub use stream::decode_actions;
pub use undo::{ActionDiff, ChangeTracker};
