//! Component state registry - reconciles out-of-order, duplicate, or racing
//! updates from multiple writers into one canonical state per logical
//! component.
//!
//! The registry is an explicitly constructed service passed by reference, so
//! tests (and embedders) can run isolated instances. Ordering across writers
//! is version/timestamp precedence with a documented tie-break - explicitly
//! not FIFO. A cooldown-based circuit breaker stops feedback loops where a
//! component's own update callback triggers another identical update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::facade::Props;

/// Default cooldown for the identical-update circuit breaker.
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(3);

/// Callback invoked with the merged props after every accepted update.
pub type UpdateCallback = Arc<dyn Fn(&Props) -> Result<()> + Send + Sync>;

/// One entry of the append-only per-component audit trail: a changed
/// top-level key on an accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct PropDiff {
    pub key: String,
    pub previous: Option<Value>,
    pub next: Option<Value>,
    pub ts: i64,
}

/// Merged canonical state for one logical component.
pub struct RegisteredComponent {
    pub message_id: String,
    pub component_type: String,
    pub props: Props,
    pub version: Option<u64>,
    pub last_updated: Option<i64>,
    pub context_key: Option<String>,
    pub original_props: Props,
    pub diff_history: Vec<PropDiff>,
    /// Per-token callbacks so each subscriber's wiring is released with its
    /// reference.
    callbacks: HashMap<u64, UpdateCallback>,
}

/// Registration request for a logical component.
#[derive(Clone, Default)]
pub struct RegistrationInfo {
    pub message_id: String,
    pub component_type: String,
    pub props: Props,
    pub version: Option<u64>,
    pub timestamp: Option<i64>,
    pub context_key: Option<String>,
    pub callback: Option<UpdateCallback>,
}

/// Version/timestamp tags on an update.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub version: Option<u64>,
    pub timestamp: Option<i64>,
}

/// Opaque per-caller reference token returned by `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryToken {
    message_id: String,
    serial: u64,
}

/// Outcome of an `update` call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// State committed and all callbacks succeeded.
    Accepted,
    /// State committed but one or more callbacks failed; the committed
    /// state is never rolled back.
    AcceptedWithCallbackErrors(String),
    /// Rejected by version/timestamp precedence; stored props retained,
    /// bookkeeping timestamp still advanced.
    Ignored,
    /// Rejected by the circuit breaker: an identical patch was submitted
    /// within the cooldown window.
    Blocked,
}

impl UpdateOutcome {
    pub fn committed(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Accepted | UpdateOutcome::AcceptedWithCallbackErrors(_)
        )
    }
}

/// Notification published after any committed registry mutation.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub message_id: String,
    pub props: Props,
}

/// Cooldown-based suppressor for repeated identical updates.
struct CircuitBreaker {
    cooldown: Duration,
    recent: HashMap<String, Instant>,
}

impl CircuitBreaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            recent: HashMap::new(),
        }
    }

    /// Returns true when this exact submission should be blocked.
    fn check_and_record(&mut self, key: String) -> bool {
        let now = Instant::now();
        self.recent
            .retain(|_, seen| now.duration_since(*seen) < self.cooldown);
        match self.recent.get(&key) {
            Some(seen) if now.duration_since(*seen) < self.cooldown => true,
            _ => {
                self.recent.insert(key, now);
                false
            }
        }
    }
}

/// The multi-writer component state store.
pub struct ComponentRegistry {
    components: HashMap<String, RegisteredComponent>,
    /// Active reference tokens per component id.
    tokens: HashMap<String, Vec<u64>>,
    /// Applied operation-log entry ids per component, for `_ops` dedup.
    op_logs: HashMap<String, Vec<String>>,
    next_serial: u64,
    breaker: CircuitBreaker,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::with_breaker_cooldown(DEFAULT_BREAKER_COOLDOWN)
    }

    /// Construct with a custom circuit-breaker cooldown (tests use a short
    /// one).
    pub fn with_breaker_cooldown(cooldown: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            components: HashMap::new(),
            tokens: HashMap::new(),
            op_logs: HashMap::new(),
            next_serial: 0,
            breaker: CircuitBreaker::new(cooldown),
            events,
        }
    }

    /// Subscribe to committed-mutation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Create or update the record for `info.message_id` and take a
    /// reference to it.
    ///
    /// Conflict rule: an explicit higher version always wins; equal versions
    /// break ties by timestamp (incoming >= stored accepted); an incoming
    /// update with neither version nor timestamp is accepted unconditionally
    /// (back-compat for untagged writers). A rejected registration keeps the
    /// stored props but still refreshes bookkeeping and callback wiring.
    pub fn register(&mut self, info: RegistrationInfo) -> RegistryToken {
        self.next_serial += 1;
        let serial = self.next_serial;
        let now = now_ms();

        match self.components.get_mut(&info.message_id) {
            Some(component) => {
                let accept = should_accept(
                    info.version,
                    info.timestamp,
                    component.version,
                    component.last_updated,
                );
                if accept {
                    record_diffs(component, &info.props, now);
                    for (key, value) in info.props {
                        component.props.insert(key, value);
                    }
                    component.version = info.version.or(component.version);
                    component.component_type = info.component_type;
                    component.last_updated = Some(info.timestamp.unwrap_or(now));
                } else {
                    // Bookkeeping advances monotonically; adopting a rejected
                    // writer's older timestamp would rewind the tie-break
                    // clock and let a later stale write win.
                    component.last_updated = Some(advance_ts(
                        component.last_updated,
                        info.timestamp.unwrap_or(now),
                    ));
                }
                if info.context_key.is_some() {
                    component.context_key = info.context_key;
                }
                if let Some(callback) = info.callback {
                    component.callbacks.insert(serial, callback);
                }
            }
            None => {
                let mut callbacks = HashMap::new();
                if let Some(callback) = info.callback {
                    callbacks.insert(serial, callback);
                }
                self.components.insert(
                    info.message_id.clone(),
                    RegisteredComponent {
                        message_id: info.message_id.clone(),
                        component_type: info.component_type,
                        original_props: info.props.clone(),
                        props: info.props,
                        version: info.version,
                        last_updated: Some(info.timestamp.unwrap_or(now)),
                        context_key: info.context_key,
                        diff_history: Vec::new(),
                        callbacks,
                    },
                );
            }
        }

        self.tokens
            .entry(info.message_id.clone())
            .or_default()
            .push(serial);

        RegistryToken {
            message_id: info.message_id,
            serial,
        }
    }

    /// Apply a patch to a registered component.
    ///
    /// Operation-log entries in `patch._ops` apply first (deduplicated
    /// against the component's op log), then the remaining patch fields
    /// merge over the result. Callback failures are aggregated and reported
    /// once, but never roll back the committed state.
    pub fn update(
        &mut self,
        message_id: &str,
        mut patch: Props,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let breaker_key = format!(
            "{}::{}",
            message_id,
            serde_json::to_string(&patch).unwrap_or_default()
        );
        if self.breaker.check_and_record(breaker_key) {
            debug!(id = %message_id, "circuit breaker blocked identical update");
            return Ok(UpdateOutcome::Blocked);
        }

        if !self.components.contains_key(message_id) {
            let mut known: Vec<&str> = self.components.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(anyhow!(
                "component '{}' not found (known components: [{}])",
                message_id,
                known.join(", ")
            ));
        }

        let ops = match patch.remove("_ops") {
            Some(Value::Array(ops)) => ops,
            Some(other) => {
                warn!(id = %message_id, ?other, "ignoring malformed _ops payload");
                Vec::new()
            }
            None => Vec::new(),
        };

        let now = now_ms();
        let (stored_version, stored_ts) = {
            let component = self.components.get(message_id).expect("checked above");
            (component.version, component.last_updated)
        };

        let accept = should_accept(options.version, options.timestamp, stored_version, stored_ts);
        if !accept {
            // Rejected updates keep the stored props but bookkeeping still
            // advances. Monotonic only: a rejected older timestamp must not
            // rewind the tie-break clock.
            let component = self.components.get_mut(message_id).expect("checked above");
            component.last_updated = Some(advance_ts(
                component.last_updated,
                options.timestamp.unwrap_or(now),
            ));
            return Ok(UpdateOutcome::Ignored);
        }

        // Ops apply first, then the plain patch merges over the result.
        let mut folded = Props::new();
        let op_log = self.op_logs.entry(message_id.to_string()).or_default();
        for op in ops {
            let Value::Object(op) = op else {
                continue;
            };
            let Some(op_id) = op.get("id").and_then(Value::as_str) else {
                continue;
            };
            if op_log.iter().any(|applied| applied == op_id) {
                continue;
            }
            op_log.push(op_id.to_string());
            if let Some(Value::Object(op_patch)) = op.get("patch") {
                for (key, value) in op_patch {
                    folded.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in patch {
            folded.insert(key, value);
        }

        let component = self.components.get_mut(message_id).expect("checked above");
        record_diffs(component, &folded, now);
        for (key, value) in folded {
            component.props.insert(key, value);
        }
        component.version = options.version.or(component.version);
        component.last_updated = Some(options.timestamp.unwrap_or(now));

        // State is committed; callbacks run after and cannot undo it.
        let mut callback_errors = Vec::new();
        for callback in component.callbacks.values() {
            if let Err(err) = callback(&component.props) {
                callback_errors.push(err.to_string());
            }
        }

        let _ = self.events.send(RegistryEvent {
            message_id: message_id.to_string(),
            props: component.props.clone(),
        });

        if callback_errors.is_empty() {
            Ok(UpdateOutcome::Accepted)
        } else {
            Ok(UpdateOutcome::AcceptedWithCallbackErrors(
                callback_errors.join("; "),
            ))
        }
    }

    /// Drop one reference. When the last reference is released the component
    /// and its operation log are removed entirely.
    pub fn release(&mut self, token: &RegistryToken) {
        let Some(serials) = self.tokens.get_mut(&token.message_id) else {
            return;
        };
        serials.retain(|serial| *serial != token.serial);
        if let Some(component) = self.components.get_mut(&token.message_id) {
            component.callbacks.remove(&token.serial);
        }
        if serials.is_empty() {
            self.tokens.remove(&token.message_id);
            self.components.remove(&token.message_id);
            self.op_logs.remove(&token.message_id);
        }
    }

    pub fn get(&self, message_id: &str) -> Option<&RegisteredComponent> {
        self.components.get(message_id)
    }

    /// List registered components, optionally scoped to a context key.
    pub fn list(&self, context_key: Option<&str>) -> Vec<&RegisteredComponent> {
        let mut components: Vec<&RegisteredComponent> = self
            .components
            .values()
            .filter(|component| match context_key {
                Some(key) => component.context_key.as_deref() == Some(key),
                None => true,
            })
            .collect();
        components.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        components
    }

    /// Remove a component unconditionally, ignoring reference counts.
    pub fn remove(&mut self, message_id: &str) {
        self.components.remove(message_id);
        self.tokens.remove(message_id);
        self.op_logs.remove(message_id);
    }

    /// Remove everything, or only components under the given context key.
    pub fn clear(&mut self, context_key: Option<&str>) {
        match context_key {
            None => {
                self.components.clear();
                self.tokens.clear();
                self.op_logs.clear();
            }
            Some(key) => {
                let doomed: Vec<String> = self
                    .components
                    .values()
                    .filter(|component| component.context_key.as_deref() == Some(key))
                    .map(|component| component.message_id.clone())
                    .collect();
                for id in doomed {
                    self.remove(&id);
                }
            }
        }
    }
}

/// The only ordering guarantee across writers: version/timestamp total order
/// with a documented tie-break.
fn should_accept(
    incoming_version: Option<u64>,
    incoming_ts: Option<i64>,
    stored_version: Option<u64>,
    stored_ts: Option<i64>,
) -> bool {
    match (incoming_version, stored_version) {
        // An explicit higher version always wins.
        (Some(incoming), Some(stored)) => {
            if incoming != stored {
                return incoming > stored;
            }
            ts_accepts(incoming_ts, stored_ts)
        }
        // Versioned incoming beats an unversioned store.
        (Some(_), None) => true,
        (None, _) => {
            // No version and no timestamp means "accept unconditionally"
            // (untagged writers predate the tagging scheme).
            if incoming_ts.is_none() {
                return true;
            }
            ts_accepts(incoming_ts, stored_ts)
        }
    }
}

/// Advance the bookkeeping timestamp, never rewinding it.
fn advance_ts(stored: Option<i64>, incoming: i64) -> i64 {
    stored.unwrap_or(i64::MIN).max(incoming)
}

fn ts_accepts(incoming: Option<i64>, stored: Option<i64>) -> bool {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => incoming >= stored,
        _ => true,
    }
}

fn record_diffs(component: &mut RegisteredComponent, patch: &Props, ts: i64) {
    for (key, next) in patch {
        let previous = component.props.get(key);
        if previous == Some(next) {
            continue;
        }
        component.diff_history.push(PropDiff {
            key: key.clone(),
            previous: previous.cloned(),
            next: Some(next.clone()),
            ts,
        });
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn props(value: Value) -> Props {
        value.as_object().cloned().unwrap_or_default()
    }

    fn info(id: &str, value: Value) -> RegistrationInfo {
        RegistrationInfo {
            message_id: id.into(),
            component_type: "chart".into(),
            props: props(value),
            ..Default::default()
        }
    }

    fn short_cooldown() -> ComponentRegistry {
        ComponentRegistry::with_breaker_cooldown(Duration::from_millis(40))
    }

    #[test]
    fn higher_version_wins() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            version: Some(1),
            timestamp: Some(100),
            ..info("m1", json!({"value": 1}))
        });

        let outcome = registry
            .update(
                "m1",
                props(json!({"value": 2})),
                UpdateOptions {
                    version: Some(2),
                    timestamp: Some(50),
                },
            )
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);
        assert_eq!(registry.get("m1").unwrap().props.get("value"), Some(&json!(2)));
    }

    #[test]
    fn lower_version_is_ignored_but_bookkeeping_advances() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            version: Some(3),
            timestamp: Some(100),
            ..info("m1", json!({"value": 1}))
        });

        let outcome = registry
            .update(
                "m1",
                props(json!({"value": 99})),
                UpdateOptions {
                    version: Some(2),
                    timestamp: Some(999),
                },
            )
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);
        let component = registry.get("m1").unwrap();
        assert_eq!(component.props.get("value"), Some(&json!(1)));
        assert_eq!(component.last_updated, Some(999));
    }

    #[test]
    fn equal_version_breaks_ties_by_timestamp() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            version: Some(1),
            timestamp: Some(100),
            ..info("m1", json!({"value": 1}))
        });

        let stale = registry
            .update(
                "m1",
                props(json!({"value": 2})),
                UpdateOptions {
                    version: Some(1),
                    timestamp: Some(99),
                },
            )
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Ignored);

        let fresh = registry
            .update(
                "m1",
                props(json!({"value": 3})),
                UpdateOptions {
                    version: Some(1),
                    timestamp: Some(100),
                },
            )
            .unwrap();
        assert!(fresh.committed());
        assert_eq!(registry.get("m1").unwrap().props.get("value"), Some(&json!(3)));
    }

    #[test]
    fn rejected_update_cannot_rewind_the_tie_break_clock() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            version: Some(1),
            timestamp: Some(100),
            ..info("m1", json!({"value": 1}))
        });

        // A stale equal-version write is ignored and must not drag the
        // bookkeeping timestamp backwards.
        let stale = registry
            .update(
                "m1",
                props(json!({"value": 2})),
                UpdateOptions {
                    version: Some(1),
                    timestamp: Some(50),
                },
            )
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Ignored);
        assert_eq!(registry.get("m1").unwrap().last_updated, Some(100));

        // A second stale write, newer than the rejected one but older than
        // the last accepted one, stays rejected too.
        let still_stale = registry
            .update(
                "m1",
                props(json!({"value": 3})),
                UpdateOptions {
                    version: Some(1),
                    timestamp: Some(60),
                },
            )
            .unwrap();
        assert_eq!(still_stale, UpdateOutcome::Ignored);
        assert_eq!(registry.get("m1").unwrap().props.get("value"), Some(&json!(1)));

        // The same holds for the register path.
        registry.register(RegistrationInfo {
            version: Some(1),
            timestamp: Some(70),
            ..info("m1", json!({"value": 4}))
        });
        let component = registry.get("m1").unwrap();
        assert_eq!(component.props.get("value"), Some(&json!(1)));
        assert_eq!(component.last_updated, Some(100));
    }

    #[test]
    fn untagged_update_is_accepted_unconditionally() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            version: Some(5),
            timestamp: Some(100),
            ..info("m1", json!({"value": 1}))
        });

        let outcome = registry
            .update("m1", props(json!({"value": 7})), UpdateOptions::default())
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);
        assert_eq!(registry.get("m1").unwrap().props.get("value"), Some(&json!(7)));
    }

    #[test]
    fn update_of_unknown_component_lists_known_ids() {
        let mut registry = short_cooldown();
        registry.register(info("known-a", json!({})));
        registry.register(info("known-b", json!({})));

        let err = registry
            .update("ghost", props(json!({"x": 1})), UpdateOptions::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ghost"));
        assert!(message.contains("known-a"));
        assert!(message.contains("known-b"));
    }

    #[test]
    fn circuit_breaker_blocks_identical_update_within_cooldown() {
        let mut registry = short_cooldown();
        registry.register(info("m1", json!({"value": 1})));

        let first = registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        assert!(first.committed());

        let second = registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        assert_eq!(second, UpdateOutcome::Blocked);

        // A different patch is not blocked.
        let different = registry
            .update("m1", props(json!({"value": 3})), UpdateOptions::default())
            .unwrap();
        assert!(different.committed());

        std::thread::sleep(Duration::from_millis(60));
        let after_cooldown = registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        assert!(after_cooldown.committed());
    }

    #[test]
    fn ops_apply_first_and_are_deduplicated() {
        let mut registry = short_cooldown();
        registry.register(info("m1", json!({"count": 0})));

        let patch = props(json!({
            "_ops": [
                {"id": "op-1", "patch": {"count": 1, "flag": true}},
                {"id": "op-2", "patch": {"count": 2}}
            ],
            "count": 10
        }));
        registry.update("m1", patch, UpdateOptions::default()).unwrap();
        let component = registry.get("m1").unwrap();
        // Plain patch merges over the folded ops.
        assert_eq!(component.props.get("count"), Some(&json!(10)));
        assert_eq!(component.props.get("flag"), Some(&json!(true)));

        // Replaying an op has no effect.
        let replay = props(json!({
            "_ops": [{"id": "op-1", "patch": {"flag": false}}]
        }));
        registry.update("m1", replay, UpdateOptions::default()).unwrap();
        assert_eq!(registry.get("m1").unwrap().props.get("flag"), Some(&json!(true)));
    }

    #[test]
    fn callback_failure_is_reported_but_state_stays_committed() {
        let mut registry = short_cooldown();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ok = calls.clone();
        registry.register(RegistrationInfo {
            callback: Some(Arc::new(move |_| {
                calls_ok.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("render failed"))
            })),
            ..info("m1", json!({"value": 1}))
        });

        let outcome = registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        match outcome {
            UpdateOutcome::AcceptedWithCallbackErrors(errors) => {
                assert!(errors.contains("render failed"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("m1").unwrap().props.get("value"), Some(&json!(2)));
    }

    #[test]
    fn releasing_last_reference_removes_the_component() {
        let mut registry = short_cooldown();
        let first = registry.register(info("m1", json!({})));
        let second = registry.register(info("m1", json!({})));

        registry.release(&first);
        assert_eq!(registry.list(None).len(), 1);

        registry.release(&second);
        assert!(registry.list(None).is_empty());
        assert!(registry.get("m1").is_none());
    }

    #[test]
    fn clear_with_context_key_is_scoped() {
        let mut registry = short_cooldown();
        registry.register(RegistrationInfo {
            context_key: Some("deck-1".into()),
            ..info("m1", json!({}))
        });
        registry.register(RegistrationInfo {
            context_key: Some("deck-2".into()),
            ..info("m2", json!({}))
        });

        registry.clear(Some("deck-1"));
        assert!(registry.get("m1").is_none());
        assert!(registry.get("m2").is_some());

        registry.clear(None);
        assert!(registry.list(None).is_empty());
    }

    #[test]
    fn accepted_updates_append_to_diff_history() {
        let mut registry = short_cooldown();
        registry.register(info("m1", json!({"value": 1})));
        registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        registry
            .update("m1", props(json!({"value": 3, "other": "x"})), UpdateOptions::default())
            .unwrap();

        let history = &registry.get("m1").unwrap().diff_history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].key, "value");
        assert_eq!(history[0].previous, Some(json!(1)));
        assert_eq!(history[0].next, Some(json!(2)));
    }

    #[tokio::test]
    async fn subscribers_see_committed_mutations() {
        let mut registry = short_cooldown();
        registry.register(info("m1", json!({"value": 1})));
        let mut events = registry.subscribe();

        registry
            .update("m1", props(json!({"value": 2})), UpdateOptions::default())
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.message_id, "m1");
        assert_eq!(event.props.get("value"), Some(&json!(2)));
    }
}
