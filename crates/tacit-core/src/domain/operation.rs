//! Queued operation: one mutating request plus its retry policy and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{OperationId, VirtualId};
use super::retry::RetryPolicy;
use super::virtual_value::{FieldPath, VirtualRef, collect_refs};

/// Name of the queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Description of the remote call, handed to the transport at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// `GET`, `POST`, ...
    pub method: String,

    /// URL or path. May embed placeholder markers.
    pub target: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            params: Value::Null,
            body: Value::Null,
        }
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new("POST", target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new("PUT", target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new("DELETE", target)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// JSON view used for field-path addressing (`/target`, `/body/...`).
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "method": self.method,
            "target": self.target,
            "params": self.params,
            "body": self.body,
        })
    }

    /// Inverse of [`to_value`](Self::to_value). Fields missing from `value`
    /// fall back to the current ones.
    pub fn apply_value(&mut self, value: Value) {
        let Value::Object(mut map) = value else {
            return;
        };
        if let Some(Value::String(method)) = map.remove("method") {
            self.method = method;
        }
        match map.remove("target") {
            Some(Value::String(target)) => self.target = target,
            Some(other) if !other.is_null() => self.target = other.to_string(),
            _ => {}
        }
        if let Some(params) = map.remove("params") {
            self.params = params;
        }
        if let Some(body) = map.remove("body") {
            self.body = body;
        }
    }

    /// Every placeholder reference in the descriptor, with the field holding it.
    pub fn virtual_refs(&self) -> Vec<(VirtualRef, FieldPath)> {
        let mut refs = Vec::new();
        collect_refs(&self.to_value(), &FieldPath::root(), &mut refs);
        refs
    }
}

/// How the caller relates to the operation's outcome.
///
/// Both behaviors are dispatched strictly in order within their queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Fire and forget; the caller works with placeholders.
    #[default]
    Silent,

    /// The caller waits for the outcome (expresses "wait for" ordering).
    Queue,
}

/// Lifecycle status of a queued operation.
///
/// State transitions:
/// - Pending -> Dispatching -> Succeeded
/// - Pending -> Dispatching -> RetryWaiting -> Dispatching (until the budget is spent)
/// - Dispatching | RetryWaiting -> Failed (terminal error or unresolvable dependency)
/// - Dispatching | RetryWaiting -> Stopped (manual stop)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Dispatching,
    RetryWaiting,
    Succeeded,
    Failed,
    Stopped,
}

impl OperationStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Stopped
        )
    }

    /// Is an attempt in flight or scheduled (the window where `stop` is valid)?
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            OperationStatus::Dispatching | OperationStatus::RetryWaiting
        )
    }
}

/// Binds an operation's response to a virtual value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBinding {
    pub virtual_id: VirtualId,

    /// Part of the response to resolve with; the whole response when root.
    #[serde(default)]
    pub projection: FieldPath,
}

/// Where `enqueue` puts the operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Position {
    #[default]
    Tail,

    /// Front of the queue, behind an operation that is already in flight.
    Head,
}

/// A persisted, retryable description of one mutating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub request: RequestDescriptor,

    #[serde(default)]
    pub behavior: Behavior,

    pub queue_name: String,
    pub durable: bool,
    pub retry_policy: RetryPolicy,

    /// Retries performed so far.
    #[serde(default)]
    pub attempt: u32,

    #[serde(default)]
    pub status: OperationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<ResultBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn new(id: OperationId, request: RequestDescriptor, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            request,
            behavior: Behavior::Silent,
            queue_name: DEFAULT_QUEUE.to_string(),
            durable: false,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            status: OperationStatus::Pending,
            produces: None,
            last_error: None,
            created_at,
        }
    }

    pub fn in_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_retry(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Resolve `virtual_id` with this operation's response on success.
    pub fn produces(mut self, virtual_id: VirtualId) -> Self {
        self.produces = Some(ResultBinding {
            virtual_id,
            projection: FieldPath::root(),
        });
        self
    }

    /// Resolve `virtual_id` with one field of the response on success.
    pub fn produces_field(mut self, virtual_id: VirtualId, projection: FieldPath) -> Self {
        self.produces = Some(ResultBinding {
            virtual_id,
            projection,
        });
        self
    }

    /// Placeholder references still present in the request.
    pub fn virtual_dependencies(&self) -> Vec<(VirtualRef, FieldPath)> {
        self.request.virtual_refs()
    }

    /// Mark as dispatching.
    pub fn start_attempt(&mut self) {
        self.status = OperationStatus::Dispatching;
    }

    /// Record a failed attempt and move to retry-waiting; returns the new attempt number.
    pub fn schedule_retry(&mut self, error: String) -> u32 {
        self.attempt += 1;
        self.status = OperationStatus::RetryWaiting;
        self.last_error = Some(error);
        self.attempt
    }

    pub fn mark_succeeded(&mut self) {
        self.status = OperationStatus::Succeeded;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = OperationStatus::Failed;
        self.last_error = Some(error);
    }

    /// Manual stop; the last transport error is kept.
    pub fn mark_stopped(&mut self) {
        self.status = OperationStatus::Stopped;
    }

    /// Statuses that only make sense while a worker owns the operation are
    /// reset after a restart; the attempt count is kept.
    pub fn reset_after_restart(&mut self) {
        if self.status.is_in_flight() {
            self.status = OperationStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::virtual_value::VirtualValue;
    use rstest::rstest;
    use serde_json::json;
    use ulid::Ulid;

    fn op(request: RequestDescriptor) -> QueuedOperation {
        QueuedOperation::new(OperationId::from_ulid(Ulid::new()), request, Utc::now())
    }

    #[test]
    fn new_operation_defaults() {
        let op = op(RequestDescriptor::post("/todos"));
        assert_eq!(op.queue_name, DEFAULT_QUEUE);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt, 0);
        assert_eq!(op.behavior, Behavior::Silent);
        assert!(!op.durable);
    }

    #[rstest]
    #[case::pending(OperationStatus::Pending, false, false)]
    #[case::dispatching(OperationStatus::Dispatching, false, true)]
    #[case::retry_waiting(OperationStatus::RetryWaiting, false, true)]
    #[case::succeeded(OperationStatus::Succeeded, true, false)]
    #[case::failed(OperationStatus::Failed, true, false)]
    #[case::stopped(OperationStatus::Stopped, true, false)]
    fn status_classification(
        #[case] status: OperationStatus,
        #[case] terminal: bool,
        #[case] in_flight: bool,
    ) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_in_flight(), in_flight);
    }

    #[test]
    fn schedule_retry_counts_attempts() {
        let mut op = op(RequestDescriptor::post("/todos"));
        op.start_attempt();
        assert_eq!(op.schedule_retry("offline".into()), 1);
        assert_eq!(op.schedule_retry("offline".into()), 2);
        assert_eq!(op.status, OperationStatus::RetryWaiting);
        assert_eq!(op.last_error.as_deref(), Some("offline"));

        op.reset_after_restart();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt, 2);
    }

    #[test]
    fn mark_stopped_is_terminal_and_keeps_the_last_error() {
        let mut op = op(RequestDescriptor::post("/todos"));
        op.start_attempt();
        op.schedule_retry("offline".into());
        op.mark_stopped();

        assert_eq!(op.status, OperationStatus::Stopped);
        assert!(op.status.is_terminal());
        assert_eq!(op.last_error.as_deref(), Some("offline"));
    }

    #[test]
    fn descriptor_value_round_trip_keeps_fields() {
        let mut request = RequestDescriptor::put("/todos/1")
            .with_params(json!({"force": true}))
            .with_body(json!({"title": "x"}));
        let mut value = request.to_value();
        value["body"]["title"] = json!("y");
        value["target"] = json!("/todos/2");
        request.apply_value(value);

        assert_eq!(request.target, "/todos/2");
        assert_eq!(request.body, json!({"title": "y"}));
        assert_eq!(request.params, json!({"force": true}));
    }

    #[test]
    fn virtual_refs_include_target_and_body() {
        let v = VirtualValue::new(VirtualId::from_ulid(Ulid::new()), json!({"id": null}));
        let request = RequestDescriptor::delete(format!("/todos/{}", v.reference().marker()))
            .with_body(json!({"parent": v.field("id")}));

        let paths: Vec<String> = request
            .virtual_refs()
            .into_iter()
            .map(|(_, path)| path.as_str().to_string())
            .collect();
        assert!(paths.contains(&"/target".to_string()));
        assert!(paths.contains(&"/body/parent".to_string()));
    }

    #[test]
    fn operation_json_round_trip() {
        let vid = VirtualId::from_ulid(Ulid::new());
        let op = op(RequestDescriptor::post("/todos").with_body(json!({"title": "a"})))
            .in_queue("todos")
            .durable(true)
            .produces_field(vid, FieldPath::root().push("id"));

        let json = serde_json::to_string(&op).unwrap();
        let back: QueuedOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
