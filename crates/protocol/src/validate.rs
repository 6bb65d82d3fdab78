//! Strict frame and method-param validators.
//!
//! Validators accumulate every issue instead of short-circuiting, and
//! [`format_issues`] renders the list into one deterministic
//! semicolon-joined string that is safe to send in a `hello-error.reason`
//! or an `INVALID_REQUEST` error message.

use serde_json::Value;

use crate::{events, methods};

/// One validation problem, anchored to a dotted member path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

impl Issue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Render issues as `"path: message; path: message"`, in accumulation order.
pub fn format_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate any frame by its `type` tag. Unknown tags are a single issue.
pub fn frame(value: &Value) -> Result<(), Vec<Issue>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![Issue::new("$", "frame must be a JSON object")]);
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("hello") => hello(value),
        Some("hello-ok") => hello_ok(value),
        Some("hello-error") => hello_error(value),
        Some("req") => request(value),
        Some("res") => response(value),
        Some("event") => event(value),
        Some(other) => Err(vec![Issue::new(
            "type",
            format!("unknown frame type {other:?}"),
        )]),
        None => Err(vec![Issue::new("type", "required string member")]),
    }
}

// ── Frame validators ─────────────────────────────────────────────────────────

pub fn hello(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "minProtocol", "maxProtocol", "client", "caps", "auth"]);
    check.uint("minProtocol", Required);
    check.uint("maxProtocol", Required);
    if let Some(client) = check.object("client", Required) {
        let mut nested = Check::new(client, &["name", "version", "platform", "mode", "instanceId"]);
        nested.path_prefix = "client.";
        nested.string("name", Required);
        nested.string("version", Required);
        nested.string("platform", Required);
        nested.string("mode", Required);
        nested.string("instanceId", Optional);
        check.extend(nested);
    }
    check.string_array("caps", Optional);
    if let Some(auth) = check.object("auth", Optional) {
        let mut nested = Check::new(auth, &["token"]);
        nested.path_prefix = "auth.";
        nested.string("token", Optional);
        check.extend(nested);
    }
    check.finish()
}

pub fn hello_ok(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "protocol", "server", "features", "snapshot", "policy"]);
    check.uint("protocol", Required);
    if let Some(server) = check.object("server", Required) {
        let mut nested = Check::new(server, &["version", "commit", "host", "connId"]);
        nested.path_prefix = "server.";
        nested.string("version", Required);
        nested.string("commit", Optional);
        nested.string("host", Optional);
        nested.string("connId", Required);
        check.extend(nested);
    }
    if let Some(features) = check.object("features", Required) {
        let mut nested = Check::new(features, &["methods", "events"]);
        nested.path_prefix = "features.";
        nested.string_array("methods", Required);
        nested.string_array("events", Required);
        check.extend(nested);
    }
    if let Some(snapshot) = check.object("snapshot", Required) {
        let mut nested = Check::new(snapshot, &["presence", "health", "stateVersion", "uptimeMs"]);
        nested.path_prefix = "snapshot.";
        nested.uint("uptimeMs", Required);
        if let Some(sv) = nested.object("stateVersion", Required) {
            let mut sv_check = Check::new(sv, &["presence", "health"]);
            sv_check.path_prefix = "snapshot.stateVersion.";
            sv_check.uint("presence", Required);
            sv_check.uint("health", Required);
            nested.extend(sv_check);
        }
        check.extend(nested);
    }
    if let Some(policy) = check.object("policy", Required) {
        let mut nested = Check::new(policy, &["maxPayload", "maxBufferedBytes", "tickIntervalMs"]);
        nested.path_prefix = "policy.";
        nested.uint("maxPayload", Required);
        nested.uint("maxBufferedBytes", Required);
        nested.uint("tickIntervalMs", Required);
        check.extend(nested);
    }
    check.finish()
}

pub fn hello_error(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "reason", "expectedProtocol"]);
    check.string("reason", Required);
    check.uint("expectedProtocol", Optional);
    check.finish()
}

pub fn request(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "id", "method", "params"]);
    check.string("id", Required);
    check.string("method", Required);
    check.object("params", Optional);
    check.finish()
}

pub fn response(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "id", "ok", "payload", "error"]);
    check.string("id", Required);
    check.bool("ok", Required);
    if let Some(error) = check.object("error", Optional) {
        let mut nested = Check::new(
            error,
            &["code", "message", "details", "retryable", "retryAfterMs"],
        );
        nested.path_prefix = "error.";
        nested.string("code", Required);
        nested.string("message", Required);
        nested.bool("retryable", Optional);
        nested.uint("retryAfterMs", Optional);
        check.extend(nested);
    }
    check.finish()
}

pub fn event(value: &Value) -> Result<(), Vec<Issue>> {
    let mut check = Check::new(value, &["type", "event", "payload", "seq", "stateVersion"]);
    if let Some(name) = check.string("event", Required) {
        if !events::ALL.contains(&name) {
            check.push("event", format!("unknown event {name:?}"));
        }
    }
    check.uint("seq", Optional);
    if let Some(sv) = check.object("stateVersion", Optional) {
        let mut nested = Check::new(sv, &["presence", "health"]);
        nested.path_prefix = "stateVersion.";
        nested.uint("presence", Required);
        nested.uint("health", Required);
        check.extend(nested);
    }
    check.finish()
}

// ── Method param validators ──────────────────────────────────────────────────

/// Validate request params against the method's schema. Unknown methods pass
/// here so the dispatcher can answer `unknown method: <name>` itself.
pub fn method_params(method: &str, params: Option<&Value>) -> Result<(), Vec<Issue>> {
    let empty = Value::Object(serde_json::Map::new());
    let params = params.unwrap_or(&empty);
    match method {
        methods::HEALTH | methods::STATUS | methods::SYSTEM_PRESENCE => {
            Check::new(params, &[]).finish()
        },
        methods::SYSTEM_EVENT => {
            let mut check = Check::new(params, &["text"]);
            check.path_prefix = "params.";
            check.string("text", Required);
            check.finish()
        },
        methods::SET_HEARTBEATS => {
            let mut check = Check::new(params, &["enabled"]);
            check.path_prefix = "params.";
            check.bool("enabled", Required);
            check.finish()
        },
        methods::SEND => {
            let mut check = Check::new(
                params,
                &["to", "message", "mediaUrl", "provider", "idempotencyKey"],
            );
            check.path_prefix = "params.";
            check.string("to", Required);
            check.string("message", Required);
            check.string("mediaUrl", Optional);
            check.string("provider", Optional);
            check.string("idempotencyKey", Required);
            check.finish()
        },
        methods::AGENT => {
            let mut check = Check::new(
                params,
                &[
                    "message",
                    "to",
                    "sessionId",
                    "thinking",
                    "deliver",
                    "timeout",
                    "idempotencyKey",
                ],
            );
            check.path_prefix = "params.";
            check.string("message", Required);
            check.string("to", Optional);
            check.string("sessionId", Optional);
            check.string("thinking", Optional);
            check.bool("deliver", Optional);
            check.uint("timeout", Optional);
            check.string("idempotencyKey", Required);
            check.finish()
        },
        _ => Ok(()),
    }
}

// ── Check helper ─────────────────────────────────────────────────────────────

use Presence::{Optional, Required};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Presence {
    Required,
    Optional,
}

/// Accumulating checker over one JSON object: records unknown members up
/// front, then typed member checks append further issues.
struct Check<'a> {
    obj: Option<&'a serde_json::Map<String, Value>>,
    path_prefix: &'static str,
    issues: Vec<Issue>,
}

impl<'a> Check<'a> {
    fn new(value: &'a Value, allowed: &[&str]) -> Self {
        let mut issues = Vec::new();
        let obj = match value.as_object() {
            Some(obj) => {
                for key in obj.keys() {
                    if !allowed.contains(&key.as_str()) {
                        issues.push(Issue::new(key.clone(), "unknown member"));
                    }
                }
                Some(obj)
            },
            None => {
                issues.push(Issue::new("$", "must be a JSON object"));
                None
            },
        };
        Self {
            obj,
            path_prefix: "",
            issues,
        }
    }

    fn path(&self, key: &str) -> String {
        format!("{}{}", self.path_prefix, key)
    }

    fn push(&mut self, key: &str, message: impl Into<String>) {
        let path = self.path(key);
        self.issues.push(Issue::new(path, message));
    }

    fn member(&mut self, key: &str, presence: Presence) -> Option<&'a Value> {
        match self.obj.and_then(|obj| obj.get(key)) {
            Some(value) => Some(value),
            None => {
                if presence == Required && self.obj.is_some() {
                    self.push(key, "required member");
                }
                None
            },
        }
    }

    /// Non-empty string member.
    fn string(&mut self, key: &str, presence: Presence) -> Option<&'a str> {
        let value = self.member(key, presence)?;
        match value.as_str() {
            Some(s) if s.is_empty() => {
                self.push(key, "must not be empty");
                None
            },
            Some(s) => Some(s),
            None => {
                self.push(key, "must be a string");
                None
            },
        }
    }

    /// Non-negative integer member.
    fn uint(&mut self, key: &str, presence: Presence) -> Option<u64> {
        let value = self.member(key, presence)?;
        match value.as_u64() {
            Some(n) => Some(n),
            None => {
                self.push(key, "must be a non-negative integer");
                None
            },
        }
    }

    fn bool(&mut self, key: &str, presence: Presence) -> Option<bool> {
        let value = self.member(key, presence)?;
        match value.as_bool() {
            Some(b) => Some(b),
            None => {
                self.push(key, "must be a boolean");
                None
            },
        }
    }

    fn object(&mut self, key: &str, presence: Presence) -> Option<&'a Value> {
        let value = self.member(key, presence)?;
        if value.is_object() {
            Some(value)
        } else {
            self.push(key, "must be an object");
            None
        }
    }

    fn string_array(&mut self, key: &str, presence: Presence) {
        let Some(value) = self.member(key, presence) else {
            return;
        };
        match value.as_array() {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        let path = format!("{}[{index}]", self.path(key));
                        self.issues.push(Issue::new(path, "must be a string"));
                    }
                }
            },
            None => self.push(key, "must be an array of strings"),
        }
    }

    fn extend(&mut self, nested: Check<'_>) {
        self.issues.extend(nested.issues);
    }

    fn finish(self) -> Result<(), Vec<Issue>> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(self.issues)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_hello_passes() {
        let value = json!({
            "type": "hello",
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": { "name": "t", "version": "1", "platform": "test", "mode": "test" },
            "caps": [],
        });
        assert!(hello(&value).is_ok());
    }

    #[test]
    fn hello_accumulates_every_issue() {
        let value = json!({
            "type": "hello",
            "minProtocol": -1,
            "client": { "name": "", "version": "1", "platform": "test", "mode": "test" },
            "caps": "nope",
            "bogus": 1,
        });
        let issues = hello(&value).unwrap_err();
        let formatted = format_issues(&issues);
        assert!(formatted.contains("bogus: unknown member"), "{formatted}");
        assert!(
            formatted.contains("minProtocol: must be a non-negative integer"),
            "{formatted}"
        );
        assert!(formatted.contains("maxProtocol: required member"), "{formatted}");
        assert!(formatted.contains("client.name: must not be empty"), "{formatted}");
        assert!(
            formatted.contains("caps: must be an array of strings"),
            "{formatted}"
        );
    }

    #[test]
    fn format_is_deterministic() {
        let value = json!({ "type": "req", "id": "", "method": "" });
        let first = format_issues(&request(&value).unwrap_err());
        let second = format_issues(&request(&value).unwrap_err());
        assert_eq!(first, second);
        assert_eq!(first, "id: must not be empty; method: must not be empty");
    }

    #[test]
    fn request_rejects_unknown_members() {
        let value = json!({ "type": "req", "id": "1", "method": "health", "channel": "x" });
        let issues = request(&value).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "channel");
    }

    #[test]
    fn request_params_must_be_object() {
        let value = json!({ "type": "req", "id": "1", "method": "health", "params": 3 });
        assert!(request(&value).is_err());
    }

    #[test]
    fn event_enforces_closed_set() {
        let value = json!({ "type": "event", "event": "mystery", "seq": 1 });
        let issues = event(&value).unwrap_err();
        assert!(format_issues(&issues).contains("unknown event"));

        let value = json!({ "type": "event", "event": "tick", "seq": 1, "payload": {"ts": 0} });
        assert!(event(&value).is_ok());
    }

    #[test]
    fn event_rejects_negative_seq() {
        let value = json!({ "type": "event", "event": "tick", "seq": -4 });
        assert!(event(&value).is_err());
    }

    #[test]
    fn frame_dispatches_by_tag() {
        assert!(frame(&json!({ "type": "zap" })).is_err());
        assert!(frame(&json!("not an object")).is_err());
        assert!(frame(&json!({ "type": "hello-error", "reason": "nope" })).is_ok());
    }

    // ── Method params ──────────────────────────────────────────────────

    #[test]
    fn send_requires_idempotency_key() {
        let params = json!({ "to": "+1", "message": "hi" });
        let issues = method_params(methods::SEND, Some(&params)).unwrap_err();
        assert!(format_issues(&issues).contains("params.idempotencyKey: required member"));
    }

    #[test]
    fn agent_requires_message_and_key() {
        let issues = method_params(methods::AGENT, None).unwrap_err();
        let formatted = format_issues(&issues);
        assert!(formatted.contains("params.message"));
        assert!(formatted.contains("params.idempotencyKey"));
    }

    #[test]
    fn system_event_rejects_empty_text() {
        let params = json!({ "text": "" });
        let issues = method_params(methods::SYSTEM_EVENT, Some(&params)).unwrap_err();
        assert_eq!(format_issues(&issues), "params.text: must not be empty");
    }

    #[test]
    fn no_param_methods_reject_extra_members() {
        let params = json!({ "pad": "x" });
        assert!(method_params(methods::HEALTH, Some(&params)).is_err());
        assert!(method_params(methods::HEALTH, None).is_ok());
        assert!(method_params(methods::STATUS, Some(&json!({}))).is_ok());
    }

    #[test]
    fn unknown_methods_pass_param_validation() {
        assert!(method_params("nope", Some(&json!({"a": 1}))).is_ok());
    }

    #[test]
    fn set_heartbeats_requires_boolean() {
        let params = json!({ "enabled": "yes" });
        let issues = method_params(methods::SET_HEARTBEATS, Some(&params)).unwrap_err();
        assert_eq!(format_issues(&issues), "params.enabled: must be a boolean");
    }
}
