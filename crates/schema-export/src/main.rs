//! Build-time artifact: the frame protocol as a Draft-07 JSON Schema with
//! a discriminator on `type`. Foreign-language clients generate their
//! frame types from this document; the gateway itself never reads it.
//!
//! Usage: `clawdis-schema-export [PATH]` — writes to PATH, or stdout when
//! no path is given.

use serde_json::{Value, json};

use clawdis_protocol::{
    MAX_BUFFERED_BYTES, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION, TICK_INTERVAL_MS, events, methods,
};

fn main() {
    let schema = build_schema();
    let rendered = serde_json::to_string_pretty(&schema)
        .expect("schema document serializes");

    match std::env::args().nth(1) {
        Some(path) => {
            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent).expect("failed to create parent directories");
            }
            std::fs::write(&path, rendered).expect("failed to write schema file");
            eprintln!("Wrote gateway frame schema to {path}");
        },
        None => println!("{rendered}"),
    }
}

fn non_empty_string() -> Value {
    json!({ "type": "string", "minLength": 1 })
}

fn uint() -> Value {
    json!({ "type": "integer", "minimum": 0 })
}

fn build_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "$id": "https://clawdis.dev/schema/gateway-frames.json",
        "title": "GatewayFrame",
        "description": format!("Clawdis gateway frame protocol, version {PROTOCOL_VERSION}"),
        "oneOf": [
            { "$ref": "#/definitions/HelloFrame" },
            { "$ref": "#/definitions/HelloOkFrame" },
            { "$ref": "#/definitions/HelloErrorFrame" },
            { "$ref": "#/definitions/RequestFrame" },
            { "$ref": "#/definitions/ResponseFrame" },
            { "$ref": "#/definitions/EventFrame" },
        ],
        "discriminator": { "propertyName": "type" },
        "definitions": {
            "HelloFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "minProtocol", "maxProtocol", "client"],
                "properties": {
                    "type": { "const": "hello" },
                    "minProtocol": uint(),
                    "maxProtocol": uint(),
                    "client": { "$ref": "#/definitions/ClientInfo" },
                    "caps": { "type": "array", "items": { "type": "string" } },
                    "auth": { "$ref": "#/definitions/ConnectAuth" },
                },
            },
            "HelloOkFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "protocol", "server", "features", "snapshot", "policy"],
                "properties": {
                    "type": { "const": "hello-ok" },
                    "protocol": uint(),
                    "server": { "$ref": "#/definitions/ServerInfo" },
                    "features": { "$ref": "#/definitions/Features" },
                    "snapshot": { "$ref": "#/definitions/Snapshot" },
                    "policy": { "$ref": "#/definitions/Policy" },
                },
            },
            "HelloErrorFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "reason"],
                "properties": {
                    "type": { "const": "hello-error" },
                    "reason": non_empty_string(),
                    "expectedProtocol": uint(),
                },
            },
            "RequestFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "id", "method"],
                "properties": {
                    "type": { "const": "req" },
                    "id": non_empty_string(),
                    "method": { "type": "string", "enum": methods::ALL },
                    "params": { "type": "object" },
                },
            },
            "ResponseFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "id", "ok"],
                "properties": {
                    "type": { "const": "res" },
                    "id": non_empty_string(),
                    "ok": { "type": "boolean" },
                    "payload": {},
                    "error": { "$ref": "#/definitions/ErrorShape" },
                },
            },
            "EventFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "event"],
                "properties": {
                    "type": { "const": "event" },
                    "event": { "type": "string", "enum": events::ALL },
                    "payload": {},
                    "seq": uint(),
                    "stateVersion": { "$ref": "#/definitions/StateVersion" },
                },
            },
            "ErrorShape": {
                "type": "object",
                "additionalProperties": false,
                "required": ["code", "message"],
                "properties": {
                    "code": {
                        "type": "string",
                        "enum": ["INVALID_REQUEST", "UNAVAILABLE", "AGENT_TIMEOUT", "NOT_LINKED"],
                    },
                    "message": { "type": "string" },
                    "details": {},
                    "retryable": { "type": "boolean" },
                    "retryAfterMs": uint(),
                },
            },
            "ClientInfo": {
                "type": "object",
                "additionalProperties": false,
                "required": ["name", "version", "platform", "mode"],
                "properties": {
                    "name": non_empty_string(),
                    "version": non_empty_string(),
                    "platform": non_empty_string(),
                    "mode": non_empty_string(),
                    "instanceId": non_empty_string(),
                },
            },
            "ConnectAuth": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "token": { "type": "string" },
                },
            },
            "ServerInfo": {
                "type": "object",
                "additionalProperties": false,
                "required": ["version", "connId"],
                "properties": {
                    "version": non_empty_string(),
                    "commit": { "type": "string" },
                    "host": { "type": "string" },
                    "connId": non_empty_string(),
                },
            },
            "Features": {
                "type": "object",
                "additionalProperties": false,
                "required": ["methods", "events"],
                "properties": {
                    "methods": { "type": "array", "items": { "type": "string" } },
                    "events": { "type": "array", "items": { "type": "string" } },
                },
            },
            "Snapshot": {
                "type": "object",
                "additionalProperties": false,
                "required": ["presence", "health", "stateVersion", "uptimeMs"],
                "properties": {
                    "presence": {
                        "type": "array",
                        "items": { "$ref": "#/definitions/PresenceEntry" },
                    },
                    "health": {},
                    "stateVersion": { "$ref": "#/definitions/StateVersion" },
                    "uptimeMs": uint(),
                },
            },
            "StateVersion": {
                "type": "object",
                "additionalProperties": false,
                "required": ["presence", "health"],
                "properties": {
                    "presence": uint(),
                    "health": uint(),
                },
            },
            "Policy": {
                "type": "object",
                "additionalProperties": false,
                "required": ["maxPayload", "maxBufferedBytes", "tickIntervalMs"],
                "properties": {
                    "maxPayload": { "type": "integer", "minimum": 0, "default": MAX_PAYLOAD_BYTES },
                    "maxBufferedBytes": { "type": "integer", "minimum": 0, "default": MAX_BUFFERED_BYTES },
                    "tickIntervalMs": { "type": "integer", "minimum": 0, "default": TICK_INTERVAL_MS },
                },
            },
            "PresenceEntry": {
                "type": "object",
                "additionalProperties": false,
                "required": ["ts"],
                "properties": {
                    "host": { "type": "string" },
                    "ip": { "type": "string" },
                    "version": { "type": "string" },
                    "mode": { "type": "string" },
                    "lastInputSeconds": uint(),
                    "reason": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "text": { "type": "string" },
                    "ts": uint(),
                    "instanceId": { "type": "string" },
                },
            },
        },
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_frame_variant_has_a_definition() {
        let schema = build_schema();
        let definitions = schema["definitions"].as_object().unwrap();
        for name in [
            "HelloFrame",
            "HelloOkFrame",
            "HelloErrorFrame",
            "RequestFrame",
            "ResponseFrame",
            "EventFrame",
        ] {
            assert!(definitions.contains_key(name), "missing {name}");
        }
        assert_eq!(schema["oneOf"].as_array().unwrap().len(), 6);
        assert_eq!(schema["discriminator"]["propertyName"], "type");
    }

    #[test]
    fn request_method_enum_matches_closed_set() {
        let schema = build_schema();
        let enum_values = schema["definitions"]["RequestFrame"]["properties"]["method"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(enum_values.len(), methods::ALL.len());
        assert!(enum_values.iter().any(|v| v == "system-presence"));
    }

    #[test]
    fn frames_forbid_unknown_members() {
        let schema = build_schema();
        for (name, definition) in schema["definitions"].as_object().unwrap() {
            assert_eq!(
                definition["additionalProperties"], false,
                "{name} must reject unknown members"
            );
        }
    }
}
