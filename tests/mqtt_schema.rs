// Schema validation tests for MQTT wire format
//
// Most tests construct JSON values directly (independent of Rust structs)
// and validate them against the JSON Schema files in schemas/mqtt/. The last
// section checks that library messages serialize to the same shapes.

use serde_json::json;

fn load_schema(name: &str) -> serde_json::Value {
    let path = format!(
        "{}/schemas/mqtt/{name}",
        env!("CARGO_MANIFEST_DIR")
    );
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read schema {path}: {e}"));
    serde_json::from_str(&text)
        .unwrap_or_else(|e| panic!("Failed to parse schema {path}: {e}"))
}

fn build_validator(schema_name: &str) -> jsonschema::Validator {
    let schema = load_schema(schema_name);
    jsonschema::options()
        .with_retriever(LocalRetriever)
        .build(&schema)
        .unwrap_or_else(|e| panic!("Failed to compile schema {schema_name}: {e}"))
}

fn validate(schema_name: &str, instance: &serde_json::Value) {
    let validator = build_validator(schema_name);
    let errors: Vec<_> = validator.iter_errors(instance).collect();
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        panic!(
            "Schema validation failed for {schema_name}:\n{}\nInstance: {}",
            msgs.join("\n"),
            serde_json::to_string_pretty(instance).unwrap()
        );
    }
}

fn validate_fails(schema_name: &str, instance: &serde_json::Value) {
    let validator = build_validator(schema_name);
    assert!(
        !validator.is_valid(instance),
        "Expected schema validation to fail for {schema_name}, but it passed.\nInstance: {}",
        serde_json::to_string_pretty(instance).unwrap()
    );
}

// Retriever that loads $ref schemas from the local filesystem
struct LocalRetriever;

impl jsonschema::Retrieve for LocalRetriever {
    fn retrieve(
        &self,
        uri: &jsonschema::Uri<&str>,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        let uri_str = uri.as_str();
        let schema_dir = format!("{}/schemas/mqtt/", env!("CARGO_MANIFEST_DIR"));

        // Extract the schema filename from various URI forms:
        // - "json-schema:///data_point_value.schema.json"
        // - "file:///path/to/data_point_value.schema.json"
        // - "data_point_value.schema.json"
        let filename = if let Some(rest) = uri_str.strip_prefix("json-schema:///") {
            rest
        } else if let Some(path) = uri_str.strip_prefix("file://") {
            // For file:// URIs, use the path directly
            let text = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&text)?);
        } else {
            uri_str
        };

        let path = format!("{schema_dir}{filename}");
        if std::path::Path::new(&path).exists() {
            let text = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        Err(format!("Cannot retrieve schema: {uri_str}").into())
    }
}

fn with_now(message: &local_device_bridge::ConnectorMessage) -> serde_json::Value {
    let mut value = serde_json::to_value(message).unwrap();
    value
        .as_object_mut()
        .unwrap()
        .insert("now".to_string(), json!(1738900000000_u64));
    value
}

// =========================================================================
// Property state
// =========================================================================

#[test]
fn property_state_valid() {
    validate(
        "property_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "PROPERTY_STATE",
            "device": "plug",
            "channel": "plug/main",
            "property": "plug-switch",
            "actual": false,
            "expected": true,
            "pending": true
        }),
    );
}

#[test]
fn property_state_null_values() {
    validate(
        "property_state.schema.json",
        &json!({
            "now": 0,
            "op": "PROPERTY_STATE",
            "device": "plug",
            "channel": "plug/main",
            "property": "plug-power",
            "actual": null,
            "expected": null,
            "pending": false
        }),
    );
}

#[test]
fn property_state_numeric_and_string_values() {
    validate(
        "property_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "PROPERTY_STATE",
            "device": "thermostat",
            "channel": "thermostat/main",
            "property": "thermostat-mode",
            "actual": "auto",
            "expected": 21.5,
            "pending": false
        }),
    );
}

#[test]
fn property_state_object_value_rejected() {
    validate_fails(
        "property_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "PROPERTY_STATE",
            "device": "plug",
            "channel": "plug/main",
            "property": "plug-switch",
            "actual": {"on": true},
            "expected": null,
            "pending": false
        }),
    );
}

#[test]
fn property_state_missing_pending() {
    validate_fails(
        "property_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "PROPERTY_STATE",
            "device": "plug",
            "channel": "plug/main",
            "property": "plug-switch",
            "actual": true,
            "expected": null
        }),
    );
}

// =========================================================================
// Connection state
// =========================================================================

#[test]
fn connection_state_all_states() {
    for state in ["connected", "disconnected", "lost", "alert", "unknown"] {
        validate(
            "connection_state.schema.json",
            &json!({
                "now": 1738900000000_u64,
                "op": "CONNECTION_STATE",
                "device": "plug",
                "state": state
            }),
        );
    }
}

#[test]
fn connection_state_unknown_state() {
    validate_fails(
        "connection_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "CONNECTION_STATE",
            "device": "plug",
            "state": "sleeping"
        }),
    );
}

#[test]
fn connection_state_wrong_op() {
    validate_fails(
        "connection_state.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "WRONG",
            "device": "plug",
            "state": "connected"
        }),
    );
}

// =========================================================================
// Write failed
// =========================================================================

#[test]
fn write_failed_valid() {
    validate(
        "write_failed.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "WRITE_FAILED",
            "device": "plug",
            "property": "plug-switch",
            "reason": "Device not connected"
        }),
    );
}

#[test]
fn write_failed_missing_reason() {
    validate_fails(
        "write_failed.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "WRITE_FAILED",
            "device": "plug",
            "property": "plug-switch"
        }),
    );
}

// =========================================================================
// Published message union
// =========================================================================

#[test]
fn message_accepts_each_kind() {
    validate(
        "message.schema.json",
        &json!({"now": 1, "op": "CONNECTION_STATE", "device": "plug", "state": "lost"}),
    );
    validate(
        "message.schema.json",
        &json!({"now": 1, "op": "WRITE_FAILED", "device": "plug", "property": "p", "reason": "x"}),
    );
}

#[test]
fn message_rejects_cmd_ack() {
    validate_fails(
        "message.schema.json",
        &json!({"now": 1, "op": "CMD_ACK", "success": true}),
    );
}

// =========================================================================
// CMD_ACK
// =========================================================================

#[test]
fn cmd_ack_success_with_src() {
    validate(
        "cmd_ack.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "CMD_ACK",
            "success": true,
            "src": {"op": "SET", "property": "plug-switch", "value": true}
        }),
    );
}

#[test]
fn cmd_ack_failure_with_error() {
    validate(
        "cmd_ack.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "CMD_ACK",
            "success": false,
            "src": {"op": "READ", "device": "plug"},
            "error": "Device not connected"
        }),
    );
}

#[test]
fn cmd_ack_snapshot_data() {
    validate(
        "cmd_ack.schema.json",
        &json!({
            "now": 1738900000000_u64,
            "op": "CMD_ACK",
            "success": true,
            "data": [{
                "op": "PROPERTY_STATE",
                "device": "plug",
                "channel": "plug/main",
                "property": "plug-switch",
                "actual": true,
                "expected": null,
                "pending": false
            }]
        }),
    );
}

#[test]
fn cmd_ack_missing_success() {
    validate_fails(
        "cmd_ack.schema.json",
        &json!({"now": 1738900000000_u64, "op": "CMD_ACK"}),
    );
}

// =========================================================================
// Commands
// =========================================================================

#[test]
fn command_ping() {
    validate("command.schema.json", &json!({"op": "PING", "op_id": "abc"}));
}

#[test]
fn command_set() {
    validate(
        "command.schema.json",
        &json!({"op": "SET", "property": "plug-switch", "value": true}),
    );
    validate(
        "command.schema.json",
        &json!({"op": "SET", "property": "dimmer-level", "value": 420}),
    );
}

#[test]
fn command_set_without_value() {
    validate_fails(
        "command.schema.json",
        &json!({"op": "SET", "property": "plug-switch"}),
    );
}

#[test]
fn command_read_requires_device() {
    validate("command.schema.json", &json!({"op": "READ", "device": "plug"}));
    validate_fails("command.schema.json", &json!({"op": "READ"}));
}

#[test]
fn command_unknown_op() {
    validate_fails("command.schema.json", &json!({"op": "ARM_AWAY"}));
}

// =========================================================================
// Library messages
// =========================================================================

#[test]
fn library_property_state_matches_schema() {
    use local_device_bridge::{ConnectorMessage, DataPointValue, PropertyRecord, PropertyState};

    let property = PropertyRecord {
        id: "plug-switch".into(),
        device: "plug".into(),
        channel: "plug/main".into(),
        identifier: "1".into(),
        settable: true,
        queryable: true,
        name: None,
    };
    let state = PropertyState {
        actual: Some(DataPointValue::Bool(false)),
        expected: Some(DataPointValue::Bool(true)),
        pending: Some(chrono::Utc::now()),
        valid: true,
    };
    let message = ConnectorMessage::property_state(&property, &state);
    validate("property_state.schema.json", &with_now(&message));
    validate("message.schema.json", &with_now(&message));
}

#[test]
fn library_connection_and_failure_match_schema() {
    use local_device_bridge::{ConnectorMessage, DeviceConnectionState};

    let message = ConnectorMessage::connection_state("plug", DeviceConnectionState::Alert);
    validate("connection_state.schema.json", &with_now(&message));

    let message = ConnectorMessage::WriteFailed {
        device: "plug".into(),
        property: "plug-switch".into(),
        reason: "Request timed out".into(),
    };
    validate("write_failed.schema.json", &with_now(&message));
}
