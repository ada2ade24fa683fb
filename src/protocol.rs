// MIT License - Copyright (c) 2021 TJForc

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{BridgeError, Result, ReturnCode};

/// Commands of the local device protocol, with their wire codes.
///
/// # Request/reply
///
/// Every command except `Status` is sent by the client and answered by the
/// device using the same sequence number. `Status` is pushed by the device
/// whenever a data point changes and is never correlated.
///
/// # Encryption
///
/// Under protocol `3.1` only `Control` and `ControlNew` payloads are
/// encrypted. Under `3.3` every payload is encrypted, and all but the
/// query/refresh/heartbeat/stream commands carry the 15-byte version header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocalCommand {
    /// UDP broadcast from an unconfigured device.
    Udp,
    ApConfig,
    Active,
    Bind,
    RenameGw,
    RenameDevice,
    Unbind,
    /// Set one or more data points.
    Control,
    /// Unsolicited data point update pushed by the device.
    Status,
    /// Keep-alive probe, always sent with the sentinel sequence.
    HeartBeat,
    /// Read all data points.
    DataPointQuery,
    /// Scan visible wifi networks.
    QueryWifi,
    TokenBind,
    ControlNew,
    EnableWifi,
    DataPointQueryNew,
    SceneExecute,
    /// Ask the device to re-report the listed data points.
    DataPointRefresh,
    /// UDP broadcast from a configured device.
    UdpNew,
    ApConfigNew,
    LanExtStream,
}

impl LocalCommand {
    /// All known commands.
    pub const ALL: [LocalCommand; 21] = [
        LocalCommand::Udp,
        LocalCommand::ApConfig,
        LocalCommand::Active,
        LocalCommand::Bind,
        LocalCommand::RenameGw,
        LocalCommand::RenameDevice,
        LocalCommand::Unbind,
        LocalCommand::Control,
        LocalCommand::Status,
        LocalCommand::HeartBeat,
        LocalCommand::DataPointQuery,
        LocalCommand::QueryWifi,
        LocalCommand::TokenBind,
        LocalCommand::ControlNew,
        LocalCommand::EnableWifi,
        LocalCommand::DataPointQueryNew,
        LocalCommand::SceneExecute,
        LocalCommand::DataPointRefresh,
        LocalCommand::UdpNew,
        LocalCommand::ApConfigNew,
        LocalCommand::LanExtStream,
    ];

    /// The wire code of this command.
    pub fn code(&self) -> u32 {
        match self {
            LocalCommand::Udp => 0,
            LocalCommand::ApConfig => 1,
            LocalCommand::Active => 2,
            LocalCommand::Bind => 3,
            LocalCommand::RenameGw => 4,
            LocalCommand::RenameDevice => 5,
            LocalCommand::Unbind => 6,
            LocalCommand::Control => 7,
            LocalCommand::Status => 8,
            LocalCommand::HeartBeat => 9,
            LocalCommand::DataPointQuery => 10,
            LocalCommand::QueryWifi => 11,
            LocalCommand::TokenBind => 12,
            LocalCommand::ControlNew => 13,
            LocalCommand::EnableWifi => 14,
            LocalCommand::DataPointQueryNew => 16,
            LocalCommand::SceneExecute => 17,
            LocalCommand::DataPointRefresh => 18,
            LocalCommand::UdpNew => 19,
            LocalCommand::ApConfigNew => 20,
            LocalCommand::LanExtStream => 64,
        }
    }

    /// Look up a command by wire code. Unknown codes return `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Commands whose payload is encrypted under protocol `3.1`.
    pub fn is_control(&self) -> bool {
        matches!(self, LocalCommand::Control | LocalCommand::ControlNew)
    }

    /// Whether a `3.3` payload for this command carries the version header.
    pub fn has_version_header(&self) -> bool {
        !matches!(
            self,
            LocalCommand::DataPointQuery
                | LocalCommand::DataPointQueryNew
                | LocalCommand::DataPointRefresh
                | LocalCommand::HeartBeat
                | LocalCommand::LanExtStream
        )
    }

    /// Which request payload shape this command sends.
    pub fn template(&self) -> PayloadTemplate {
        match self {
            LocalCommand::Control | LocalCommand::ControlNew => PayloadTemplate::Control,
            LocalCommand::DataPointQuery
            | LocalCommand::DataPointQueryNew
            | LocalCommand::QueryWifi => PayloadTemplate::Query,
            LocalCommand::HeartBeat => PayloadTemplate::HeartBeat,
            LocalCommand::DataPointRefresh => PayloadTemplate::Refresh,
            _ => PayloadTemplate::Empty,
        }
    }

    /// Which schema a reply to this command is validated against, if any.
    pub fn reply_schema(&self) -> Option<PayloadSchema> {
        match self {
            LocalCommand::Status
            | LocalCommand::Control
            | LocalCommand::ControlNew
            | LocalCommand::DataPointQuery
            | LocalCommand::DataPointQueryNew
            | LocalCommand::DataPointRefresh => Some(PayloadSchema::DataPoints),
            LocalCommand::QueryWifi => Some(PayloadSchema::WifiScan),
            LocalCommand::Udp | LocalCommand::UdpNew | LocalCommand::ApConfigNew => {
                Some(PayloadSchema::Discovery)
            }
            _ => None,
        }
    }
}

/// A scalar data point value as found in a `dps` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataPointValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl DataPointValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataPointValue::Bool(b) => serde_json::Value::Bool(*b),
            DataPointValue::Integer(i) => serde_json::Value::from(*i),
            DataPointValue::Float(f) => serde_json::Value::from(*f),
            DataPointValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Convert a JSON scalar. Arrays, objects and null are not data point values.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(DataPointValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(DataPointValue::Integer)
                .or_else(|| n.as_f64().map(DataPointValue::Float)),
            serde_json::Value::String(s) => Some(DataPointValue::String(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataPointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataPointValue::Bool(b) => write!(f, "{}", b),
            DataPointValue::Integer(i) => write!(f, "{}", i),
            DataPointValue::Float(v) => write!(f, "{}", v),
            DataPointValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for DataPointValue {
    fn from(v: bool) -> Self {
        DataPointValue::Bool(v)
    }
}

impl From<i64> for DataPointValue {
    fn from(v: i64) -> Self {
        DataPointValue::Integer(v)
    }
}

impl From<f64> for DataPointValue {
    fn from(v: f64) -> Self {
        DataPointValue::Float(v)
    }
}

impl From<&str> for DataPointValue {
    fn from(v: &str) -> Self {
        DataPointValue::String(v.to_string())
    }
}

/// One `(key, value)` entry of a device's data point map.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: String,
    pub value: DataPointValue,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Request payload shapes, one per family of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTemplate {
    Control,
    Query,
    HeartBeat,
    Refresh,
    Empty,
}

/// Identity fields copied into request payloads.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub device_id: String,
    pub gateway_id: String,
    pub uid: String,
}

impl RequestContext {
    pub fn new(device_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            uid: device_id.clone(),
            device_id,
            gateway_id: gateway_id.into(),
        }
    }
}

/// Command arguments that end up in the payload.
#[derive(Debug, Clone, Default)]
pub struct RequestArgs {
    /// Data points to set (control commands)
    pub dps: BTreeMap<String, DataPointValue>,
    /// Data point ids to refresh
    pub dp_ids: Vec<u32>,
}

impl RequestArgs {
    pub fn control(dps: BTreeMap<String, DataPointValue>) -> Self {
        Self { dps, dp_ids: Vec::new() }
    }

    pub fn refresh(dp_ids: Vec<u32>) -> Self {
        Self { dps: BTreeMap::new(), dp_ids }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlPayload {
    #[serde(rename = "devId")]
    pub dev_id: String,
    pub uid: String,
    pub t: String,
    pub dps: BTreeMap<String, DataPointValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPayload {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    #[serde(rename = "devId")]
    pub dev_id: String,
    pub uid: String,
    pub t: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartBeatPayload {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    #[serde(rename = "devId")]
    pub dev_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshPayload {
    #[serde(rename = "dpId")]
    pub dp_id: Vec<u32>,
}

/// A request payload ready to be serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestPayload {
    Control(ControlPayload),
    Query(QueryPayload),
    HeartBeat(HeartBeatPayload),
    Refresh(RefreshPayload),
    Empty(BTreeMap<String, DataPointValue>),
}

impl RequestPayload {
    /// Build the payload for `command` from its template.
    ///
    /// `timestamp` is unix seconds, sent as a string.
    pub fn for_command(
        command: LocalCommand,
        ctx: &RequestContext,
        args: RequestArgs,
        timestamp: i64,
    ) -> Self {
        match command.template() {
            PayloadTemplate::Control => RequestPayload::Control(ControlPayload {
                dev_id: ctx.device_id.clone(),
                uid: ctx.uid.clone(),
                t: timestamp.to_string(),
                dps: args.dps,
            }),
            PayloadTemplate::Query => RequestPayload::Query(QueryPayload {
                gw_id: ctx.gateway_id.clone(),
                dev_id: ctx.device_id.clone(),
                uid: ctx.uid.clone(),
                t: timestamp.to_string(),
            }),
            PayloadTemplate::HeartBeat => RequestPayload::HeartBeat(HeartBeatPayload {
                gw_id: ctx.gateway_id.clone(),
                dev_id: ctx.device_id.clone(),
            }),
            PayloadTemplate::Refresh => RequestPayload::Refresh(RefreshPayload { dp_id: args.dp_ids }),
            PayloadTemplate::Empty => RequestPayload::Empty(BTreeMap::new()),
        }
    }

    /// Compact JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BridgeError::Encoding {
            details: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoded messages
// ---------------------------------------------------------------------------

/// Payload of a UDP discovery broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub ip: String,
    pub gw_id: String,
    #[serde(default)]
    pub product_key: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub encrypt: Option<bool>,
    #[serde(default)]
    pub active: Option<i64>,
}

/// Interpreted payload of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    DataPoints(Vec<DataPoint>),
    WifiScan(Vec<String>),
    Discovery(DiscoveryPayload),
    /// Bytes the command gives no meaning to (or non-JSON text)
    Raw(Vec<u8>),
    Empty,
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub device_id: String,
    pub command: LocalCommand,
    pub sequence: u32,
    pub return_code: Option<ReturnCode>,
    pub payload: MessagePayload,
}

impl DecodedMessage {
    /// Data points carried by this message (empty for other payloads).
    pub fn data_points(&self) -> &[DataPoint] {
        match &self.payload {
            MessagePayload::DataPoints(dps) => dps,
            _ => &[],
        }
    }

    /// Whether the device flagged this reply as failed.
    pub fn is_rejected(&self) -> bool {
        self.return_code.is_some_and(|rc| !rc.is_success())
    }
}

/// Interpret JSON payload text for `command`.
///
/// Commands with a reply schema are validated before being converted; a
/// schema violation is an error, not a silent drop.
pub fn interpret_payload(command: LocalCommand, body: &[u8]) -> Result<MessagePayload> {
    let trimmed = trim_body(body);
    if trimmed.is_empty() {
        return Ok(MessagePayload::Empty);
    }

    let Some(schema) = command.reply_schema() else {
        return Ok(MessagePayload::Raw(trimmed.to_vec()));
    };

    let value: serde_json::Value =
        serde_json::from_slice(trimmed).map_err(|e| BridgeError::InvalidPayload {
            details: format!("{:?} payload is not JSON: {}", command, e),
        })?;

    validate_payload(schema, &value).map_err(|details| BridgeError::SchemaViolation {
        command,
        details,
    })?;

    match schema {
        PayloadSchema::DataPoints => Ok(parse_data_points(&value)),
        PayloadSchema::WifiScan => {
            let ssids = value
                .get("ssid_list")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|s| s.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Ok(MessagePayload::WifiScan(ssids))
        }
        PayloadSchema::Discovery => serde_json::from_value(value)
            .map(MessagePayload::Discovery)
            .map_err(|e| BridgeError::InvalidPayload {
                details: e.to_string(),
            }),
    }
}

fn trim_body(body: &[u8]) -> &[u8] {
    let start = body.iter().position(|b| !b.is_ascii_whitespace() && *b != 0);
    let end = body.iter().rposition(|b| !b.is_ascii_whitespace() && *b != 0);
    match (start, end) {
        (Some(s), Some(e)) => &body[s..=e],
        _ => &[],
    }
}

fn parse_data_points(value: &serde_json::Value) -> MessagePayload {
    let Some(dps) = value.get("dps").and_then(|v| v.as_object()) else {
        return MessagePayload::Empty;
    };
    let points = dps
        .iter()
        .filter_map(|(id, v)| {
            DataPointValue::from_json(v).map(|value| DataPoint {
                id: id.clone(),
                value,
            })
        })
        .collect();
    MessagePayload::DataPoints(points)
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

/// JSON schemas for inbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSchema {
    DataPoints,
    WifiScan,
    Discovery,
}

type CompiledSchema = std::result::Result<jsonschema::Validator, String>;

impl PayloadSchema {
    fn source(&self) -> &'static str {
        match self {
            PayloadSchema::DataPoints => include_str!("../schemas/payload/data_points.schema.json"),
            PayloadSchema::WifiScan => include_str!("../schemas/payload/wifi_scan.schema.json"),
            PayloadSchema::Discovery => include_str!("../schemas/payload/discovery.schema.json"),
        }
    }

    fn cell(&self) -> &'static OnceLock<CompiledSchema> {
        static DATA_POINTS: OnceLock<CompiledSchema> = OnceLock::new();
        static WIFI_SCAN: OnceLock<CompiledSchema> = OnceLock::new();
        static DISCOVERY: OnceLock<CompiledSchema> = OnceLock::new();
        match self {
            PayloadSchema::DataPoints => &DATA_POINTS,
            PayloadSchema::WifiScan => &WIFI_SCAN,
            PayloadSchema::Discovery => &DISCOVERY,
        }
    }

    fn validator(&self) -> &'static CompiledSchema {
        self.cell().get_or_init(|| {
            let schema: serde_json::Value = serde_json::from_str(self.source())
                .map_err(|e| format!("schema {:?} is not JSON: {}", self, e))?;
            jsonschema::validator_for(&schema)
                .map_err(|e| format!("schema {:?} does not compile: {}", self, e))
        })
    }
}

/// Validate `value` against `schema`, returning all violations joined.
pub fn validate_payload(
    schema: PayloadSchema,
    value: &serde_json::Value,
) -> std::result::Result<(), String> {
    let validator = match schema.validator() {
        Ok(v) => v,
        Err(e) => {
            error!("{}", e);
            return Err(e.clone());
        }
    };
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new("bf0123456789abcdef", "bf0123456789abcdef")
    }

    #[test]
    fn test_command_codes_round_trip() {
        for command in LocalCommand::ALL {
            assert_eq!(LocalCommand::from_code(command.code()), Some(command));
        }
        assert_eq!(LocalCommand::Control.code(), 7);
        assert_eq!(LocalCommand::Status.code(), 8);
        assert_eq!(LocalCommand::HeartBeat.code(), 9);
        assert_eq!(LocalCommand::DataPointQuery.code(), 10);
        assert_eq!(LocalCommand::ControlNew.code(), 13);
        assert_eq!(LocalCommand::DataPointQueryNew.code(), 16);
        assert_eq!(LocalCommand::from_code(15), None);
        assert_eq!(LocalCommand::from_code(0xFFFF), None);
    }

    #[test]
    fn test_template_table() {
        use PayloadTemplate::*;
        let expected = [
            (LocalCommand::Control, Control),
            (LocalCommand::ControlNew, Control),
            (LocalCommand::DataPointQuery, Query),
            (LocalCommand::DataPointQueryNew, Query),
            (LocalCommand::QueryWifi, Query),
            (LocalCommand::HeartBeat, HeartBeat),
            (LocalCommand::DataPointRefresh, Refresh),
            (LocalCommand::Status, Empty),
            (LocalCommand::Bind, Empty),
            (LocalCommand::SceneExecute, Empty),
        ];
        for (command, template) in expected {
            assert_eq!(command.template(), template, "{:?}", command);
        }
    }

    #[test]
    fn test_control_payload_json() {
        let mut dps = BTreeMap::new();
        dps.insert("1".to_string(), DataPointValue::Bool(true));
        dps.insert("2".to_string(), DataPointValue::Integer(42));
        let payload =
            RequestPayload::for_command(LocalCommand::Control, &ctx(), RequestArgs::control(dps), 1700000000);
        let value: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "devId": "bf0123456789abcdef",
                "uid": "bf0123456789abcdef",
                "t": "1700000000",
                "dps": {"1": true, "2": 42}
            })
        );
    }

    #[test]
    fn test_query_and_heartbeat_payload_json() {
        let query = RequestPayload::for_command(
            LocalCommand::DataPointQuery,
            &RequestContext::new("dev", "gw"),
            RequestArgs::default(),
            5,
        );
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"gwId": "gw", "devId": "dev", "uid": "dev", "t": "5"})
        );

        let beat = RequestPayload::for_command(
            LocalCommand::HeartBeat,
            &RequestContext::new("dev", "gw"),
            RequestArgs::default(),
            5,
        );
        assert_eq!(serde_json::to_value(&beat).unwrap(), json!({"gwId": "gw", "devId": "dev"}));
    }

    #[test]
    fn test_refresh_and_empty_payload_json() {
        let refresh = RequestPayload::for_command(
            LocalCommand::DataPointRefresh,
            &ctx(),
            RequestArgs::refresh(vec![4, 5, 6]),
            0,
        );
        assert_eq!(refresh.to_json().unwrap(), r#"{"dpId":[4,5,6]}"#);

        let empty = RequestPayload::for_command(LocalCommand::Bind, &ctx(), RequestArgs::default(), 0);
        assert_eq!(empty.to_json().unwrap(), "{}");
    }

    #[test]
    fn test_data_point_value_untagged() {
        let v: DataPointValue = serde_json::from_value(json!(1.5)).unwrap();
        assert_eq!(v, DataPointValue::Float(1.5));
        let v: DataPointValue = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(v, DataPointValue::Integer(7));
        let v: DataPointValue = serde_json::from_value(json!("white")).unwrap();
        assert_eq!(v, DataPointValue::String("white".into()));
        assert_eq!(DataPointValue::from_json(&json!(null)), None);
        assert_eq!(DataPointValue::Integer(3).to_json(), json!(3));
    }

    #[test]
    fn test_interpret_status_payload() {
        let body = br#"{"devId":"x","dps":{"1":true,"3":"colour","20":255}}"#;
        let payload = interpret_payload(LocalCommand::Status, body).unwrap();
        let MessagePayload::DataPoints(points) = payload else {
            panic!("expected data points");
        };
        assert_eq!(points.len(), 3);
        assert!(points.contains(&DataPoint {
            id: "20".into(),
            value: DataPointValue::Integer(255)
        }));
    }

    #[test]
    fn test_interpret_schema_violation_is_error() {
        let body = br#"{"dps":{"1":[1,2]}}"#;
        let err = interpret_payload(LocalCommand::DataPointQuery, body).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaViolation { .. }));
        assert!(err.is_payload_fault());
    }

    #[test]
    fn test_interpret_invalid_json_is_error() {
        let err = interpret_payload(LocalCommand::Status, b"not json").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_interpret_wifi_scan() {
        let body = br#"{"ssid_list":["home","guest"]}"#;
        assert_eq!(
            interpret_payload(LocalCommand::QueryWifi, body).unwrap(),
            MessagePayload::WifiScan(vec!["home".into(), "guest".into()])
        );
    }

    #[test]
    fn test_interpret_discovery() {
        let body = br#"{"ip":"192.168.1.20","gwId":"bf01","active":2,"encrypt":true,"productKey":"key","version":"3.3"}"#;
        let MessagePayload::Discovery(d) = interpret_payload(LocalCommand::UdpNew, body).unwrap() else {
            panic!("expected discovery");
        };
        assert_eq!(d.ip, "192.168.1.20");
        assert_eq!(d.gw_id, "bf01");
        assert_eq!(d.version.as_deref(), Some("3.3"));
    }

    #[test]
    fn test_interpret_empty_and_raw() {
        assert_eq!(
            interpret_payload(LocalCommand::Control, b"").unwrap(),
            MessagePayload::Empty
        );
        assert_eq!(
            interpret_payload(LocalCommand::HeartBeat, b"\0\0").unwrap(),
            MessagePayload::Empty
        );
        assert_eq!(
            interpret_payload(LocalCommand::Bind, b"ok").unwrap(),
            MessagePayload::Raw(b"ok".to_vec())
        );
    }

    #[test]
    fn test_rejected_reply() {
        let msg = DecodedMessage {
            device_id: "d".into(),
            command: LocalCommand::Control,
            sequence: 3,
            return_code: Some(ReturnCode(1)),
            payload: MessagePayload::Empty,
        };
        assert!(msg.is_rejected());
        assert!(msg.data_points().is_empty());
    }
}
