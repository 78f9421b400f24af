//! Typed command payloads.
//!
//! These records travel JSON-serialized inside the envelope's content blob.
//! Reports carry their optional fields explicitly instead of a dynamic map,
//! so which fields are legal for which report is checked at compile time.

use serde::{
    Deserialize,
    Serialize,
};

/// Severity of a [`MsgbusMessage`] shown by the host's message bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Info,
    Error,
    Alert,
    Fatal,
}

/// A human-readable message for the host's message bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgbusMessage {
    pub msgtext: String,
    pub msgtype: MessageType,
}

impl MsgbusMessage {
    pub fn new(msgtext: impl Into<String>, msgtype: MessageType) -> Self {
        Self {
            msgtext: msgtext.into(),
            msgtype,
        }
    }
}

/// Liveness request. Expects a [`Pong`] echoing the sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

/// Liveness response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Sequence number of the ping this answers.
    pub ping_seqno: u32,
}

/// Peer-initiated termination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {}

/// Request to enumerate capture interfaces this helper can drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInterfaces {}

/// Request to probe whether a source definition belongs to this helper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSource {
    pub definition: String,
}

/// Request to open a source and start the capture session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSource {
    pub definition: String,
}

/// Channel-hopping configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelHop {
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<bool>,
}

/// Request to (re)configure an open source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Configure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hopping: Option<ChannelHop>,
}

/// Success/failure header correlating a report with its request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
    /// Sequence number of the originating request, `0` if unsolicited.
    pub seqno: u32,
}

/// One enumerable capture interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
}

/// Reply to [`ListInterfaces`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacesReport {
    pub success: Success,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

/// Reply to [`ProbeSource`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSourceReport {
    pub success: Success,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Reply to [`OpenSource`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSourceReport {
    pub success: Success,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
    /// DLT/link type of packets this source emits.
    #[serde(default)]
    pub dlt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Reply to [`Configure`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigureReport {
    pub success: Success,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hopping: Option<ChannelHop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Fatal source error, in response to a request (`seqno`) or unsolicited
/// (`seqno == 0`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub success: Success,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
}

/// Non-fatal condition shown in the host's source details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningReport {
    pub warning: String,
}

/// A decoded record forwarded as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRecord {
    /// Record type tag, e.g. `radiation` or `rtl433`.
    #[serde(rename = "type")]
    pub record_type: String,
    /// The JSON document itself.
    pub json: String,
    pub time_sec: u64,
    pub time_usec: u32,
}

/// Signal data attached to a capture record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_dbm: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_khz: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// GPS fix attached to a capture record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// Streaming capture data, sent any time while a source is open.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MsgbusMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps: Option<Gps>,
}

/// Announces a remote source to the host after connecting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSource {
    pub definition: String,
    pub sourcetype: String,
    pub uuid: String,
}

#[cfg(test)]
mod tests {
    use super::{
        DataReport,
        JsonRecord,
        MessageType,
        MsgbusMessage,
        OpenSourceReport,
        Success,
    };

    #[test]
    fn optional_report_fields_are_omitted() {
        let report = OpenSourceReport {
            success: Success {
                success: false,
                seqno: 3,
            },
            message: Some(MsgbusMessage::new("no such device", MessageType::Error)),
            dlt: 0,
            capture_interface: None,
            channel: None,
            channels: None,
            hardware: None,
            uuid: None,
            warning: None,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("uuid"));
        assert!(!json.contains("warning"));

        let back: OpenSourceReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn data_report_round_trip() {
        let report = DataReport {
            json: Some(JsonRecord {
                record_type: "radiation".into(),
                json: r#"{"cps": 3}"#.into(),
                time_sec: 1_700_000_000,
                time_usec: 250_000,
            }),
            ..Default::default()
        };

        let json = serde_json::to_vec(&report).unwrap();
        let back: DataReport = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, report);
    }
}
