//! Envelope type tags and payload shapes.
//!
//! Tags `ready`, `sync` and `close` are the lifecycle handshake. Inbound
//! envelopes with any other tag are correlation replies: the parent echoes
//! the request id back as the message type.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Handshake: parent bootstraps the worker (inbound) / worker is initialized (outbound).
pub const READY: &str = "ready";

/// Parent reports the last synchronization point (inbound only).
pub const SYNC: &str = "sync";

/// Parent asks the worker to shut down (inbound) / resources released (outbound).
pub const CLOSE: &str = "close";

/// Correlated lookup of a device's registration.
pub const REQUEST_DEVICE_INFO: &str = "requestdeviceinfo";

/// Store arbitrary state against a device.
pub const SET_DEVICE_STATE: &str = "setdevicestate";

/// Device data to be processed by the parent.
pub const DATA: &str = "data";

/// Free-form log line for the parent's loggers.
pub const LOG: &str = "log";

/// Structured failure report.
pub const ERROR: &str = "error";

/// A tagged message unit exchanged with the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope with an arbitrary tag and payload.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// `{"type":"ready"}`
    pub fn ready() -> Self {
        Self::new(READY, Value::Null)
    }

    /// `{"type":"close"}`
    pub fn close() -> Self {
        Self::new(CLOSE, Value::Null)
    }

    pub fn set_device_state(device_id: &str, state: Value) -> Self {
        Self::new(
            SET_DEVICE_STATE,
            json!({ "deviceId": device_id, "state": state }),
        )
    }

    pub fn data(device: &str, data: &str) -> Self {
        Self::new(DATA, json!({ "device": device, "data": data }))
    }

    pub fn log(data: &str) -> Self {
        Self::new(LOG, Value::String(data.to_string()))
    }

    pub fn error(name: &str, message: &str, stack: &str) -> Self {
        Self::new(
            ERROR,
            json!({ "name": name, "message": message, "stack": stack }),
        )
    }

    /// Classify an inbound envelope, unwrapping lifecycle payloads.
    pub fn into_inbound(self) -> Inbound {
        match self.kind.as_str() {
            READY => Inbound::Ready {
                options: take_field(self.data, &["options"]),
            },
            SYNC => Inbound::Sync {
                last_sync: take_field(self.data, &["last_sync_dt", "lastSyncTimestamp"]),
            },
            CLOSE => Inbound::Close,
            _ => Inbound::Reply {
                kind: self.kind,
                data: self.data,
            },
        }
    }
}

/// An inbound envelope after routing by tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Parent bootstrap carrying the worker's options.
    Ready { options: Value },
    /// Last synchronization timestamp, as sent by the parent.
    Sync { last_sync: Value },
    /// Shutdown request.
    Close,
    /// Any other tag; `kind` is the correlation id the reply answers.
    Reply { kind: String, data: Value },
}

fn take_field(data: Value, names: &[&str]) -> Value {
    let Value::Object(mut map) = data else {
        return Value::Null;
    };
    names
        .iter()
        .find_map(|name| map.remove(*name))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_without_data_serializes_bare_tag() {
        let wire = serde_json::to_string(&Envelope::ready()).unwrap();
        assert_eq!(wire, r#"{"type":"ready"}"#);
    }

    #[test]
    fn missing_data_deserializes_as_null() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert_eq!(envelope.kind, CLOSE);
        assert!(envelope.data.is_null());
    }

    #[test]
    fn ready_unwraps_options() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"ready","data":{"options":{"partitionId":"3"}}}"#)
                .unwrap();
        assert_eq!(
            envelope.into_inbound(),
            Inbound::Ready {
                options: json!({ "partitionId": "3" })
            }
        );
    }

    #[test]
    fn ready_without_options_yields_null() {
        let inbound = Envelope::new(READY, json!({})).into_inbound();
        assert_eq!(
            inbound,
            Inbound::Ready {
                options: Value::Null
            }
        );
    }

    #[test]
    fn sync_accepts_both_timestamp_spellings() {
        let legacy = Envelope::new(SYNC, json!({ "last_sync_dt": "2024-01-01T00:00:00Z" }));
        let camel = Envelope::new(SYNC, json!({ "lastSyncTimestamp": 1700000000 }));

        assert_eq!(
            legacy.into_inbound(),
            Inbound::Sync {
                last_sync: json!("2024-01-01T00:00:00Z")
            }
        );
        assert_eq!(
            camel.into_inbound(),
            Inbound::Sync {
                last_sync: json!(1700000000)
            }
        );
    }

    #[test]
    fn unknown_tag_is_a_reply() {
        let inbound = Envelope::new("3f2a9c", json!({ "name": "sensor" })).into_inbound();
        assert_eq!(
            inbound,
            Inbound::Reply {
                kind: "3f2a9c".to_string(),
                data: json!({ "name": "sensor" })
            }
        );
    }

    #[test]
    fn outbound_shapes_match_parent_schema() {
        assert_eq!(
            serde_json::to_value(Envelope::set_device_state("dev-1", json!({ "on": true })))
                .unwrap(),
            json!({ "type": "setdevicestate", "data": { "deviceId": "dev-1", "state": { "on": true } } })
        );
        assert_eq!(
            serde_json::to_value(Envelope::data("dev-1", "{\"t\":20}")).unwrap(),
            json!({ "type": "data", "data": { "device": "dev-1", "data": "{\"t\":20}" } })
        );
        assert_eq!(
            serde_json::to_value(Envelope::log("hello")).unwrap(),
            json!({ "type": "log", "data": "hello" })
        );
        assert_eq!(
            serde_json::to_value(Envelope::error("Error", "boom", "Error: boom")).unwrap(),
            json!({ "type": "error", "data": { "name": "Error", "message": "boom", "stack": "Error: boom" } })
        );
    }
}
