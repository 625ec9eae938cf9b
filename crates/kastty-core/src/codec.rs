//! JSON codec for the kastty control channel.
//!
//! Decoding is fail-closed: text that is not JSON, lacks the `type`
//! discriminator, names an unknown type, or carries a mistyped field is
//! rejected with a [`ProtocolError`]. Unknown extra fields are dropped.

use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a control message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame received from a viewer.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    decode(text, "client")
}

/// Decode a text frame received from the session.
pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    decode(text, "server")
}

fn decode<T: DeserializeOwned>(text: &str, label: &str) -> Result<T, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError(format!("invalid JSON: {e}")))?;

    if !value.is_object() {
        return Err(ProtocolError(format!("invalid {label} message: expected an object")));
    }

    serde_json::from_value(value)
        .map_err(|e| ProtocolError(format!("invalid {label} message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_resize() {
        let msg = decode_client(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn decodes_readonly_request() {
        let msg = decode_client(r#"{"type":"readonly","enabled":true}"#).unwrap();
        assert_eq!(msg, ClientMessage::ReadonlyRequest { enabled: true });
    }

    #[test]
    fn decodes_ping_with_integer_timestamp() {
        let msg = decode_client(r#"{"type":"ping","ts":1700000000000}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { ts: 1_700_000_000_000.0 });
    }

    #[test]
    fn strips_extra_fields() {
        let msg = decode_client(r#"{"type":"resize","cols":80,"rows":24,"extra":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { cols: 80, rows: 24 });
        assert!(!encode(&msg).unwrap().contains("extra"));
    }

    #[test]
    fn rejects_missing_field() {
        assert!(decode_client(r#"{"type":"resize","rows":40}"#).is_err());
    }

    #[test]
    fn rejects_wrong_field_types() {
        assert!(decode_client(r#"{"type":"resize","cols":"80","rows":24}"#).is_err());
        assert!(decode_client(r#"{"type":"readonly","enabled":"yes"}"#).is_err());
        assert!(decode_client(r#"{"type":"ping","ts":"now"}"#).is_err());
        assert!(decode_client(r#"{"type":"resize","cols":-1,"rows":24}"#).is_err());
    }

    #[test]
    fn rejects_fractional_and_oversized_dimensions() {
        assert!(decode_client(r#"{"type":"resize","cols":80.0,"rows":24}"#).is_err());
        assert!(decode_client(r#"{"type":"resize","cols":80,"rows":70000}"#).is_err());
        assert_eq!(
            decode_client(r#"{"type":"resize","cols":65535,"rows":0}"#).unwrap(),
            ClientMessage::Resize { cols: 65535, rows: 0 }
        );
    }

    #[test]
    fn rejects_non_json_and_empty() {
        assert!(decode_client("not json").is_err());
        assert!(decode_client("").is_err());
        assert!(decode_server("").is_err());
    }

    #[test]
    fn rejects_missing_or_unknown_discriminator() {
        assert!(decode_client(r#"{"cols":80,"rows":24}"#).is_err());
        assert!(decode_client(r#"{"type":"shutdown"}"#).is_err());
        assert!(decode_client(r#"[{"type":"ping","ts":1}]"#).is_err());
        assert!(decode_server(r#"{"code":0}"#).is_err());
    }

    #[test]
    fn client_messages_do_not_decode_as_server_messages() {
        assert!(decode_server(r#"{"type":"resize","cols":80,"rows":24}"#).is_err());
        assert!(decode_client(r#"{"type":"hello","readonly":false}"#).is_err());
    }

    #[test]
    fn client_round_trip() {
        let messages = [
            ClientMessage::Resize { cols: 80, rows: 24 },
            ClientMessage::ReadonlyRequest { enabled: false },
            ClientMessage::Ping { ts: 1234.5 },
        ];
        for msg in messages {
            let text = encode(&msg).unwrap();
            assert_eq!(decode_client(&text).unwrap(), msg);
        }
    }

    #[test]
    fn server_round_trip() {
        let messages = [
            ServerMessage::Hello { readonly: true },
            ServerMessage::Exit { code: -1 },
            ServerMessage::Error { message: "boom".into() },
            ServerMessage::Pong { ts: 42.0 },
            ServerMessage::ReadonlyNotice { enabled: true },
        ];
        for msg in messages {
            let text = encode(&msg).unwrap();
            assert_eq!(decode_server(&text).unwrap(), msg);
        }
    }

    #[test]
    fn encodes_discriminator() {
        let text = encode(&ServerMessage::Exit { code: 3 }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "exit");
        assert_eq!(value["code"], 3);
    }
}
