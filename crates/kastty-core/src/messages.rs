// kastty control message types.
//
// Control messages travel as JSON text frames; terminal bytes travel as
// binary frames and never pass through these types.

use serde::{Deserialize, Serialize};

/// Messages sent by a viewer to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Viewer's terminal grid changed size.
    ///
    /// `cols` and `rows` are whole numbers in `0..=65535`; fractional or
    /// out-of-range values fail to decode.
    Resize { cols: u16, rows: u16 },
    /// Ask the session to enter or leave readonly mode.
    #[serde(rename = "readonly")]
    ReadonlyRequest { enabled: bool },
    /// Latency probe; answered with a `Pong` carrying the same `ts`.
    Ping { ts: f64 },
}

/// Messages sent by the session to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First frame on every connection.
    Hello { readonly: bool },
    /// The terminal process terminated.
    Exit { code: i32 },
    Error { message: String },
    Pong { ts: f64 },
    /// Readonly mode changed while the viewer was connected.
    #[serde(rename = "readonly")]
    ReadonlyNotice { enabled: bool },
}

impl ServerMessage {
    /// Wire discriminator of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::Exit { .. } => "exit",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::ReadonlyNotice { .. } => "readonly",
        }
    }
}
