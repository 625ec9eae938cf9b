//! kastty-core: Shared protocol library for kastty.
//!
//! Provides the JSON control messages exchanged between a shared terminal
//! session and its viewers, the fail-closed codec for them, and an
//! incremental scanner that extracts window titles from terminal output.

pub mod codec;
pub mod error;
pub mod messages;
pub mod title;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, decode_server, encode};
pub use error::{KasttyError, KasttyResult, ProtocolError};
pub use messages::{ClientMessage, ServerMessage};
pub use title::{display_title, TitleScanner, DEFAULT_TITLE, MAX_RESIDUAL_CHARS};
