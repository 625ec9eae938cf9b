//! Viewer transport.

pub mod websocket;
