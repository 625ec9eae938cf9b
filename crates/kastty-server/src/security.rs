//! Connection predicate for the viewer endpoint.
//!
//! The server only listens on loopback, but a browser on the same machine
//! can still be tricked into connecting. Every WebSocket handshake must
//! therefore carry a loopback `Host`, a loopback (or absent) `Origin`, and
//! the per-run access token in the `t` query parameter.

use rand::RngCore;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Random bytes in an access token (hex-encoded to twice as many chars).
const TOKEN_BYTES: usize = 16;
const MASK: &str = "****";

/// Generate a fresh access token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Replace every occurrence of `token` in `input`, for logging.
pub fn mask_token(input: &str, token: &str) -> String {
    if token.is_empty() {
        return input.to_string();
    }
    input.replace(token, MASK)
}

/// Decides whether an incoming handshake may reach the session.
#[derive(Debug, Clone)]
pub struct ConnectionGuard {
    port: u16,
    token: String,
}

impl ConnectionGuard {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self {
            port,
            token: token.into(),
        }
    }

    /// `Host` must name the loopback listener, including its port.
    pub fn is_valid_host(&self, host: Option<&str>) -> bool {
        let Some(host) = host else {
            return false;
        };
        host == format!("127.0.0.1:{}", self.port) || host == format!("localhost:{}", self.port)
    }

    /// Non-browser clients send no `Origin`; browsers must come from the loopback page.
    pub fn is_valid_origin(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        origin == format!("http://127.0.0.1:{}", self.port)
            || origin == format!("http://localhost:{}", self.port)
    }

    /// The `t` query parameter must equal the access token.
    pub fn is_valid_token(&self, query: Option<&str>) -> bool {
        let Some(query) = query else {
            return false;
        };
        query
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .any(|(key, value)| key == "t" && !value.is_empty() && value == self.token)
    }

    /// All three checks against a WebSocket upgrade request.
    pub fn is_authorized(&self, request: &Request) -> bool {
        let header = |name: &str| request.headers().get(name).and_then(|v| v.to_str().ok());
        self.is_valid_host(header("host"))
            && self.is_valid_origin(header("origin"))
            && self.is_valid_token(request.uri().query())
    }
}
