//! Client endpoint types: the per-WebSocket handle the engine fans output into,
//! and the tagged JSON envelopes crossing the wire in both directions. Bounds
//! are validated here so untyped payloads never travel past the endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Inbound frames larger than this are dropped without closing the socket.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Upper bound on one `pty-input` payload.
pub const MAX_INPUT_BYTES: usize = 16_384;
/// Resize dimensions must be in 1..=MAX_RESIZE_DIM.
pub const MAX_RESIZE_DIM: u16 = 500;
/// Upper bound on one `pty-ack` byte count.
pub const MAX_ACK_BYTES: u64 = 1_000_000;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// One attached browser client. The engine pushes messages into `tx`; the
/// WebSocket task on the other end serializes them onto the socket. The id is
/// the key for per-client pending-byte accounting.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Queue a message for this client. A send to a gone client returns false
    /// and is otherwise ignored; the socket layer detaches it on close.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Server → client envelope.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    PtyData { session_id: String, data: String },
    InteractionNeeded { session_id: String, reason: String },
    PtyExit { session_id: String, exit_code: i32 },
}

/// Client → server envelope.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    PtyInput { session_id: String, data: String },
    PtyResize { session_id: String, cols: u16, rows: u16 },
    PtyAck { session_id: String, bytes: u64 },
}

impl ClientMessage {
    /// Bounds check. Out-of-bounds messages are dropped silently per the wire
    /// contract; the session id itself is taken from the socket path.
    pub fn is_valid(&self) -> bool {
        match self {
            ClientMessage::PtyInput { data, .. } => data.len() <= MAX_INPUT_BYTES,
            ClientMessage::PtyResize { cols, rows, .. } => {
                (1..=MAX_RESIZE_DIM).contains(cols) && (1..=MAX_RESIZE_DIM).contains(rows)
            }
            ClientMessage::PtyAck { bytes, .. } => *bytes >= 1 && *bytes <= MAX_ACK_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ClientMessage {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn inbound_envelopes_parse() {
        match parse(r#"{"type":"pty-input","sessionId":"s","data":"ls\r"}"#) {
            ClientMessage::PtyInput { session_id, data } => {
                assert_eq!(session_id, "s");
                assert_eq!(data, "ls\r");
            }
            other => panic!("wrong variant: {other:?}"),
        }
        match parse(r#"{"type":"pty-resize","sessionId":"s","cols":120,"rows":40}"#) {
            ClientMessage::PtyResize { cols, rows, .. } => {
                assert_eq!((cols, rows), (120, 40));
            }
            other => panic!("wrong variant: {other:?}"),
        }
        match parse(r#"{"type":"pty-ack","sessionId":"s","bytes":32768}"#) {
            ClientMessage::PtyAck { bytes, .. } => assert_eq!(bytes, 32768),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn outbound_envelopes_serialize_with_wire_names() {
        let msg = ServerMessage::PtyExit {
            session_id: "s".into(),
            exit_code: 0,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "pty-exit");
        assert_eq!(json["sessionId"], "s");
        assert_eq!(json["exitCode"], 0);

        let msg = ServerMessage::InteractionNeeded {
            session_id: "s".into(),
            reason: "Input prompt detected".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "interaction-needed");
    }

    #[test]
    fn input_size_bound() {
        let ok = ClientMessage::PtyInput {
            session_id: "s".into(),
            data: "x".repeat(MAX_INPUT_BYTES),
        };
        assert!(ok.is_valid());
        let too_big = ClientMessage::PtyInput {
            session_id: "s".into(),
            data: "x".repeat(MAX_INPUT_BYTES + 1),
        };
        assert!(!too_big.is_valid());
    }

    #[test]
    fn resize_bounds() {
        let mk = |cols, rows| ClientMessage::PtyResize {
            session_id: "s".into(),
            cols,
            rows,
        };
        assert!(mk(120, 40).is_valid());
        assert!(mk(1, 1).is_valid());
        assert!(mk(500, 500).is_valid());
        assert!(!mk(0, 40).is_valid());
        assert!(!mk(501, 40).is_valid());
        assert!(!mk(120, 0).is_valid());
    }

    #[test]
    fn ack_bounds() {
        let mk = |bytes| ClientMessage::PtyAck {
            session_id: "s".into(),
            bytes,
        };
        assert!(mk(1).is_valid());
        assert!(mk(1_000_000).is_valid());
        assert!(!mk(0).is_valid());
        assert!(!mk(1_000_001).is_valid());
    }
}
