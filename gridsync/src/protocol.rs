//! Binary wire protocol for the sync transport.
//!
//! Every frame is a bincode-encoded enum over one persistent WebSocket
//! connection. Client frames carry a `request_id` so the server can
//! correlate acknowledgements and rejections; server-pushed frames
//! (snapshots, applied ops) carry the subscription or document they
//! belong to instead.
//!
//! ```text
//! client ──► Subscribe / Unsubscribe / SubmitOp / Ping
//! server ──► Subscribed / Snapshot / OpApplied / OpAck / Error / Pong
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::edit::Edit;
use crate::query::Predicate;
use crate::value::{Collection, DocData};

/// Connection query parameter carrying the share token.
pub const SHARE_TOKEN_PARAM: &str = "shareId";

/// String-stable error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Connection-level: share token invalid or unresolvable.
    Unauthorized,
    /// Operation-level: the session's scope forbids the action.
    RestrictedResource,
    /// Base version stale and retry budget not yet exhausted.
    VersionConflict,
    /// Conflicting edits could not be transformed.
    Irreconcilable,
    /// Target document does not exist.
    NotFound,
}

impl ErrorCode {
    /// Wire-stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RestrictedResource => "RESTRICTED_RESOURCE",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::Irreconcilable => "IRRECONCILABLE",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document snapshot as delivered in initial result sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub doc_id: String,
    pub version: u64,
    pub data: DocData,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Open a live query over a collection.
    Subscribe {
        request_id: u64,
        collection: Collection,
        predicate: Predicate,
    },
    /// Tear down a live query.
    Unsubscribe {
        request_id: u64,
        subscription_id: Uuid,
    },
    /// Submit an operation against one document.
    SubmitOp {
        request_id: u64,
        collection: Collection,
        doc_id: String,
        base_version: u64,
        op_id: Uuid,
        edits: Vec<Edit>,
    },
    /// Heartbeat probe.
    Ping,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Subscription established; carries the initial result set.
    Subscribed {
        request_id: u64,
        subscription_id: Uuid,
        collection: Collection,
        docs: Vec<DocSnapshot>,
    },
    /// Subscription torn down.
    Unsubscribed { request_id: u64 },
    /// A document newly entered a subscription's result set.
    Snapshot {
        subscription_id: Uuid,
        collection: Collection,
        doc_id: String,
        version: u64,
        data: DocData,
    },
    /// An accepted operation, fanned out to matching subscribers.
    OpApplied {
        collection: Collection,
        doc_id: String,
        new_version: u64,
        edits: Vec<Edit>,
    },
    /// A document left a subscription's result set.
    DocRemoved {
        subscription_id: Uuid,
        collection: Collection,
        doc_id: String,
    },
    /// The author's own submission was accepted.
    OpAck { request_id: u64, new_version: u64 },
    /// A request was rejected. `request_id` is `None` only for
    /// connection-level failures (e.g. handshake rejection).
    Error {
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    /// Heartbeat response.
    Pong,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// The correlation id, if this frame carries one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientFrame::Subscribe { request_id, .. }
            | ClientFrame::Unsubscribe { request_id, .. }
            | ClientFrame::SubmitOp { request_id, .. } => Some(*request_id),
            ClientFrame::Ping => None,
        }
    }
}

impl ServerFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Build a rejection frame correlated to a request.
    pub fn error(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            request_id: Some(request_id),
            code,
            message: message.into(),
        }
    }

    /// Build a connection-level rejection frame.
    pub fn connection_error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error { request_id: None, code, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CellValue;

    #[test]
    fn test_submit_op_roundtrip() {
        let frame = ClientFrame::SubmitOp {
            request_id: 7,
            collection: Collection::records("tbl1"),
            doc_id: "rec1".into(),
            base_version: 5,
            op_id: Uuid::new_v4(),
            edits: vec![Edit::SetField { field_id: "f1".into(), value: "x".into() }],
        };
        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.request_id(), Some(7));
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let frame = ClientFrame::Subscribe {
            request_id: 1,
            collection: Collection::fields("tbl1"),
            predicate: Predicate::All,
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(ClientFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_op_applied_roundtrip() {
        let frame = ServerFrame::OpApplied {
            collection: Collection::records("tbl1"),
            doc_id: "rec1".into(),
            new_version: 6,
            edits: vec![Edit::SetField { field_id: "f1".into(), value: CellValue::Null }],
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_error_frame_correlation() {
        let frame = ServerFrame::error(42, ErrorCode::RestrictedResource, "read-only scope");
        match &frame {
            ServerFrame::Error { request_id, code, .. } => {
                assert_eq!(*request_id, Some(42));
                assert_eq!(*code, ErrorCode::RestrictedResource);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let conn = ServerFrame::connection_error(ErrorCode::Unauthorized, "bad token");
        match conn {
            ServerFrame::Error { request_id: None, code: ErrorCode::Unauthorized, .. } => {}
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_error_code_strings_stable() {
        assert_eq!(ErrorCode::Unauthorized.as_str(), "UNAUTHORIZED");
        assert_eq!(ErrorCode::RestrictedResource.as_str(), "RESTRICTED_RESOURCE");
        assert_eq!(ErrorCode::VersionConflict.as_str(), "VERSION_CONFLICT");
        assert_eq!(ErrorCode::Irreconcilable.as_str(), "IRRECONCILABLE");
        assert_eq!(ErrorCode::NotFound.as_str(), "NOT_FOUND");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientFrame::decode(&garbage).is_err());
        assert!(ServerFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_small_frame_size() {
        let frame = ClientFrame::SubmitOp {
            request_id: 1,
            collection: Collection::records("tbl1"),
            doc_id: "rec1".into(),
            base_version: 1,
            op_id: Uuid::new_v4(),
            edits: vec![Edit::SetField { field_id: "f1".into(), value: "x".into() }],
        };
        let encoded = frame.encode().unwrap();
        // Single-edit submissions should stay comfortably small.
        assert!(encoded.len() < 128, "frame too large: {}", encoded.len());
    }
}
