//! API Models
//!
//! Request and response bodies for the HTTP surface, documented with `utoipa`.

use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

/// A live session as reported by `GET /sessions`.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    #[schema(example = "a1b2c3")]
    pub webrtc_id: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
}

/// Auxiliary inputs for a session's reply function.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct InputPayload {
    #[schema(value_type = Vec<Object>, example = json!(["friendly", 0.7]))]
    pub args: Vec<Value>,
}

/// One batch of additional outputs produced by a session's handler.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct OutputPayload {
    #[schema(value_type = Vec<Object>, example = json!(["transcript"]))]
    pub args: Vec<Value>,
}

/// Query for a single read of a session's additional outputs.
#[derive(Deserialize, IntoParams, Debug, Default)]
pub struct LatestOutputQuery {
    /// How long to wait for an output, in milliseconds. Capped at 10 s.
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_info_serialization() {
        let info = SessionInfo {
            webrtc_id: "abc".to_string(),
            state: ConnectionState::Connecting,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["webrtc_id"], "abc");
        assert_eq!(json["state"], "connecting");

        let deserialized: SessionInfo = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized, info);
    }

    #[test]
    fn test_input_payload_deserialization() {
        let payload: InputPayload =
            serde_json::from_str(r#"{"args": ["friendly", 0.7, {"lang": "en"}]}"#).unwrap();
        assert_eq!(payload.args, vec![json!("friendly"), json!(0.7), json!({"lang": "en"})]);

        assert!(serde_json::from_str::<InputPayload>(r#"{"args": "nope"}"#).is_err());
    }

    #[test]
    fn test_latest_output_query_timeout_is_optional() {
        let query: LatestOutputQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.timeout_ms, None);
        let query: LatestOutputQuery = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(query.timeout_ms, Some(250));
    }
}
