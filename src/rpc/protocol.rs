//! JSON-RPC 2.0 message types shared by the TCP and WebSocket surfaces.
//!
//! See: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ControlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be exactly "2.0"
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications, which get no response.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated message, e.g. `transfer.progress` pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application error codes
pub const JOB_ACTIVE: i32 = -32001;
pub const NO_ACTIVE_JOB: i32 = -32002;
pub const NOT_CLEARED: i32 = -32003;
pub const NOT_FOUND: i32 = -32004;
pub const INVALID_DOMAIN_REQUEST: i32 = -32005;
pub const VOLUMES_BUSY: i32 = -32006;
pub const VOLUME_UNAVAILABLE: i32 = -32007;

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: "2.0".to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("Failed to serialize result: {}", e)),
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        let mut response = Self::error(id, code, message);
        if let Some(error) = response.error.as_mut() {
            error.data = serde_json::to_value(data).ok();
        }
        response
    }

    /// Used when the request id could not be read.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details.into())
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details.into())
    }

    pub fn not_found(id: Value, what: impl Into<String>) -> Self {
        Self::error(id, NOT_FOUND, what.into())
    }

    /// Map an orchestrator rejection onto its application error code. The
    /// offending job id, when there is one, travels in `data`.
    pub fn control_error(id: Value, err: &ControlError) -> Self {
        let message = err.to_string();
        match err {
            ControlError::AlreadyActive(job_id) => {
                Self::error_with_data(id, JOB_ACTIVE, message, serde_json::json!({ "job_id": job_id }))
            }
            ControlError::NotCleared(job_id) => {
                Self::error_with_data(id, NOT_CLEARED, message, serde_json::json!({ "job_id": job_id }))
            }
            ControlError::NoActiveJob => Self::error(id, NO_ACTIVE_JOB, message),
            ControlError::InvalidRequest(_) => Self::error(id, INVALID_DOMAIN_REQUEST, message),
            ControlError::Config(_) => Self::internal_error(id, message),
            ControlError::Busy(_) => Self::error(id, VOLUMES_BUSY, message),
            ControlError::Unavailable(_) => Self::error(id, VOLUME_UNAVAILABLE, message),
        }
    }
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(id.into())),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

impl Notification {
    pub fn new(method: &str, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = r#"{"jsonrpc":"2.0","method":"transfer.start","params":{"project":"wedding"},"id":1}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "transfer.start");
        assert_eq!(req.params.unwrap()["project"], "wedding");
        assert_eq!(req.id, Some(Value::Number(1.into())));
    }

    #[test]
    fn test_parse_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"transfer.cancel"}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(req.is_notification());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let json = r#"{"jsonrpc":"1.0","method":"daemon.status","id":3}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_serialize_success_response() {
        let resp = Response::success(Value::Number(1.into()), "ok");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains(r#""result":"ok""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_control_error_codes() {
        let id = Value::Number(7.into());
        let active = Response::control_error(id.clone(), &ControlError::AlreadyActive("abc".into()));
        let error = active.error.unwrap();
        assert_eq!(error.code, JOB_ACTIVE);
        assert_eq!(error.data.unwrap()["job_id"], "abc");

        let codes: Vec<i32> = [
            ControlError::NoActiveJob,
            ControlError::NotCleared("abc".into()),
            ControlError::InvalidRequest("bad".into()),
            ControlError::Busy("a speed test"),
            ControlError::Unavailable("no removable drive detected".into()),
        ]
        .iter()
        .map(|e| Response::control_error(id.clone(), e).error.unwrap().code)
        .collect();
        assert_eq!(
            codes,
            vec![
                NO_ACTIVE_JOB,
                NOT_CLEARED,
                INVALID_DOMAIN_REQUEST,
                VOLUMES_BUSY,
                VOLUME_UNAVAILABLE
            ]
        );
    }

    #[test]
    fn test_progress_notification_shape() {
        let note = Notification::new("transfer.progress", serde_json::json!({ "percent": 50 })).unwrap();
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["method"], "transfer.progress");
        assert_eq!(json["params"]["percent"], 50);
        assert!(json.get("id").is_none());
    }
}
