//! Shared request/response types for the control API.
//!
//! These types are serialized as JSON over every control transport. Both
//! the server (daemon) and the client (CLI) use them.

use axum::body::Bytes;
use serde::{Deserialize, Serialize};

use crate::sys::DeviceScope;

/// `status` value of a successful envelope.
pub const STATUS_SUCCESS: &str = "success";

/// `status` value of a failed envelope.
pub const STATUS_ERROR: &str = "error";

/// Uniform response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    pub message: String,
}

impl Response {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(STATUS_SUCCESS, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(STATUS_ERROR, message)
    }

    pub fn is_error(&self) -> bool {
        self.status == STATUS_ERROR
    }
}

/// Body of the proxy and DNS endpoints. Every field is optional; each
/// endpoint reads the ones it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bypass: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_active_device: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
}

impl ControlRequest {
    /// Decode a request body. An empty body is the default request.
    pub fn from_body(body: &Bytes) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
    }

    pub fn scope(&self) -> DeviceScope {
        DeviceScope {
            device: Some(self.device.clone()).filter(|d| !d.is_empty()),
            only_active: self.only_active_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_body_is_default_request() {
        assert_eq!(ControlRequest::from_body(&Bytes::new()).unwrap(), ControlRequest::default());
        assert_eq!(
            ControlRequest::from_body(&Bytes::from_static(b"  \n")).unwrap(),
            ControlRequest::default()
        );
    }

    #[test]
    fn test_request_fields() {
        let body = Bytes::from_static(
            br#"{"server":"127.0.0.1:7890","bypass":"localhost","device":"Wi-Fi","only_active_device":true,"servers":["1.1.1.1"]}"#,
        );
        let req = ControlRequest::from_body(&body).unwrap();
        assert_eq!(req.server, "127.0.0.1:7890");
        assert_eq!(req.servers, vec!["1.1.1.1".to_string()]);
        assert_eq!(
            req.scope(),
            DeviceScope {
                device: Some("Wi-Fi".to_string()),
                only_active: true,
            }
        );
    }

    #[test]
    fn test_malformed_body_is_error() {
        assert!(ControlRequest::from_body(&Bytes::from_static(b"{not json")).is_err());
    }

    #[test]
    fn test_default_request_serializes_empty() {
        assert_eq!(serde_json::to_string(&ControlRequest::default()).unwrap(), "{}");
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "message": "boom"}));
    }
}
