//! Remote flow gateway abstractions
//!
//! The core never talks to the network itself. Every remote effect goes
//! through `FlowGateway`, so controllers and the reconciliation service can
//! be driven by the in-memory reference implementation or a test double.

pub mod instrumented;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use instrumented::InstrumentedGateway;
pub use memory::InMemoryGateway;

/// Stable key correlating a local machine with its remote record (the
/// user's email).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowIdentity(pub String);

impl FlowIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowIdentity {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

/// Authoritative flow state as held by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFlowState {
    #[serde(rename = "current_state")]
    pub state_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RemoteFlowState {
    pub fn new(state_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            state_name: state_name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub require_second_factor: bool,
}

/// Failure of a single remote call. The message is meant for users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("{reason}")]
    Rejected { reason: String },
    #[error("{reason}")]
    NotFound { reason: String },
    #[error("Remote service unavailable: {reason}")]
    Unavailable { reason: String },
}

impl GatewayError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        GatewayError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        GatewayError::NotFound {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Remote authentication and workflow-state operations.
///
/// Implementations make exactly one attempt per call. Retrying, if wanted,
/// is the implementation's own business.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FlowGateway: Send + Sync {
    async fn register(&self, email: &str, password: &str, username: &str) -> Result<(), GatewayError>;

    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, GatewayError>;

    async fn submit_second_factor(&self, code: &str) -> Result<(), GatewayError>;

    async fn verify_email(&self, token: &str) -> Result<(), GatewayError>;

    async fn fetch_flow_state(&self, identity: &FlowIdentity) -> Result<RemoteFlowState, GatewayError>;

    /// Overwrite the remote record; returns the stored state
    async fn report_flow_state(
        &self,
        identity: &FlowIdentity,
        state_name: &str,
        data: serde_json::Value,
    ) -> Result<RemoteFlowState, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_state_uses_service_field_names() {
        let state: RemoteFlowState =
            serde_json::from_str(r#"{"current_state": "login", "data": {"step": 2}}"#).unwrap();
        assert_eq!(state.state_name, "login");
        assert_eq!(state.data["step"], 2);

        let missing_data: RemoteFlowState =
            serde_json::from_str(r#"{"current_state": "initial"}"#).unwrap();
        assert!(missing_data.data.is_null());

        let json = serde_json::to_value(RemoteFlowState::new("completed", serde_json::json!({}))).unwrap();
        assert_eq!(json["current_state"], "completed");
    }

    #[test]
    fn test_gateway_error_messages_are_human_readable() {
        assert_eq!(GatewayError::rejected("Invalid credentials").to_string(), "Invalid credentials");
        assert_eq!(
            GatewayError::unavailable("connection refused").to_string(),
            "Remote service unavailable: connection refused"
        );
    }

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let identity = FlowIdentity::from("ada@example.com");
        assert_eq!(serde_json::to_string(&identity).unwrap(), "\"ada@example.com\"");
        assert_eq!(identity.to_string(), "ada@example.com");
    }
}
