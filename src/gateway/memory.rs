// In-process reference gateway mirroring the remote auth/workflow service

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{FlowGateway, FlowIdentity, GatewayError, LoginResponse, RemoteFlowState};

/// State assigned to a freshly registered user's workflow record
pub const INITIAL_FLOW_STATE: &str = "initial";

#[derive(Debug, Clone)]
struct UserRecord {
    username: Option<String>,
    password: String,
    second_factor: Option<String>,
    verified: bool,
}

#[derive(Debug, Default)]
struct Store {
    users: HashMap<String, UserRecord>,
    flow_states: HashMap<FlowIdentity, RemoteFlowState>,
    verification_tokens: HashMap<String, String>,
    pending_second_factor: Option<String>,
    unavailable: bool,
}

/// Keeps users and workflow records in memory.
///
/// Passwords are stored and compared as given.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    store: Mutex<Store>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a verified user without a second factor
    pub fn with_user(self, email: &str, password: &str) -> Self {
        self.insert_user(email, password, None);
        self
    }

    /// Seed a verified user whose login requires `code` as second factor
    pub fn with_second_factor_user(self, email: &str, password: &str, code: &str) -> Self {
        self.insert_user(email, password, Some(code.to_string()));
        self
    }

    pub fn with_flow_state(self, identity: &str, state_name: &str, data: serde_json::Value) -> Self {
        self.store()
            .flow_states
            .insert(FlowIdentity::new(identity), RemoteFlowState::new(state_name, data));
        self
    }

    /// Make every call fail as if the service could not be reached
    pub fn set_unavailable(&self, unavailable: bool) {
        self.store().unavailable = unavailable;
    }

    pub fn flow_state(&self, identity: &FlowIdentity) -> Option<RemoteFlowState> {
        self.store().flow_states.get(identity).cloned()
    }

    /// Token that would have been mailed to `email` after registration
    pub fn pending_verification_token(&self, email: &str) -> Option<String> {
        self.store()
            .verification_tokens
            .iter()
            .find(|(_, owner)| owner.as_str() == email)
            .map(|(token, _)| token.clone())
    }

    pub fn is_verified(&self, email: &str) -> bool {
        self.store().users.get(email).is_some_and(|user| user.verified)
    }

    pub fn username(&self, email: &str) -> Option<String> {
        self.store().users.get(email).and_then(|user| user.username.clone())
    }

    fn insert_user(&self, email: &str, password: &str, second_factor: Option<String>) {
        self.store().users.insert(
            email.to_string(),
            UserRecord {
                username: None,
                password: password.to_string(),
                second_factor,
                verified: true,
            },
        );
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, Store>, GatewayError> {
        let store = self.store();
        if store.unavailable {
            return Err(GatewayError::unavailable("connection refused"));
        }
        Ok(store)
    }
}

#[async_trait]
impl FlowGateway for InMemoryGateway {
    async fn register(&self, email: &str, password: &str, username: &str) -> Result<(), GatewayError> {
        let mut store = self.available()?;
        if store.users.contains_key(email) {
            return Err(GatewayError::rejected("Email already registered"));
        }

        store.users.insert(
            email.to_string(),
            UserRecord {
                username: Some(username.to_string()),
                password: password.to_string(),
                second_factor: None,
                verified: false,
            },
        );
        store.flow_states.insert(
            FlowIdentity::new(email),
            RemoteFlowState::new(INITIAL_FLOW_STATE, serde_json::json!({})),
        );
        let token = uuid::Uuid::new_v4().to_string();
        store.verification_tokens.insert(token, email.to_string());

        debug!(email = %email, "Registered user");
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, GatewayError> {
        let mut store = self.available()?;
        let user = match store.users.get(email) {
            Some(user) if user.password == password => user.clone(),
            _ => return Err(GatewayError::rejected("Invalid credentials")),
        };

        store.pending_second_factor = user.second_factor.clone();
        Ok(LoginResponse {
            require_second_factor: user.second_factor.is_some(),
        })
    }

    async fn submit_second_factor(&self, code: &str) -> Result<(), GatewayError> {
        let mut store = self.available()?;
        match store.pending_second_factor.as_deref() {
            None => Err(GatewayError::rejected("No second factor challenge pending")),
            Some(expected) if expected == code => {
                store.pending_second_factor = None;
                Ok(())
            }
            Some(_) => Err(GatewayError::rejected("Invalid MFA code")),
        }
    }

    async fn verify_email(&self, token: &str) -> Result<(), GatewayError> {
        let mut store = self.available()?;
        let email = store
            .verification_tokens
            .remove(token)
            .ok_or_else(|| GatewayError::rejected("Invalid or expired verification token"))?;
        if let Some(user) = store.users.get_mut(&email) {
            user.verified = true;
        }
        Ok(())
    }

    async fn fetch_flow_state(&self, identity: &FlowIdentity) -> Result<RemoteFlowState, GatewayError> {
        self.available()?
            .flow_states
            .get(identity)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("User workflow state not found"))
    }

    async fn report_flow_state(
        &self,
        identity: &FlowIdentity,
        state_name: &str,
        data: serde_json::Value,
    ) -> Result<RemoteFlowState, GatewayError> {
        let mut store = self.available()?;
        let record = store
            .flow_states
            .get_mut(identity)
            .ok_or_else(|| GatewayError::not_found("User workflow state not found"))?;

        let data = if data.is_null() { serde_json::json!({}) } else { data };
        *record = RemoteFlowState::new(state_name, data);
        Ok(record.clone())
    }
}
