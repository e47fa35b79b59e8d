// Login controller: credentials, optional second factor

use std::sync::Arc;
use tracing::{info, warn, Instrument};

use super::graphs::{self, LoginEvent, LoginState};
use super::validation;
use super::{advance, StepOutcome};
use crate::gateway::{FlowGateway, GatewayError};
use crate::machine::{Machine, MalformedGraph, StateGraph, SubscriptionId, Transition};
use crate::telemetry::{create_flow_span, generate_correlation_id};

type LoginOutcome = StepOutcome<LoginState, LoginEvent>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginContext {
    pub email: String,
    pub password: String,
    pub mfa_code: Option<String>,
    /// Last failure shown to the user
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

pub struct LoginController {
    machine: Machine<LoginState, LoginEvent, LoginContext>,
    gateway: Arc<dyn FlowGateway>,
    trim_whitespace: bool,
}

impl std::fmt::Debug for LoginController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginController")
            .field("machine", &self.machine)
            .field("trim_whitespace", &self.trim_whitespace)
            .finish()
    }
}

impl LoginController {
    pub fn new(gateway: Arc<dyn FlowGateway>) -> Result<Self, MalformedGraph> {
        Ok(Self::with_graph(Arc::new(graphs::login()?), gateway))
    }

    pub fn with_graph(graph: Arc<StateGraph<LoginState, LoginEvent>>, gateway: Arc<dyn FlowGateway>) -> Self {
        Self {
            machine: Machine::new(graph, LoginContext::default()),
            gateway,
            trim_whitespace: true,
        }
    }

    pub fn with_trim_whitespace(mut self, trim: bool) -> Self {
        self.trim_whitespace = trim;
        self
    }

    pub fn state(&self) -> LoginState {
        self.machine.current()
    }

    pub fn context(&self) -> &LoginContext {
        self.machine.context()
    }

    pub fn machine(&self) -> &Machine<LoginState, LoginEvent, LoginContext> {
        &self.machine
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Transition<LoginState, LoginEvent>) + Send + 'static,
    {
        self.machine.subscribe(callback)
    }

    pub fn open_form(&mut self) -> LoginOutcome {
        match advance(&mut self.machine, LoginEvent::OpenForm) {
            Ok(state) => StepOutcome::Advanced { state },
            Err(outcome) => outcome,
        }
    }

    /// Validate and submit credentials; ends in `mfaRequired`, `success`
    /// or back in `formInput`.
    pub async fn submit(&mut self, credentials: Credentials) -> LoginOutcome {
        let span = create_flow_span("login", &credentials.email, &generate_correlation_id());
        match self.run_submit(credentials).instrument(span).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn run_submit(&mut self, credentials: Credentials) -> Result<LoginOutcome, LoginOutcome> {
        advance(&mut self.machine, LoginEvent::SubmitForm)?;

        let context = self.machine.context_mut();
        context.email = credentials.email;
        context.password = credentials.password;
        context.mfa_code = None;
        context.error = None;

        let checked = validation::require(
            &[("email", context.email.as_str()), ("password", context.password.as_str())],
            self.trim_whitespace,
        );
        if let Err(error) = checked {
            context.error = Some(error.to_string());
            let state = advance(&mut self.machine, LoginEvent::ValidationFailed)?;
            return Ok(StepOutcome::Invalid { error, state });
        }

        advance(&mut self.machine, LoginEvent::ValidationSuccess)?;

        let LoginContext { email, password, .. } = self.machine.context().clone();
        match self.gateway.login(&email, &password).await {
            Ok(response) if response.require_second_factor => {
                info!(email = %email, "Second factor required");
                let state = advance(&mut self.machine, LoginEvent::RequireMfa)?;
                Ok(StepOutcome::Advanced { state })
            }
            Ok(_) => {
                info!(email = %email, "Login succeeded");
                let state = advance(&mut self.machine, LoginEvent::AuthSuccess)?;
                Ok(StepOutcome::Advanced { state })
            }
            Err(error) => self.fail(error),
        }
    }

    /// Submit the second-factor code. A rejected code sends the user back
    /// to credential entry, not to another code prompt.
    pub async fn submit_second_factor(&mut self, code: &str) -> LoginOutcome {
        let span = create_flow_span(
            "login.second_factor",
            &self.machine.context().email,
            &generate_correlation_id(),
        );
        match self.run_second_factor(code).instrument(span).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn run_second_factor(&mut self, code: &str) -> Result<LoginOutcome, LoginOutcome> {
        let state = self.state();
        if self.machine.graph().transition(state, LoginEvent::SubmitMfa).is_none() {
            return Err(StepOutcome::OutOfSequence {
                state,
                event: LoginEvent::SubmitMfa,
            });
        }

        let context = self.machine.context_mut();
        context.error = None;
        if let Err(error) = validation::require(&[("MFA code", code)], self.trim_whitespace) {
            context.error = Some(error.to_string());
            return Ok(StepOutcome::Invalid { error, state });
        }
        context.mfa_code = Some(code.to_string());

        advance(&mut self.machine, LoginEvent::SubmitMfa)?;

        match self.gateway.submit_second_factor(code).await {
            Ok(()) => {
                info!("Second factor accepted");
                let state = advance(&mut self.machine, LoginEvent::AuthSuccess)?;
                Ok(StepOutcome::Advanced { state })
            }
            Err(error) => {
                let context = self.machine.context_mut();
                context.password.clear();
                context.mfa_code = None;
                self.fail(error)
            }
        }
    }

    fn fail(&mut self, error: GatewayError) -> Result<LoginOutcome, LoginOutcome> {
        let reason = error.to_string();
        warn!(error = %reason, "Authentication failed");
        self.machine.context_mut().error = Some(reason.clone());
        let state = advance(&mut self.machine, LoginEvent::AuthFailed)?;
        Ok(StepOutcome::Failed { reason, state })
    }
}
