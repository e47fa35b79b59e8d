// Registration controller: form submission, then email verification

use std::sync::Arc;
use tracing::{info, warn, Instrument};

use super::graphs::{self, RegistrationEvent, RegistrationState};
use super::validation;
use super::{advance, StepOutcome};
use crate::gateway::{FlowGateway, GatewayError};
use crate::machine::{Machine, MalformedGraph, StateGraph, SubscriptionId, Transition};
use crate::telemetry::{create_flow_span, generate_correlation_id};

type RegistrationOutcome = StepOutcome<RegistrationState, RegistrationEvent>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationContext {
    pub email: String,
    pub password: String,
    pub username: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrationForm {
    pub email: String,
    pub password: String,
    pub username: String,
}

impl RegistrationForm {
    pub fn new(email: impl Into<String>, password: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            username: username.into(),
        }
    }
}

pub struct RegistrationController {
    machine: Machine<RegistrationState, RegistrationEvent, RegistrationContext>,
    gateway: Arc<dyn FlowGateway>,
    trim_whitespace: bool,
}

impl std::fmt::Debug for RegistrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationController")
            .field("machine", &self.machine)
            .field("trim_whitespace", &self.trim_whitespace)
            .finish()
    }
}

impl RegistrationController {
    pub fn new(gateway: Arc<dyn FlowGateway>) -> Result<Self, MalformedGraph> {
        Ok(Self::with_graph(Arc::new(graphs::registration()?), gateway))
    }

    pub fn with_graph(
        graph: Arc<StateGraph<RegistrationState, RegistrationEvent>>,
        gateway: Arc<dyn FlowGateway>,
    ) -> Self {
        Self {
            machine: Machine::new(graph, RegistrationContext::default()),
            gateway,
            trim_whitespace: true,
        }
    }

    pub fn with_trim_whitespace(mut self, trim: bool) -> Self {
        self.trim_whitespace = trim;
        self
    }

    pub fn state(&self) -> RegistrationState {
        self.machine.current()
    }

    pub fn context(&self) -> &RegistrationContext {
        self.machine.context()
    }

    pub fn machine(&self) -> &Machine<RegistrationState, RegistrationEvent, RegistrationContext> {
        &self.machine
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Transition<RegistrationState, RegistrationEvent>) + Send + 'static,
    {
        self.machine.subscribe(callback)
    }

    pub fn open_form(&mut self) -> RegistrationOutcome {
        match advance(&mut self.machine, RegistrationEvent::OpenForm) {
            Ok(state) => StepOutcome::Advanced { state },
            Err(outcome) => outcome,
        }
    }

    /// Validate and submit the form; on success the flow waits in
    /// `emailVerification`.
    pub async fn submit(&mut self, form: RegistrationForm) -> RegistrationOutcome {
        let span = create_flow_span("registration", &form.email, &generate_correlation_id());
        match self.run_submit(form).instrument(span).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn run_submit(&mut self, form: RegistrationForm) -> Result<RegistrationOutcome, RegistrationOutcome> {
        advance(&mut self.machine, RegistrationEvent::SubmitForm)?;

        let context = self.machine.context_mut();
        context.email = form.email;
        context.password = form.password;
        context.username = form.username;
        context.error = None;

        let checked = validation::require(
            &[
                ("email", context.email.as_str()),
                ("password", context.password.as_str()),
                ("username", context.username.as_str()),
            ],
            self.trim_whitespace,
        );
        if let Err(error) = checked {
            context.error = Some(error.to_string());
            let state = advance(&mut self.machine, RegistrationEvent::ValidationFailed)?;
            return Ok(StepOutcome::Invalid { error, state });
        }

        advance(&mut self.machine, RegistrationEvent::ValidationSuccess)?;

        let RegistrationContext {
            email,
            password,
            username,
            ..
        } = self.machine.context().clone();
        match self.gateway.register(&email, &password, &username).await {
            Ok(()) => {
                info!(email = %email, username = %username, "Registration accepted");
                let state = advance(&mut self.machine, RegistrationEvent::RegistrationSuccess)?;
                Ok(StepOutcome::Advanced { state })
            }
            Err(error) => self.fail(error, RegistrationEvent::ApiError),
        }
    }

    /// Complete the flow with the token from the verification email.
    ///
    /// A rejected token sends the user back to the form.
    pub async fn verify_email(&mut self, token: &str) -> RegistrationOutcome {
        let span = create_flow_span(
            "registration.verify_email",
            &self.machine.context().email,
            &generate_correlation_id(),
        );
        match self.run_verify_email(token).instrument(span).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn run_verify_email(&mut self, token: &str) -> Result<RegistrationOutcome, RegistrationOutcome> {
        let state = self.state();
        if state != RegistrationState::EmailVerification {
            return Err(StepOutcome::OutOfSequence {
                state,
                event: RegistrationEvent::VerifyEmailSuccess,
            });
        }

        let context = self.machine.context_mut();
        context.error = None;
        if let Err(error) = validation::require(&[("verification token", token)], self.trim_whitespace) {
            context.error = Some(error.to_string());
            return Ok(StepOutcome::Invalid { error, state });
        }

        match self.gateway.verify_email(token).await {
            Ok(()) => {
                info!(email = %self.machine.context().email, "Email verified");
                let state = advance(&mut self.machine, RegistrationEvent::VerifyEmailSuccess)?;
                Ok(StepOutcome::Advanced { state })
            }
            Err(error) => self.fail(error, RegistrationEvent::VerifyEmailFailed),
        }
    }

    fn fail(
        &mut self,
        error: GatewayError,
        event: RegistrationEvent,
    ) -> Result<RegistrationOutcome, RegistrationOutcome> {
        let reason = error.to_string();
        warn!(error = %reason, event = %event, "Registration step failed");
        self.machine.context_mut().error = Some(reason.clone());
        let state = advance(&mut self.machine, event)?;
        Ok(StepOutcome::Failed { reason, state })
    }
}
