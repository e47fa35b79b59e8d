// State graph definitions for the built-in flow kinds

use crate::flow_tags;
use crate::machine::{MalformedGraph, StateGraph, Tag};

flow_tags! {
    /// Login flow states
    pub enum LoginState {
        Idle => "idle",
        FormInput => "formInput",
        Validating => "validating",
        Authenticating => "authenticating",
        MfaRequired => "mfaRequired",
        /// Terminal
        Success => "success",
    }
}

flow_tags! {
    pub enum LoginEvent {
        OpenForm => "OPEN_FORM",
        SubmitForm => "SUBMIT_FORM",
        ValidationSuccess => "VALIDATION_SUCCESS",
        ValidationFailed => "VALIDATION_FAILED",
        AuthSuccess => "AUTH_SUCCESS",
        AuthFailed => "AUTH_FAILED",
        RequireMfa => "REQUIRE_MFA",
        SubmitMfa => "SUBMIT_MFA",
    }
}

flow_tags! {
    /// Registration flow states
    pub enum RegistrationState {
        Idle => "idle",
        FormInput => "formInput",
        Validating => "validating",
        Submitting => "submitting",
        EmailVerification => "emailVerification",
        /// Terminal
        Completed => "completed",
    }
}

flow_tags! {
    pub enum RegistrationEvent {
        OpenForm => "OPEN_FORM",
        SubmitForm => "SUBMIT_FORM",
        ValidationSuccess => "VALIDATION_SUCCESS",
        ValidationFailed => "VALIDATION_FAILED",
        RegistrationSuccess => "REGISTRATION_SUCCESS",
        ApiError => "API_ERROR",
        VerifyEmailSuccess => "VERIFY_EMAIL_SUCCESS",
        VerifyEmailFailed => "VERIFY_EMAIL_FAILED",
    }
}

flow_tags! {
    /// Account workflow states, mirrored by the remote service
    pub enum WorkflowState {
        Initial => "initial",
        Registration => "registration",
        Login => "login",
        /// Terminal
        Completed => "completed",
        Error => "error",
    }
}

flow_tags! {
    pub enum WorkflowEvent {
        StartRegistration => "START_REGISTRATION",
        StartLogin => "START_LOGIN",
        RegistrationSuccess => "REGISTRATION_SUCCESS",
        RegistrationError => "REGISTRATION_ERROR",
        LoginSuccess => "LOGIN_SUCCESS",
        LoginError => "LOGIN_ERROR",
        Retry => "RETRY",
        // Named after their target state; used to force the local machine
        // onto the remote side's state.
        Initial => "INITIAL",
        Registration => "REGISTRATION",
        Login => "LOGIN",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

pub fn login() -> Result<StateGraph<LoginState, LoginEvent>, MalformedGraph> {
    use LoginEvent as E;
    use LoginState as S;

    StateGraph::builder("login")
        .states(S::ALL.iter().copied())
        .initial(S::Idle)
        .terminal(S::Success)
        .on(S::Idle, E::OpenForm, S::FormInput)
        .on(S::FormInput, E::SubmitForm, S::Validating)
        .on(S::Validating, E::ValidationSuccess, S::Authenticating)
        .on(S::Validating, E::ValidationFailed, S::FormInput)
        .on(S::Authenticating, E::AuthSuccess, S::Success)
        .on(S::Authenticating, E::AuthFailed, S::FormInput)
        .on(S::Authenticating, E::RequireMfa, S::MfaRequired)
        .on(S::MfaRequired, E::SubmitMfa, S::Authenticating)
        .build()
}

pub fn registration() -> Result<StateGraph<RegistrationState, RegistrationEvent>, MalformedGraph> {
    use RegistrationEvent as E;
    use RegistrationState as S;

    StateGraph::builder("registration")
        .states(S::ALL.iter().copied())
        .initial(S::Idle)
        .terminal(S::Completed)
        .on(S::Idle, E::OpenForm, S::FormInput)
        .on(S::FormInput, E::SubmitForm, S::Validating)
        .on(S::Validating, E::ValidationSuccess, S::Submitting)
        .on(S::Validating, E::ValidationFailed, S::FormInput)
        .on(S::Submitting, E::RegistrationSuccess, S::EmailVerification)
        .on(S::Submitting, E::ApiError, S::FormInput)
        .on(S::EmailVerification, E::VerifyEmailSuccess, S::Completed)
        // A failed verification restarts the whole form
        .on(S::EmailVerification, E::VerifyEmailFailed, S::FormInput)
        .build()
}

pub fn workflow() -> Result<StateGraph<WorkflowState, WorkflowEvent>, MalformedGraph> {
    use WorkflowEvent as E;
    use WorkflowState as S;

    let mut builder = StateGraph::builder("workflow")
        .states(S::ALL.iter().copied())
        .initial(S::Initial)
        .terminal(S::Completed)
        .on(S::Initial, E::StartRegistration, S::Registration)
        .on(S::Initial, E::StartLogin, S::Login)
        .on(S::Registration, E::RegistrationSuccess, S::Completed)
        .on(S::Registration, E::RegistrationError, S::Error)
        .on(S::Login, E::LoginSuccess, S::Completed)
        .on(S::Login, E::LoginError, S::Error)
        .on(S::Error, E::Retry, S::Initial);

    for &from in S::ALL.iter().filter(|s| **s != S::Completed) {
        for &to in S::ALL.iter().filter(|s| **s != from) {
            builder = builder.on(from, entering(to), to);
        }
    }

    builder.build()
}

/// The workflow event named after `state`
pub fn entering(state: WorkflowState) -> WorkflowEvent {
    match state {
        WorkflowState::Initial => WorkflowEvent::Initial,
        WorkflowState::Registration => WorkflowEvent::Registration,
        WorkflowState::Login => WorkflowEvent::Login,
        WorkflowState::Completed => WorkflowEvent::Completed,
        WorkflowState::Error => WorkflowEvent::Error,
    }
}
