// User-facing flows: graph definitions and the controllers that drive them

pub mod graphs;
pub mod login;
pub mod registration;
pub mod validation;

use crate::machine::{Machine, Tag, TransitionOutcome};

pub use graphs::{
    LoginEvent, LoginState, RegistrationEvent, RegistrationState, WorkflowEvent, WorkflowState,
};
pub use login::{Credentials, LoginContext, LoginController};
pub use registration::{RegistrationContext, RegistrationController, RegistrationForm};
pub use validation::ValidationError;

/// Result of one controller step.
///
/// Nothing a user can do to a flow is an `Err`: bad input, remote failures
/// and out-of-order steps are all ordinary outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<S, E> {
    /// The step completed; the flow is now in `state`
    Advanced { state: S },
    /// Local validation failed; the gateway was not called
    Invalid { error: ValidationError, state: S },
    /// The gateway failed; the failure event was applied and `reason` is in
    /// the flow context
    Failed { reason: String, state: S },
    /// The step is not legal from `state`
    OutOfSequence { state: S, event: E },
}

impl<S: Tag, E: Tag> StepOutcome<S, E> {
    pub fn state(&self) -> S {
        match self {
            StepOutcome::Advanced { state }
            | StepOutcome::Invalid { state, .. }
            | StepOutcome::Failed { state, .. }
            | StepOutcome::OutOfSequence { state, .. } => *state,
        }
    }
}

/// Send `event`, turning a rejection into an out-of-sequence outcome
fn advance<S: Tag, E: Tag, C>(machine: &mut Machine<S, E, C>, event: E) -> Result<S, StepOutcome<S, E>> {
    match machine.send(event) {
        TransitionOutcome::Transitioned(transition) => Ok(transition.to),
        TransitionOutcome::Rejected { state, event } => Err(StepOutcome::OutOfSequence { state, event }),
    }
}
