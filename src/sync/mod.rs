//! Local/remote flow state reconciliation
//!
//! The remote service is authoritative. A `ReconciliationService` keeps one
//! local machine for a `FlowIdentity` in line with it: inbound syncs force
//! the local machine onto the remote state, and outbound transitions are
//! reported to the remote before they are applied locally.

pub mod service;

use thiserror::Error;

use crate::gateway::{FlowIdentity, GatewayError, RemoteFlowState};
use crate::machine::TransitionOutcome;

pub use service::ReconciliationService;

/// Context carried by a reconciled machine
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationContext {
    pub identity: FlowIdentity,
    /// Last state confirmed by the remote side
    pub last_remote: Option<RemoteFlowState>,
    /// Reason of the last failed report
    pub error: Option<String>,
}

impl ReconciliationContext {
    pub fn new(identity: FlowIdentity) -> Self {
        Self {
            identity,
            last_remote: None,
            error: None,
        }
    }
}

/// Result of an inbound sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<S, E> {
    /// Local and remote already agree
    InSync { state: S },
    /// The event named after the remote state was sent; the outcome may be
    /// `Rejected` when no edge leads there (for example from a terminal
    /// state)
    Forced(TransitionOutcome<S, E>),
    /// The remote state has no local counterpart; nothing changed
    Unmapped { remote: String, state: S },
    /// The service was stopped or restarted while the fetch was in flight
    Discarded,
}

/// Result of an outbound transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome<S, E> {
    /// The remote accepted the new state and it was applied locally
    Applied(TransitionOutcome<S, E>),
    /// The remote refused; the error event was sent instead
    RemoteFailed {
        reason: String,
        outcome: TransitionOutcome<S, E>,
    },
    /// The service was stopped or restarted while the report was in flight
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("Sync divergence for {identity}: {source}")]
    Divergence {
        identity: FlowIdentity,
        #[source]
        source: GatewayError,
    },

    #[error("Reconciliation for {identity} is not running")]
    NotRunning { identity: FlowIdentity },

    #[error("Reconciliation for {identity} is already running")]
    AlreadyRunning { identity: FlowIdentity },

    #[error("No event is named after state {state}")]
    NoEventForState { state: &'static str },

    #[error("No transition from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
}
