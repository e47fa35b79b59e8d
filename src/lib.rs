// Flowkeeper Library - FSM-driven login, registration and workflow flows
// This exposes the core components for testing and integration

pub mod config;
pub mod flows;
pub mod gateway;
pub mod machine;
pub mod observability;
pub mod sync;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{config, init_config, FlowkeeperConfig};
pub use flows::{
    Credentials, LoginController, LoginEvent, LoginState, RegistrationController, RegistrationEvent,
    RegistrationForm, RegistrationState, StepOutcome, ValidationError, WorkflowEvent, WorkflowState,
};
pub use gateway::{
    FlowGateway, FlowIdentity, GatewayError, InMemoryGateway, InstrumentedGateway, LoginResponse,
    RemoteFlowState,
};
pub use machine::{
    Event, Machine, MalformedGraph, NoMatchingTransition, StateGraph, SubscriptionId, Tag, Transition,
    TransitionOutcome,
};
pub use observability::{GatewayMetrics, GatewayOperation, GatewayStats, OperationTimer};
pub use sync::{ReconcileError, ReconciliationContext, ReconciliationService, ReportOutcome, SyncOutcome};
pub use telemetry::{create_flow_span, generate_correlation_id, init_telemetry};

#[cfg(any(test, feature = "testing"))]
pub use gateway::MockFlowGateway;
