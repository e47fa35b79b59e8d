// Generic, data-driven state machines
//
// A `StateGraph` is the static definition of a flow; a `Machine` is one
// running instance of it. Flow kinds differ only in the graph value they
// build, never in interpreter code.

pub mod graph;
pub mod interpreter;
pub mod types;

pub use graph::{MalformedGraph, StateGraph, StateGraphBuilder};
pub use interpreter::{Machine, SubscriptionId};
pub use types::{Event, NoMatchingTransition, Tag, Transition, TransitionOutcome};
