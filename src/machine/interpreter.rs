// Event-driven interpreter: one running instance of a StateGraph

use std::sync::Arc;
use tracing::{debug, info};

use super::graph::StateGraph;
use super::types::{Event, Tag, Transition, TransitionOutcome};

/// Handle returned by `Machine::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

type Subscriber<S, E> = Box<dyn FnMut(&Transition<S, E>) + Send>;

/// A running instance of a graph with flow-specific context `C`.
///
/// All state changes go through `send`. Since `send` takes `&mut self`, a
/// transition and its notifications always complete before the next event
/// is looked at, and subscribers (which only see the transition record)
/// cannot re-enter the machine.
pub struct Machine<S, E, C> {
    graph: Arc<StateGraph<S, E>>,
    current: S,
    context: C,
    subscribers: Vec<(SubscriptionId, Subscriber<S, E>)>,
    next_subscription: u64,
    history: Vec<Transition<S, E>>,
}

impl<S, E, C> std::fmt::Debug for Machine<S, E, C>
where
    S: Tag,
    E: Tag,
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("graph", &self.graph.name())
            .field("current", &self.current)
            .field("context", &self.context)
            .field("subscribers", &self.subscribers.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl<S: Tag, E: Tag, C> Machine<S, E, C> {
    pub fn new(graph: Arc<StateGraph<S, E>>, context: C) -> Self {
        let current = graph.initial();
        Self {
            graph,
            current,
            context,
            subscribers: Vec::new(),
            next_subscription: 0,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.graph.is_terminal(self.current)
    }

    pub fn graph(&self) -> &Arc<StateGraph<S, E>> {
        &self.graph
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Every transition taken so far, oldest first
    pub fn history(&self) -> &[Transition<S, E>] {
        &self.history
    }

    /// Register a callback run after every successful transition, in
    /// subscription order.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Transition<S, E>) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    pub fn send(&mut self, event: impl Into<Event<E>>) -> TransitionOutcome<S, E> {
        let event = event.into();
        let from = self.current;

        let Some(to) = self.graph.transition(from, event.kind) else {
            debug!(
                graph = %self.graph.name(),
                state = %from,
                event = %event.kind,
                "Event rejected: no matching transition"
            );
            return TransitionOutcome::Rejected {
                state: from,
                event: event.kind,
            };
        };

        self.current = to;
        let transition = Transition {
            from,
            to,
            event: event.kind,
            payload: event.payload,
            at: chrono::Utc::now(),
        };
        self.history.push(transition.clone());

        info!(
            graph = %self.graph.name(),
            from = %from,
            to = %to,
            event = %transition.event,
            "State transition"
        );

        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(&transition);
        }

        TransitionOutcome::Transitioned(transition)
    }
}
