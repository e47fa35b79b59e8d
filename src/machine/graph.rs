// Declarative state graphs, validated once at construction

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

use super::types::{NoMatchingTransition, Tag};

/// Construction-time violations of a graph's structural invariants.
///
/// Any of these is fatal: a flow must not run on a malformed graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedGraph {
    #[error("graph `{graph}` has no initial state")]
    MissingInitial { graph: String },
    #[error("graph `{graph}`: initial state `{state}` is not declared")]
    UndeclaredInitial { graph: String, state: &'static str },
    #[error("graph `{graph}`: terminal state `{state}` is not declared")]
    UndeclaredTerminal { graph: String, state: &'static str },
    #[error("graph `{graph}`: transition {from} --{event}--> {to} references undeclared state `{missing}`")]
    DanglingTransition {
        graph: String,
        from: &'static str,
        event: &'static str,
        to: &'static str,
        missing: &'static str,
    },
    #[error("graph `{graph}`: {from} --{event}--> declared twice ({first} and {second})")]
    DuplicateTransition {
        graph: String,
        from: &'static str,
        event: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("graph `{graph}`: terminal state `{state}` has outgoing transition on {event}")]
    TerminalHasExit {
        graph: String,
        state: &'static str,
        event: &'static str,
    },
    #[error("graph `{graph}`: state `{state}` is not terminal but has no outgoing transition")]
    DeadEnd { graph: String, state: &'static str },
    #[error("graph `{graph}`: state `{state}` is unreachable from the initial state")]
    Unreachable { graph: String, state: &'static str },
    #[error("graph `{graph}`: no terminal state is reachable from `{state}`")]
    NoPathToTerminal { graph: String, state: &'static str },
}

/// Immutable description of one flow kind's states and legal transitions.
#[derive(Debug, Clone)]
pub struct StateGraph<S, E> {
    name: String,
    states: BTreeSet<S>,
    initial: S,
    terminals: BTreeSet<S>,
    transitions: BTreeMap<(S, E), S>,
}

impl<S: Tag, E: Tag> StateGraph<S, E> {
    pub fn builder(name: impl Into<String>) -> StateGraphBuilder<S, E> {
        StateGraphBuilder {
            name: name.into(),
            states: BTreeSet::new(),
            initial: None,
            terminals: BTreeSet::new(),
            transitions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.states.iter().copied()
    }

    pub fn terminals(&self) -> impl Iterator<Item = S> + '_ {
        self.terminals.iter().copied()
    }

    /// All `(from, event, to)` entries, ordered by source state then event
    pub fn transitions(&self) -> impl Iterator<Item = (S, E, S)> + '_ {
        self.transitions
            .iter()
            .map(|(&(from, event), &to)| (from, event, to))
    }

    pub fn events_from(&self, state: S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(from, _)| *from == state)
            .map(|&(_, event)| event)
            .collect()
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminals.contains(&state)
    }

    pub fn transition(&self, state: S, event: E) -> Option<S> {
        self.transitions.get(&(state, event)).copied()
    }

    pub fn try_transition(&self, state: S, event: E) -> Result<S, NoMatchingTransition> {
        self.transition(state, event).ok_or(NoMatchingTransition {
            state: state.name(),
            event: event.name(),
        })
    }
}

/// Collects declarations; `build` runs every structural check.
#[derive(Debug, Clone)]
pub struct StateGraphBuilder<S, E> {
    name: String,
    states: BTreeSet<S>,
    initial: Option<S>,
    terminals: BTreeSet<S>,
    transitions: Vec<(S, E, S)>,
}

impl<S: Tag, E: Tag> StateGraphBuilder<S, E> {
    pub fn state(mut self, state: S) -> Self {
        self.states.insert(state);
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.states.extend(states);
        self
    }

    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn terminal(mut self, state: S) -> Self {
        self.terminals.insert(state);
        self
    }

    pub fn on(mut self, from: S, event: E, to: S) -> Self {
        self.transitions.push((from, event, to));
        self
    }

    pub fn build(self) -> Result<StateGraph<S, E>, MalformedGraph> {
        let graph = self.name;

        let initial = self.initial.ok_or_else(|| MalformedGraph::MissingInitial {
            graph: graph.clone(),
        })?;
        if !self.states.contains(&initial) {
            return Err(MalformedGraph::UndeclaredInitial {
                graph,
                state: initial.name(),
            });
        }
        if let Some(state) = self.terminals.iter().find(|s| !self.states.contains(*s)) {
            return Err(MalformedGraph::UndeclaredTerminal {
                graph,
                state: state.name(),
            });
        }

        let mut transitions = BTreeMap::new();
        for (from, event, to) in self.transitions {
            if let Some(missing) = [from, to].into_iter().find(|s| !self.states.contains(s)) {
                return Err(MalformedGraph::DanglingTransition {
                    graph,
                    from: from.name(),
                    event: event.name(),
                    to: to.name(),
                    missing: missing.name(),
                });
            }
            if self.terminals.contains(&from) {
                return Err(MalformedGraph::TerminalHasExit {
                    graph,
                    state: from.name(),
                    event: event.name(),
                });
            }
            if let Some(first) = transitions.insert((from, event), to) {
                if first != to {
                    return Err(MalformedGraph::DuplicateTransition {
                        graph,
                        from: from.name(),
                        event: event.name(),
                        first: first.name(),
                        second: to.name(),
                    });
                }
            }
        }

        let mut successors: BTreeMap<S, BTreeSet<S>> = BTreeMap::new();
        for (&(from, _), &to) in &transitions {
            successors.entry(from).or_default().insert(to);
        }

        for state in &self.states {
            if !self.terminals.contains(state) && !successors.contains_key(state) {
                return Err(MalformedGraph::DeadEnd {
                    graph,
                    state: state.name(),
                });
            }
        }

        let reachable = reachable_from(initial, &successors);
        if let Some(state) = self.states.iter().find(|s| !reachable.contains(*s)) {
            return Err(MalformedGraph::Unreachable {
                graph,
                state: state.name(),
            });
        }

        for state in self.states.iter().filter(|s| !self.terminals.contains(*s)) {
            let ahead = reachable_from(*state, &successors);
            if !ahead.iter().any(|s| self.terminals.contains(s)) {
                return Err(MalformedGraph::NoPathToTerminal {
                    graph,
                    state: state.name(),
                });
            }
        }

        Ok(StateGraph {
            name: graph,
            states: self.states,
            initial,
            terminals: self.terminals,
            transitions,
        })
    }
}

fn reachable_from<S: Tag>(start: S, successors: &BTreeMap<S, BTreeSet<S>>) -> BTreeSet<S> {
    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(state) = queue.pop_front() {
        for next in successors.get(&state).into_iter().flatten() {
            if seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::flow_tags! {
        enum Door {
            Closed => "closed",
            Open => "open",
            Locked => "locked",
            Gone => "gone",
        }
    }

    crate::flow_tags! {
        enum Push {
            Open => "OPEN",
            Close => "CLOSE",
            Lock => "LOCK",
            Remove => "REMOVE",
        }
    }

    fn door() -> StateGraphBuilder<Door, Push> {
        StateGraph::builder("door")
            .states([Door::Closed, Door::Open, Door::Gone])
            .initial(Door::Closed)
            .terminal(Door::Gone)
            .on(Door::Closed, Push::Open, Door::Open)
            .on(Door::Open, Push::Close, Door::Closed)
            .on(Door::Open, Push::Remove, Door::Gone)
    }

    #[test]
    fn test_valid_graph_lookups() {
        let graph = door().build().unwrap();

        assert_eq!(graph.name(), "door");
        assert_eq!(graph.initial(), Door::Closed);
        assert_eq!(graph.transition(Door::Closed, Push::Open), Some(Door::Open));
        assert_eq!(graph.transition(Door::Closed, Push::Close), None);
        assert!(graph.is_terminal(Door::Gone));
        assert!(!graph.is_terminal(Door::Open));
        assert_eq!(graph.events_from(Door::Open), vec![Push::Close, Push::Remove]);
        assert_eq!(graph.transitions().count(), 3);

        let miss = graph.try_transition(Door::Gone, Push::Open).unwrap_err();
        assert_eq!(miss.state, "gone");
        assert_eq!(miss.event, "OPEN");
    }

    #[test]
    fn test_dangling_target_is_malformed() {
        let err = door().on(Door::Closed, Push::Lock, Door::Locked).build().unwrap_err();
        assert!(matches!(
            err,
            MalformedGraph::DanglingTransition { missing: "locked", .. }
        ));
    }

    #[test]
    fn test_missing_and_undeclared_initial() {
        let err = StateGraph::<Door, Push>::builder("empty").build().unwrap_err();
        assert!(matches!(err, MalformedGraph::MissingInitial { .. }));

        let err = door().initial(Door::Locked).build().unwrap_err();
        assert!(matches!(err, MalformedGraph::UndeclaredInitial { state: "locked", .. }));
    }

    #[test]
    fn test_undeclared_terminal() {
        let err = door().terminal(Door::Locked).build().unwrap_err();
        assert!(matches!(err, MalformedGraph::UndeclaredTerminal { state: "locked", .. }));
    }

    #[test]
    fn test_conflicting_duplicate_transition() {
        let err = door().on(Door::Closed, Push::Open, Door::Gone).build().unwrap_err();
        assert!(matches!(err, MalformedGraph::DuplicateTransition { from: "closed", .. }));

        // Repeating an identical entry is harmless
        assert!(door().on(Door::Closed, Push::Open, Door::Open).build().is_ok());
    }

    #[test]
    fn test_terminal_with_exit() {
        let err = door().on(Door::Gone, Push::Open, Door::Open).build().unwrap_err();
        assert!(matches!(err, MalformedGraph::TerminalHasExit { state: "gone", .. }));
    }

    #[test]
    fn test_dead_end_state() {
        let err = door()
            .state(Door::Locked)
            .on(Door::Closed, Push::Lock, Door::Locked)
            .build()
            .unwrap_err();
        assert!(matches!(err, MalformedGraph::DeadEnd { state: "locked", .. }));
    }

    #[test]
    fn test_unreachable_state() {
        let err = door()
            .state(Door::Locked)
            .on(Door::Locked, Push::Open, Door::Open)
            .build()
            .unwrap_err();
        assert!(matches!(err, MalformedGraph::Unreachable { state: "locked", .. }));
    }

    #[test]
    fn test_trap_cycle_without_terminal() {
        let err = StateGraph::builder("trap")
            .states([Door::Closed, Door::Open, Door::Locked, Door::Gone])
            .initial(Door::Closed)
            .terminal(Door::Gone)
            .on(Door::Closed, Push::Remove, Door::Gone)
            .on(Door::Closed, Push::Lock, Door::Locked)
            .on(Door::Locked, Push::Open, Door::Open)
            .on(Door::Open, Push::Lock, Door::Locked)
            .build()
            .unwrap_err();
        assert!(matches!(err, MalformedGraph::NoPathToTerminal { .. }));
    }
}
