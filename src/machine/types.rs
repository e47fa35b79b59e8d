// Core types shared by graphs and the interpreter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use thiserror::Error;

/// A closed set of named tags: the states or event kinds of one flow.
///
/// The name is the stable wire form used when talking to the remote side
/// and in logs.
pub trait Tag: Copy + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static {
    /// Every member, in declaration order
    const ALL: &'static [Self];

    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.name() == name)
    }

    /// Case-insensitive lookup, used to map a state name onto the event
    /// kind named after it (`completed` -> `COMPLETED`).
    fn from_name_ignore_case(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.name().eq_ignore_ascii_case(name))
    }
}

/// Declares a `Tag` enum together with its wire names.
#[macro_export]
macro_rules! flow_tags {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant ),+
        }

        impl $crate::machine::Tag for $name {
            const ALL: &'static [Self] = &[$( Self::$variant ),+];

            fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::machine::Tag::name(self))
            }
        }
    };
}

/// An event sent to a machine: a kind plus optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<E> {
    pub kind: E,
    pub payload: Option<serde_json::Value>,
}

impl<E: Tag> Event<E> {
    pub fn new(kind: E) -> Self {
        Self { kind, payload: None }
    }

    pub fn with_payload(kind: E, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload: Some(payload),
        }
    }
}

impl<E: Tag> From<E> for Event<E> {
    fn from(kind: E) -> Self {
        Self::new(kind)
    }
}

/// A completed state change, handed to subscribers and kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
    pub payload: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Result of `Machine::send`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<S, E> {
    Transitioned(Transition<S, E>),
    /// No transition for `event` out of `state`; nothing changed
    Rejected { state: S, event: E },
}

impl<S: Tag, E: Tag> TransitionOutcome<S, E> {
    pub fn is_transitioned(&self) -> bool {
        matches!(self, TransitionOutcome::Transitioned(_))
    }

    /// State the machine is in after the send
    pub fn state(&self) -> S {
        match self {
            TransitionOutcome::Transitioned(transition) => transition.to,
            TransitionOutcome::Rejected { state, .. } => *state,
        }
    }

    pub fn into_result(self) -> Result<Transition<S, E>, NoMatchingTransition> {
        match self {
            TransitionOutcome::Transitioned(transition) => Ok(transition),
            TransitionOutcome::Rejected { state, event } => Err(NoMatchingTransition {
                state: state.name(),
                event: event.name(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition for event {event} from state {state}")]
pub struct NoMatchingTransition {
    pub state: &'static str,
    pub event: &'static str,
}
