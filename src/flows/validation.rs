// Required-field checks performed before any gateway call

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{} required", describe(.fields))]
    MissingFields { fields: Vec<&'static str> },
}

fn describe(fields: &[&'static str]) -> String {
    match fields {
        [only] => format!("{} is", capitalize(only)),
        [first, second] => format!("{} and {} are", capitalize(first), second),
        [init @ .., last] => format!("{}, and {} are", capitalize(&init.join(", ")), last),
        [] => "Nothing is".to_string(),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Checks that every `(name, value)` pair is non-empty.
///
/// With `trim` set, whitespace-only values count as empty.
pub fn require(fields: &[(&'static str, &str)], trim: bool) -> Result<(), ValidationError> {
    let missing: Vec<&'static str> = fields
        .iter()
        .filter(|(_, value)| if trim { value.trim().is_empty() } else { value.is_empty() })
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingFields { fields: missing })
    }
}
