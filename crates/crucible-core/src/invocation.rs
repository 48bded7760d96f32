//! Invocation requests and their validation
//!
//! Validation is pure and runs before any sandbox resource is allocated.
//! All violated fields are collected, not just the first, so a client gets
//! the full picture in one round trip.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::HashSet;
use std::fmt;

/// Inclusive bounds on the per-invocation timeout, in seconds.
pub const TIMEOUT_RANGE: (i64, i64) = (1, 60);

const fn default_timeout() -> i64 {
    TIMEOUT_RANGE.1
}

/// An invocation request as it travels the wire, before validation.
///
/// Unknown fields are a decode failure, as is a missing required field;
/// only `timeout` may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawInvocation {
    pub language: String,
    pub code: ByteBuf,
    pub input: ByteBuf,
    pub arguments: Vec<ByteBuf>,
    pub options: Vec<ByteBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
}

/// A single violated field, with the element index where one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub index: Option<usize>,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]: {}", self.field, i, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A validated invocation, immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub language: String,
    pub code: Vec<u8>,
    pub input: Vec<u8>,
    pub arguments: Vec<Vec<u8>>,
    pub options: Vec<Vec<u8>>,
    pub timeout: u32,
}

impl Invocation {
    /// `arguments` serialized for the backend: each element NUL-terminated.
    #[must_use]
    pub fn arguments_payload(&self) -> Vec<u8> {
        null_joined(&self.arguments)
    }

    /// `options` serialized for the backend: each element NUL-terminated.
    #[must_use]
    pub fn options_payload(&self) -> Vec<u8> {
        null_joined(&self.options)
    }
}

fn null_joined(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(items.iter().map(|i| i.len() + 1).sum());
    for item in items {
        buf.extend_from_slice(item);
        buf.push(0);
    }
    buf
}

impl RawInvocation {
    /// Check every field against the known-runner set and the protocol
    /// limits, returning either the validated invocation or the complete
    /// list of violations.
    pub fn validate(self, languages: &HashSet<String>) -> Result<Invocation, Vec<FieldError>> {
        let mut errors = Vec::new();

        if !languages.contains(&self.language) {
            errors.push(FieldError {
                field: "language",
                index: None,
                message: format!("no such language: {}", self.language),
            });
        }

        if self.timeout < TIMEOUT_RANGE.0 || self.timeout > TIMEOUT_RANGE.1 {
            errors.push(FieldError {
                field: "timeout",
                index: None,
                message: format!(
                    "timeout not in range {}-{}: {}",
                    TIMEOUT_RANGE.0, TIMEOUT_RANGE.1, self.timeout
                ),
            });
        }

        for (field, items) in [("arguments", &self.arguments), ("options", &self.options)] {
            if let Some(index) = items.iter().position(|item| item.contains(&0)) {
                errors.push(FieldError {
                    field,
                    index: Some(index),
                    message: "argument contains null byte".into(),
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Invocation {
            language: self.language,
            code: self.code.into_vec(),
            input: self.input.into_vec(),
            arguments: self.arguments.into_iter().map(ByteBuf::into_vec).collect(),
            options: self.options.into_iter().map(ByteBuf::into_vec).collect(),
            // range-checked above
            timeout: u32::try_from(self.timeout).unwrap_or(TIMEOUT_RANGE.1 as u32),
        })
    }
}
