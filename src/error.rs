// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Verification failure raised while matching two candidate interfaces into a
/// [`crate::model::Link`]. Each variant renders the exact message text the CSV
/// exporter later tokenizes positionally, so the `Display` impl is load-bearing,
/// not cosmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("{0}")]
    Unparsable(String),
    #[error("{0}")]
    Loop(String),
    #[error("{0}")]
    MismatchInterface(String),
    #[error("{0}")]
    MismatchNode(String),
}

impl VerificationError {
    /// The full rendered message, as stored in the accumulated error set.
    pub fn message(&self) -> &str {
        match self {
            VerificationError::Unparsable(m)
            | VerificationError::Loop(m)
            | VerificationError::MismatchInterface(m)
            | VerificationError::MismatchNode(m) => m,
        }
    }
}

/// Fatal configuration problems, raised only at backend construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration field: {0}")]
    MissingField(&'static str),
    #[error("no datasources configured")]
    NoDatasources,
}

/// Malformed request parameters (§6, §7 "ValidationFailure"). The HTTP shell
/// that turns these into a 400 response is out of scope for this crate; only
/// the bound-checking logic itself lives here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("node list exceeds {max} characters ({actual} given)")]
    NodeListTooLong { max: usize, actual: usize },
    #[error("node list has {actual} entries, more than the {max} allowed")]
    TooManyNodes { max: usize, actual: usize },
    #[error("node name token {0:?} contains characters outside [A-Za-z0-9_ -]")]
    InvalidNodeToken(String),
    #[error("time span of {actual_days} days exceeds the {max_days}-day maximum")]
    SpanTooLong { max_days: i64, actual_days: i64 },
}
