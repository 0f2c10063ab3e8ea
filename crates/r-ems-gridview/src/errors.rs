//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::Scope;

pub type Result<T> = std::result::Result<T, GridViewError>;

/// Which upstream feed produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Topology,
    Telemetry,
    Status,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Topology => "topology",
            SourceKind::Telemetry => "telemetry",
            SourceKind::Status => "status",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line whose endpoint is absent from the node set it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub line_id: String,
    pub missing_node_id: String,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {} references unknown node {}",
            self.line_id, self.missing_node_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridViewError {
    /// Network, HTTP, or decoding failure from one of the feeds. Retried on the next tick.
    #[error("{feed} source unavailable: {message}")]
    SourceUnavailable { feed: SourceKind, message: String },
    /// Dangling line reference. The line is dropped from the snapshot.
    #[error("integrity violation: {0}")]
    IntegrityViolation(IntegrityViolation),
    /// Response issued for a scope that is no longer active.
    #[error("response for scope {received} discarded; active scope is {active}")]
    ScopeMismatch { received: Scope, active: Scope },
}

impl GridViewError {
    pub fn unavailable(feed: SourceKind, message: impl Into<String>) -> Self {
        GridViewError::SourceUnavailable {
            feed,
            message: message.into(),
        }
    }

    /// Scope mismatches are internal bookkeeping and never reach the status surface.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, GridViewError::ScopeMismatch { .. })
    }
}

impl From<IntegrityViolation> for GridViewError {
    fn from(value: IntegrityViolation) -> Self {
        GridViewError::IntegrityViolation(value)
    }
}
