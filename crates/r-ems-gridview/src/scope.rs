//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Observation scope selection and the tags used to reject late responses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Subset of the network currently observed. `site == None` selects the whole network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    site: Option<String>,
}

impl Scope {
    pub fn all() -> Self {
        Self { site: None }
    }

    pub fn site(site_id: impl Into<String>) -> Self {
        Self::from_selector(Some(site_id.into()))
    }

    /// Blank selectors collapse to the whole network.
    pub fn from_selector(selector: Option<String>) -> Self {
        let site = selector
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        Self { site }
    }

    pub fn site_id(&self) -> Option<&str> {
        self.site.as_deref()
    }

    pub fn is_all(&self) -> bool {
        self.site.is_none()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site {
            Some(site) => write!(f, "site:{site}"),
            None => f.write_str("all"),
        }
    }
}

/// Identity of one scope activation. Every fetch carries the tag it was issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTag {
    pub scope: Scope,
    pub generation: u64,
}

/// Tracks the active scope and hands out a fresh generation per activation, so that a
/// response issued for `A` is rejected after `A -> B -> A`.
#[derive(Debug, Default)]
pub struct ScopeTracker {
    active: Option<ScopeTag>,
    next_generation: u64,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ScopeTag> {
        self.active.as_ref()
    }

    /// Activate `scope` unless it is already active. Returns the new tag on change.
    pub fn activate(&mut self, scope: Scope) -> Option<ScopeTag> {
        if self.active.as_ref().is_some_and(|tag| tag.scope == scope) {
            return None;
        }
        Some(self.force_activate(scope))
    }

    /// Activate `scope` even when it matches the current one.
    pub fn force_activate(&mut self, scope: Scope) -> ScopeTag {
        self.next_generation += 1;
        let tag = ScopeTag {
            scope,
            generation: self.next_generation,
        };
        self.active = Some(tag.clone());
        tag
    }

    /// Invalidate every outstanding tag without activating anything.
    pub fn deactivate(&mut self) {
        self.active = None;
        self.next_generation += 1;
    }

    pub fn is_current(&self, tag: &ScopeTag) -> bool {
        self.active.as_ref() == Some(tag)
    }
}
