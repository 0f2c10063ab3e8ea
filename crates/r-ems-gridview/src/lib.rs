//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Live grid view for R-EMS.
//!
//! Reconciles a static topology feed with a polled telemetry feed into one
//! [`GridSnapshot`] per scope, retaining the last good snapshot across feed failures and
//! notifying subscribers only when content changes.

pub mod derive;
pub mod engine;
pub mod errors;
pub mod model;
pub mod poller;
pub mod publisher;
pub mod scope;
pub mod source;
pub mod testing;
pub mod view;

pub use derive::{
    load_percent, merge, validate_topology, ClassCounts, LoadClass, OverloadSummary,
    HIGH_LOAD_THRESHOLD, OVERLOAD_THRESHOLD,
};
pub use engine::{EngineState, ReconciliationEngine};
pub use errors::{GridViewError, IntegrityViolation, Result, SourceKind};
pub use model::{
    GeoPosition, GridAggregate, GridInfo, GridSnapshot, Line, LineMeasurement, LineStatus,
    LineTelemetry, Node, NodeKind, NodeMeasurement, NodeStatus, NodeTelemetry, Telemetry,
    Topology,
};
pub use poller::{Poller, PollerHandle, PollerStats, MIN_POLL_PERIOD};
pub use publisher::{GridStatus, SharedSnapshot, SnapshotPublisher, Subscription};
pub use scope::{Scope, ScopeTag, ScopeTracker};
pub use source::{
    InMemoryTopologySource, ScriptStep, ScriptedTelemetrySource, TelemetrySource, TopologySource,
};
pub use view::{GridView, GridViewBuilder, DEFAULT_POLL_INTERVAL};
