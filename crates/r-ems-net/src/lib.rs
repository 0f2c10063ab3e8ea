//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! HTTP adapters for the upstream power-grid API and the REST surface of the grid view.
#![warn(missing_docs)]

pub mod http;
pub mod rest;
pub mod wire;

pub use http::{HttpGridSource, SITE_QUERY_PARAM};
pub use rest::{GridApiBuilder, GridApiHandle, GridViewProvider, ScopeRequest, ScopeResponse};
pub use wire::{
    FeedStatus, FeedStatusBody, GridDataDto, GridMetricsDto, GridStateDto, LineDto,
    LineReadingDto, NodeDto, NodeReadingDto,
};
