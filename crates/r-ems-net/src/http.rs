//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use r_ems_common::SourceConfig;
use r_ems_gridview::{
    GridViewError, Result, Scope, SourceKind, Telemetry, TelemetrySource, Topology,
    TopologySource,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::wire::{FeedStatus, FeedStatusBody, GridDataDto, GridStateDto};

/// Query parameter carrying the site selector.
pub const SITE_QUERY_PARAM: &str = "siteId";

/// Topology, telemetry and feed-status adapter over the upstream HTTP API.
///
/// Every transport, status-code or decoding failure surfaces as
/// [`GridViewError::SourceUnavailable`] tagged with the feed it came from.
#[derive(Debug, Clone)]
pub struct HttpGridSource {
    client: Client,
    base: Url,
    topology_path: String,
    telemetry_path: String,
    status_path: String,
}

impl HttpGridSource {
    /// Build an adapter from the `[source]` configuration section.
    pub fn from_config(config: &SourceConfig) -> anyhow::Result<Self> {
        let base = config.base_url()?.clone();
        let mut source = Self::new(base, config.timeout)?;
        source.topology_path = config.topology_path.clone();
        source.telemetry_path = config.telemetry_path.clone();
        source.status_path = config.status_path.clone();
        Ok(source)
    }

    /// Build an adapter using the default endpoint paths.
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("r-ems-gridview/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        let defaults = SourceConfig::default();
        Ok(Self {
            client,
            base,
            topology_path: defaults.topology_path,
            telemetry_path: defaults.telemetry_path,
            status_path: defaults.status_path,
        })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve `path` against the base URL, adding `siteId` for site scopes.
    pub fn endpoint(&self, feed: SourceKind, path: &str, scope: &Scope) -> Result<Url> {
        let mut url = self.base.join(path).map_err(|err| {
            GridViewError::unavailable(feed, format!("invalid endpoint {path}: {err}"))
        })?;
        if let Some(site) = scope.site_id() {
            url.query_pairs_mut().append_pair(SITE_QUERY_PARAM, site);
        }
        Ok(url)
    }

    /// Ask the upstream whether its telemetry generator is running.
    pub async fn fetch_feed_status(&self) -> Result<FeedStatus> {
        let url = self.endpoint(SourceKind::Status, &self.status_path, &Scope::all())?;
        let body: FeedStatusBody = self.get_json(SourceKind::Status, url).await?;
        Ok(body.into())
    }

    async fn get_json<T: DeserializeOwned>(&self, feed: SourceKind, url: Url) -> Result<T> {
        trace!(%feed, %url, "requesting");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| GridViewError::unavailable(feed, format!("request to {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GridViewError::unavailable(
                feed,
                format!("{url} answered {status}"),
            ));
        }
        let body = response.json::<T>().await.map_err(|err| {
            GridViewError::unavailable(feed, format!("invalid body from {url}: {err}"))
        })?;
        debug!(%feed, %url, "response decoded");
        Ok(body)
    }
}

#[async_trait]
impl TopologySource for HttpGridSource {
    async fn fetch_topology(&self, scope: &Scope) -> Result<Topology> {
        let url = self.endpoint(SourceKind::Topology, &self.topology_path, scope)?;
        let dto: GridStateDto = self.get_json(SourceKind::Topology, url).await?;
        Ok(dto.into_topology())
    }
}

#[async_trait]
impl TelemetrySource for HttpGridSource {
    async fn fetch_telemetry(&self, scope: &Scope) -> Result<Telemetry> {
        let url = self.endpoint(SourceKind::Telemetry, &self.telemetry_path, scope)?;
        let dto: GridDataDto = self.get_json(SourceKind::Telemetry, url).await?;
        Ok(dto.into_telemetry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(base: &str) -> HttpGridSource {
        HttpGridSource::new(Url::parse(base).unwrap(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn site_scope_adds_query_parameter() {
        let source = source("http://grid.local:4000");
        let url = source
            .endpoint(SourceKind::Telemetry, "/api/power-grid/data", &Scope::site("hn 01"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://grid.local:4000/api/power-grid/data?siteId=hn+01"
        );

        let all = source
            .endpoint(SourceKind::Topology, "/api/power-grid/state", &Scope::all())
            .unwrap();
        assert_eq!(all.query(), None);
    }

    #[test]
    fn config_paths_are_honoured() {
        let mut config = SourceConfig {
            base_url: Some(Url::parse("https://grid.example.net").unwrap()),
            ..SourceConfig::default()
        };
        config.topology_path = "/v2/state".into();
        let source = HttpGridSource::from_config(&config).unwrap();
        let url = source
            .endpoint(SourceKind::Topology, &source.topology_path, &Scope::all())
            .unwrap();
        assert_eq!(url.as_str(), "https://grid.example.net/v2/state");
        assert!(HttpGridSource::from_config(&SourceConfig::default()).is_err());
    }
}
