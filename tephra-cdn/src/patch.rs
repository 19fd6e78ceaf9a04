//! Client for the version/CDN discovery service.

use reqwest::Client;
use tracing::debug;

use crate::manifest::{CdnEntry, VersionEntry, parse_cdns, parse_versions};
use crate::{Error, Result};

/// Client for `http://<region>.patch.battle.net:1119`.
#[derive(Debug, Clone)]
pub struct PatchService {
    client: Client,
    region: String,
    base_url: String,
}

impl PatchService {
    /// Create a client for the given region's service endpoint.
    pub fn new(client: Client, region: impl Into<String>) -> Self {
        let region = region.into();
        let base_url = format!("http://{region}.patch.battle.net:1119");
        Self {
            client,
            region,
            base_url,
        }
    }

    /// Create a client against an explicit base URL.
    pub fn with_base_url(
        client: Client,
        region: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            region: region.into(),
            base_url: base_url.into(),
        }
    }

    /// The region this client queries.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Fetch and parse the versions table for a product.
    pub async fn versions(&self, product: &str) -> Result<Vec<VersionEntry>> {
        let text = self.fetch(product, "versions").await?;
        parse_versions(&text)
    }

    /// The versions row for this client's region.
    pub async fn version_for_region(&self, product: &str) -> Result<VersionEntry> {
        self.versions(product)
            .await?
            .into_iter()
            .find(|v| v.region == self.region)
            .ok_or_else(|| Error::RegionNotFound {
                region: self.region.clone(),
            })
    }

    /// Fetch and parse the cdns table for a product.
    pub async fn cdns(&self, product: &str) -> Result<Vec<CdnEntry>> {
        let text = self.fetch(product, "cdns").await?;
        parse_cdns(&text)
    }

    /// The cdns row for this client's region.
    pub async fn cdns_for_region(&self, product: &str) -> Result<CdnEntry> {
        self.cdns(product)
            .await?
            .into_iter()
            .find(|c| c.name == self.region)
            .ok_or_else(|| Error::RegionNotFound {
                region: self.region.clone(),
            })
    }

    async fn fetch(&self, product: &str, endpoint: &str) -> Result<String> {
        let url = format!("{}/{product}/{endpoint}", self.base_url);
        debug!("patch service request: {url}");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}
