//! Mirror pool: discovery, latency ranking, and ordered fallback.
//!
//! Mirrors are ranked once at startup by a short connect probe;
//! afterwards every download walks the list strictly left to right under
//! the pool mutex, so two requests issued at the same time observe the
//! same order.

use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cancel::CancelSignal;
use crate::patch::PatchService;
use crate::{Error, Result};

/// Archival mirror appended after the advertised hosts, whatever its
/// probe result.
const FALLBACK_HOST: &str = "cdn.arctium.tools";

/// Per-mirror probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_millis(400);

/// Overall budget for the probe phase.
const PROBE_BUDGET: Duration = Duration::from_secs(1);

/// Synthetic latency for mirrors whose probe did not finish.
const UNREACHABLE: u64 = u64::MAX;

/// One ranked mirror.
#[derive(Debug, Clone)]
pub struct Mirror {
    /// Base URL including the CDN path stem, e.g.
    /// `http://host/tpr/wow`.
    pub base_url: String,
    /// Probe latency estimate; [`UNREACHABLE`] when the probe failed.
    pub rtt_ms: u64,
}

/// Ping-ranked pool of CDN mirrors.
#[derive(Debug)]
pub struct MirrorPool {
    client: Client,
    mirrors: Mutex<Vec<Mirror>>,
}

impl MirrorPool {
    /// Discover mirrors for a product: fetch the cdns table for the
    /// service's region, append the archival fallback, then rank by
    /// probe latency.
    pub async fn discover(client: Client, patch: &PatchService, product: &str) -> Result<Self> {
        let entry = patch.cdns_for_region(product).await?;

        let mut hosts = entry.hosts.clone();
        hosts.push(FALLBACK_HOST.to_string());

        let rtts = probe_all(&hosts).await;
        let mut mirrors: Vec<Mirror> = hosts
            .into_iter()
            .zip(rtts)
            .map(|(host, rtt_ms)| Mirror {
                base_url: base_url(&host, &entry.path),
                rtt_ms,
            })
            .collect();
        // Stable: equally-ranked mirrors keep their advertised order.
        mirrors.sort_by_key(|m| m.rtt_ms);

        for mirror in &mirrors {
            debug!("mirror {} rtt {}ms", mirror.base_url, mirror.rtt_ms);
        }

        Ok(Self {
            client,
            mirrors: Mutex::new(mirrors),
        })
    }

    /// Build a pool from an already-ordered mirror list.
    pub fn from_mirrors(client: Client, mirrors: Vec<Mirror>) -> Self {
        Self {
            client,
            mirrors: Mutex::new(mirrors),
        }
    }

    /// Build a pool from raw hosts and a path stem without probing.
    pub fn from_hosts(client: Client, hosts: &[&str], stem: &str) -> Self {
        let mirrors = hosts
            .iter()
            .map(|host| Mirror {
                base_url: base_url(host, stem),
                rtt_ms: 0,
            })
            .collect();
        Self::from_mirrors(client, mirrors)
    }

    /// The current mirror order.
    pub async fn mirrors(&self) -> Vec<Mirror> {
        self.mirrors.lock().await.clone()
    }

    /// Fetch `path` from the first mirror that answers.
    ///
    /// Whole-file fetches with a known `expected_len` send a HEAD first
    /// and reject mirrors whose Content-Length disagrees (a 405 counts
    /// as no answer). `range` switches to a ranged GET of
    /// `offset..offset+length`. A fired `cancel` aborts the walk with
    /// [`Error::Cancelled`]. Returns `Ok(None)` when every mirror is
    /// exhausted; the caller decides whether that is fatal.
    pub async fn fetch(
        &self,
        path: &str,
        expected_len: u64,
        range: Option<(u64, u64)>,
        cancel: &CancelSignal,
    ) -> Result<Option<Response>> {
        let mirrors = self.mirrors.lock().await;

        for mirror in mirrors.iter() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    what: path.to_string(),
                });
            }
            let url = format!("{}/{path}", mirror.base_url);
            trace!("trying {url}");

            let attempt = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        what: path.to_string(),
                    });
                }
                attempt = self.try_mirror(&url, expected_len, range) => attempt,
            };
            match attempt {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("mirror {} failed for {path}: {e}", mirror.base_url);
                    continue;
                }
            }
        }

        debug!("all mirrors exhausted for {path}");
        Ok(None)
    }

    /// One mirror's attempt. `Ok(None)` means "move on to the next".
    async fn try_mirror(
        &self,
        url: &str,
        expected_len: u64,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Response>> {
        if let Some((offset, length)) = range {
            let response = self
                .client
                .get(url)
                .header(RANGE, format!("bytes={}-{}", offset, offset + length - 1))
                .send()
                .await?;
            if !response.status().is_success() {
                return Ok(None);
            }
            return Ok(Some(response));
        }

        if expected_len > 0 {
            let head = self.client.head(url).send().await?;
            let status = head.status();
            if status == StatusCode::METHOD_NOT_ALLOWED {
                // No answer; fall through to GET.
            } else if status.is_success() {
                let advertised = head
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if let Some(len) = advertised {
                    if len != expected_len {
                        warn!("{url}: advertised length {len}, expected {expected_len}");
                        return Ok(None);
                    }
                }
            } else {
                return Ok(None);
            }
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(response))
    }
}

fn base_url(host: &str, stem: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/{stem}", host.trim_end_matches('/'))
    } else {
        format!("http://{host}/{stem}")
    }
}

/// Probe every host concurrently. Each probe is a TCP connect to port
/// 80 capped at [`PROBE_TIMEOUT`]; the whole phase is capped at
/// [`PROBE_BUDGET`], and anything unfinished counts as unreachable.
async fn probe_all(hosts: &[String]) -> Vec<u64> {
    let probes = hosts.iter().map(|host| probe(host.clone()));
    match tokio::time::timeout(PROBE_BUDGET, futures_util::future::join_all(probes)).await {
        Ok(rtts) => rtts,
        Err(_) => vec![UNREACHABLE; hosts.len()],
    }
}

async fn probe(host: String) -> u64 {
    let start = Instant::now();
    let connect = tokio::net::TcpStream::connect((host.as_str(), 80));
    match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
        Ok(Ok(_)) => start.elapsed().as_millis() as u64,
        _ => UNREACHABLE,
    }
}
