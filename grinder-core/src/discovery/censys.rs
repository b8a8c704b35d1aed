//! Censys hosts search client (API v2)
//!
//! Censys returns hosts, not services: one result carries an address and the
//! list of services seen on it. Each (host, service) pair becomes its own
//! [`RawHit`] so that both backends deduplicate on the same `(ip, port)` key.

use super::{retry_after, status_error, PageCursor, SearchBackend, SearchPage};
use crate::error::{Error, Result};
use crate::types::{Engine, HostAttributes, HostKey, Location, Query, RawHit};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CENSYS_API_BASE: &str = "https://search.censys.io/api";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Hosts per page requested from the search endpoint
pub const PER_PAGE: u32 = 100;

/// Client for the Censys hosts search API
#[derive(Clone)]
pub struct CensysClient {
    client: Client,
    api_id: String,
    api_secret: String,
    base_url: String,
}

impl std::fmt::Debug for CensysClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CensysClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    hits: Vec<CensysHost>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// One host result
#[derive(Debug, Clone, Deserialize)]
pub struct CensysHost {
    /// Address
    pub ip: String,
    /// Services observed on the host
    #[serde(default)]
    pub services: Vec<CensysService>,
    /// Geolocation
    #[serde(default)]
    pub location: Option<CensysLocation>,
    /// Announcing autonomous system
    #[serde(default)]
    pub autonomous_system: Option<AutonomousSystem>,
    /// Reverse DNS names
    #[serde(default)]
    pub dns: Option<Dns>,
}

/// Service entry of a host
#[derive(Debug, Clone, Deserialize)]
pub struct CensysService {
    /// Port
    pub port: u16,
    /// Detected protocol name (e.g. "HTTP", "MODBUS")
    #[serde(default)]
    pub service_name: Option<String>,
    /// Transport protocol ("TCP"/"UDP")
    #[serde(default)]
    pub transport_protocol: Option<String>,
    /// Banner text, when present
    #[serde(default)]
    pub banner: Option<String>,
}

/// Location of a host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CensysLocation {
    /// Country name
    #[serde(default)]
    pub country: Option<String>,
    /// City
    #[serde(default)]
    pub city: Option<String>,
    /// Coordinates
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

/// Coordinates of a location
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Coordinates {
    /// Latitude
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Longitude
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// Autonomous system of a host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutonomousSystem {
    /// AS name
    #[serde(default)]
    pub name: Option<String>,
}

/// DNS block of a host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dns {
    /// Reverse DNS names
    #[serde(default)]
    pub names: Vec<String>,
}

impl CensysHost {
    /// Expands the host into one hit per service
    pub fn into_hits(self, query: &Arc<Query>) -> Vec<RawHit> {
        let Ok(ip) = self.ip.parse::<IpAddr>() else {
            return Vec::new();
        };

        let location = self.location.map(|loc| {
            let coordinates = loc.coordinates.unwrap_or_default();
            Location {
                latitude: coordinates.latitude,
                longitude: coordinates.longitude,
                country: loc.country,
                city: loc.city,
            }
        });
        let organization = self.autonomous_system.and_then(|asn| asn.name);
        let hostnames = self.dns.map(|d| d.names).unwrap_or_default();

        self.services
            .into_iter()
            .map(|service| RawHit {
                key: HostKey::new(ip, service.port),
                engine: Engine::Censys,
                attributes: HostAttributes {
                    banner: service.banner.filter(|b| !b.is_empty()),
                    product: None,
                    version: None,
                    transport: service.transport_protocol.map(|t| t.to_lowercase()),
                    module: service.service_name.map(|s| s.to_lowercase()),
                    hostnames: hostnames.clone(),
                    organization: organization.clone(),
                    location: location.clone(),
                    vulnerabilities: Vec::new(),
                    cpes: Vec::new(),
                },
                query: Arc::clone(query),
            })
            .collect()
    }
}

impl CensysClient {
    /// Creates a client for the public API
    pub fn new(api_id: impl Into<String>, api_secret: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_id: api_id.into(),
            api_secret: api_secret.into(),
            base_url: CENSYS_API_BASE.to_string(),
        })
    }

    /// Points the client at another server (tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SearchBackend for CensysClient {
    fn engine(&self) -> Engine {
        Engine::Censys
    }

    async fn fetch_page(&self, query: &Query, cursor: Option<&PageCursor>) -> Result<SearchPage> {
        let url = format!("{}/v2/hosts/search", self.base_url);
        let per_page = PER_PAGE.to_string();
        let mut params = vec![("q", query.query.as_str()), ("per_page", per_page.as_str())];
        match cursor {
            None => {}
            Some(PageCursor::Token(token)) => params.push(("cursor", token.as_str())),
            Some(PageCursor::Page(n)) => {
                return Err(Error::Backend {
                    engine: Engine::Censys,
                    message: format!("unexpected page cursor {}", n),
                })
            }
        }

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.api_id, Some(&self.api_secret))
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error.or(e.status))
                .unwrap_or_else(|| format!("request failed with status {}", status));
            return Err(status_error(Engine::Censys, status, message, retry_after));
        }

        let body: SearchResponse = response.json().await?;
        let result = body.result;
        debug!(
            query = %query.query,
            hosts = result.hits.len(),
            total = result.total,
            "censys page"
        );

        let shared = Arc::new(query.clone());
        let host_count = result.hits.len();
        let hits = result
            .hits
            .into_iter()
            .flat_map(|host| host.into_hits(&shared))
            .collect();
        let next = result
            .links
            .next
            .filter(|token| !token.is_empty() && host_count > 0)
            .map(PageCursor::Token);

        Ok(SearchPage {
            hits,
            next,
            total: Some(result.total),
        })
    }
}
