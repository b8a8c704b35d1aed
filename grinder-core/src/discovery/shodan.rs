//! Shodan host search client
//!
//! Wraps `GET /shodan/host/search`, which returns up to 100 matches per page.
//! Every match is one service (address and port), so each one maps directly
//! to a [`RawHit`].
//!
//! # Example
//!
//! ```no_run
//! use grinder_core::discovery::{SearchBackend, ShodanClient};
//! use futures::TryStreamExt;
//! # use grinder_core::types::Query;
//! # use std::sync::Arc;
//!
//! # async fn example(query: Arc<Query>) -> Result<(), Box<dyn std::error::Error>> {
//! let client = ShodanClient::new("API_KEY")?;
//! let hits: Vec<_> = client.search(query, 200).try_collect().await?;
//! println!("Found {} services", hits.len());
//! # Ok(())
//! # }
//! ```

use super::{is_rate_limit_message, retry_after, status_error, PageCursor, SearchBackend, SearchPage};
use crate::error::{Error, Result};
use crate::types::{Engine, HostAttributes, HostKey, Location, Query, RawHit};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const SHODAN_API_BASE: &str = "https://api.shodan.io";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Matches per page returned by the search endpoint
pub const PAGE_SIZE: u64 = 100;

/// Client for the Shodan search API
#[derive(Clone)]
pub struct ShodanClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for ShodanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShodanClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Response body of the search endpoint
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<ShodanMatch>,
    #[serde(default)]
    total: u64,
}

/// Error body returned on failures (and sometimes with 200)
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// One service match as returned by Shodan
#[derive(Debug, Clone, Deserialize)]
pub struct ShodanMatch {
    /// Address as a string
    pub ip_str: String,
    /// Service port
    pub port: u16,
    /// Transport protocol
    #[serde(default)]
    pub transport: Option<String>,
    /// Product name
    #[serde(default)]
    pub product: Option<String>,
    /// Product version
    #[serde(default)]
    pub version: Option<String>,
    /// Raw banner
    #[serde(default)]
    pub data: Option<String>,
    /// Hostnames
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// Organization
    #[serde(default)]
    pub org: Option<String>,
    /// Geolocation
    #[serde(default)]
    pub location: ShodanLocation,
    /// Vulnerabilities, either an object keyed by CVE or a list
    #[serde(default)]
    pub vulns: serde_json::Value,
    /// CPE 2.2 identifiers
    #[serde(default)]
    pub cpe: Vec<String>,
    /// CPE 2.3 identifiers
    #[serde(default)]
    pub cpe23: Vec<String>,
    /// Crawler metadata
    #[serde(default, rename = "_shodan")]
    pub meta: ShodanMeta,
}

/// Location block of a match
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShodanLocation {
    /// Latitude
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Longitude
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Country name
    #[serde(default)]
    pub country_name: Option<String>,
    /// City
    #[serde(default)]
    pub city: Option<String>,
}

/// `_shodan` block of a match
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShodanMeta {
    /// Crawler module that produced the banner
    #[serde(default)]
    pub module: Option<String>,
}

impl ShodanMatch {
    /// Converts the match to a hit for `query`
    ///
    /// Returns `None` when `ip_str` is not an address.
    pub fn into_hit(self, query: Arc<Query>) -> Option<RawHit> {
        let ip: IpAddr = self.ip_str.parse().ok()?;

        let vulnerabilities = match self.vulns {
            serde_json::Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
            serde_json::Value::Array(list) => list
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let location = Location {
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            country: self.location.country_name,
            city: self.location.city,
        };
        let has_location = location != Location::default();

        let mut cpes = self.cpe;
        cpes.extend(self.cpe23);

        Some(RawHit {
            key: HostKey::new(ip, self.port),
            engine: Engine::Shodan,
            attributes: HostAttributes {
                banner: self.data.filter(|d| !d.is_empty()),
                product: self.product,
                version: self.version,
                transport: self.transport,
                module: self.meta.module,
                hostnames: self.hostnames,
                organization: self.org,
                location: has_location.then_some(location),
                vulnerabilities,
                cpes,
            },
            query,
        })
    }
}

impl ShodanClient {
    /// Creates a client for the public API
    ///
    /// # Examples
    ///
    /// ```
    /// use grinder_core::discovery::ShodanClient;
    ///
    /// let client = ShodanClient::new("API_KEY")?;
    /// # Ok::<(), grinder_core::error::Error>(())
    /// ```
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_timeout(api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a client with a custom HTTP timeout
    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: SHODAN_API_BASE.to_string(),
        })
    }

    /// Points the client at another server (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn request(&self, query: &str, page: u32) -> Result<SearchResponse> {
        let url = format!("{}/shodan/host/search", self.base_url);
        let page = page.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("query", query),
                ("page", page.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await?;

        // Shodan reports some failures as {"error": ...} with any status
        let api_error = serde_json::from_str::<ApiErrorResponse>(&body)
            .ok()
            .map(|e| e.error);

        if status == StatusCode::OK {
            if let Some(message) = api_error {
                if is_rate_limit_message(&message) {
                    return Err(Error::RateLimit {
                        engine: Engine::Shodan,
                        message,
                        retry_after,
                    });
                }
                return Err(Error::Backend {
                    engine: Engine::Shodan,
                    message,
                });
            }
            return Ok(serde_json::from_str(&body)?);
        }

        let message = api_error.unwrap_or_else(|| format!("request failed with status {}", status));
        Err(status_error(Engine::Shodan, status, message, retry_after))
    }
}

#[async_trait]
impl SearchBackend for ShodanClient {
    fn engine(&self) -> Engine {
        Engine::Shodan
    }

    async fn fetch_page(&self, query: &Query, cursor: Option<&PageCursor>) -> Result<SearchPage> {
        let page = match cursor {
            None => 1,
            Some(PageCursor::Page(n)) => *n,
            Some(PageCursor::Token(t)) => {
                return Err(Error::Backend {
                    engine: Engine::Shodan,
                    message: format!("unexpected cursor token '{}'", t),
                })
            }
        };

        let response = self.request(&query.query, page).await?;
        debug!(
            query = %query.query,
            page,
            matches = response.matches.len(),
            total = response.total,
            "shodan page"
        );

        let shared = Arc::new(query.clone());
        let fetched = response.matches.len() as u64;
        let hits: Vec<RawHit> = response
            .matches
            .into_iter()
            .filter_map(|m| {
                let ip = m.ip_str.clone();
                let hit = m.into_hit(Arc::clone(&shared));
                if hit.is_none() {
                    trace!(ip = %ip, "skipping match with unparsable address");
                }
                hit
            })
            .collect();

        let seen = u64::from(page - 1) * PAGE_SIZE + fetched;
        let next = (fetched > 0 && seen < response.total).then(|| PageCursor::Page(page + 1));

        Ok(SearchPage {
            hits,
            next,
            total: Some(response.total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, CustomScripts};

    fn query() -> Arc<Query> {
        Arc::new(Query {
            vendor: "Acme".into(),
            product: "Widget".into(),
            engine: Engine::Shodan,
            query: "product:widget".into(),
            query_confidence: Confidence::Certain,
            vendor_confidence: Confidence::Certain,
            scripts: CustomScripts::default(),
        })
    }

    #[test]
    fn test_client_creation() {
        let client = ShodanClient::new("key").unwrap();
        assert_eq!(client.base_url, SHODAN_API_BASE);
        let client = client.with_base_url("http://127.0.0.1:9000/");
        assert_eq!(client.base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_debug_hides_key() {
        let client = ShodanClient::new("s3cr3t").unwrap();
        assert!(!format!("{:?}", client).contains("s3cr3t"));
    }

    #[test]
    fn test_match_deserialization() {
        let json = r#"{
            "ip_str": "203.0.113.7",
            "port": 443,
            "transport": "tcp",
            "product": "Widget httpd",
            "version": "2.1",
            "data": "HTTP/1.1 200 OK\r\nServer: Widget",
            "hostnames": ["widget.example.com"],
            "org": "Example Hosting",
            "location": {"latitude": 52.5, "longitude": 13.4, "country_name": "Germany", "city": "Berlin"},
            "vulns": {"CVE-2021-44228": {"cvss": 10.0}},
            "cpe": ["cpe:/a:acme:widget:2.1"],
            "_shodan": {"module": "https"}
        }"#;
        let m: ShodanMatch = serde_json::from_str(json).unwrap();
        let hit = m.into_hit(query()).unwrap();

        assert_eq!(hit.key.to_string(), "203.0.113.7:443");
        assert_eq!(hit.engine, Engine::Shodan);
        assert_eq!(hit.attributes.module.as_deref(), Some("https"));
        assert_eq!(hit.attributes.vulnerabilities, vec!["CVE-2021-44228"]);
        assert_eq!(hit.attributes.cpes, vec!["cpe:/a:acme:widget:2.1"]);
        let location = hit.attributes.location.unwrap();
        assert_eq!(location.country.as_deref(), Some("Germany"));
        assert_eq!(hit.query.vendor, "Acme");
    }

    #[test]
    fn test_match_with_minimal_fields() {
        let json = r#"{"ip_str": "198.51.100.4", "port": 22, "location": {"latitude": null}}"#;
        let m: ShodanMatch = serde_json::from_str(json).unwrap();
        let hit = m.into_hit(query()).unwrap();
        assert!(hit.attributes.location.is_none());
        assert!(hit.attributes.banner.is_none());
        assert!(hit.attributes.vulnerabilities.is_empty());
    }

    #[test]
    fn test_match_vulns_as_list() {
        let json = r#"{"ip_str": "198.51.100.4", "port": 80, "vulns": ["CVE-2020-0001"]}"#;
        let m: ShodanMatch = serde_json::from_str(json).unwrap();
        let hit = m.into_hit(query()).unwrap();
        assert_eq!(hit.attributes.vulnerabilities, vec!["CVE-2020-0001"]);
    }

    #[test]
    fn test_match_with_bad_address() {
        let json = r#"{"ip_str": "not-an-ip", "port": 80}"#;
        let m: ShodanMatch = serde_json::from_str(json).unwrap();
        assert!(m.into_hit(query()).is_none());
    }
}
