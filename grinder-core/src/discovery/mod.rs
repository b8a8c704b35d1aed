//! Discovery backends and the collectors that drive them
//!
//! A [`SearchBackend`] knows how to fetch one page of results for a catalog
//! query. Everything else, pagination up to a result cap, retries on rate
//! limits and disabling a backend after an authentication failure, is built
//! on top of that single operation:
//!
//! - [`SearchBackend::search`] turns pages into a lazy stream of [`RawHit`]s
//! - [`Collector`] wraps a backend with the retry and disable policy and runs
//!   a list of queries with bounded concurrency
//!
//! # Example
//!
//! ```no_run
//! use grinder_core::discovery::{Collector, ShodanClient};
//! use grinder_core::catalog::Catalog;
//! use grinder_core::types::Engine;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Catalog::load("queries.json")?;
//! let shodan = Arc::new(ShodanClient::new("API_KEY")?);
//! let collector = Collector::new(shodan, 1_000);
//! let report = collector.run(catalog.queries_for(Engine::Shodan)).await;
//! println!("{} hits, {} warnings", report.hits.len(), report.warnings.len());
//! # Ok(())
//! # }
//! ```

pub mod censys;
pub mod collector;
pub mod shodan;

pub use censys::CensysClient;
pub use collector::{Collector, CollectorReport, QueryWarning};
pub use shodan::ShodanClient;

use crate::error::{Error, Result};
use crate::types::{Engine, Query, RawHit};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Position of the next page in a paginated search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// 1-based page number (Shodan)
    Page(u32),
    /// Opaque continuation token (Censys)
    Token(String),
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// Hits on this page
    pub hits: Vec<RawHit>,
    /// Cursor of the following page, `None` when exhausted
    pub next: Option<PageCursor>,
    /// Total matches reported by the backend
    pub total: Option<u64>,
}

/// A search-engine backend
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Backend identity
    fn engine(&self) -> Engine;

    /// Fetches one page; `None` asks for the first page
    async fn fetch_page(&self, query: &Query, cursor: Option<&PageCursor>) -> Result<SearchPage>;

    /// Lazy, finite stream of hits for `query`
    ///
    /// Pages are requested only as the stream is polled. The stream ends when
    /// the backend runs out of results or `max_results` hits were yielded; an
    /// error ends it after being yielded once.
    fn search<'a>(&'a self, query: Arc<Query>, max_results: usize) -> BoxStream<'a, Result<RawHit>> {
        struct State {
            cursor: Option<PageCursor>,
            remaining: usize,
        }

        let initial = Some(State {
            cursor: None,
            remaining: max_results,
        });

        stream::unfold(initial, move |state| {
            let query = Arc::clone(&query);
            async move {
                let state = state.filter(|s| s.remaining > 0)?;
                match self.fetch_page(&query, state.cursor.as_ref()).await {
                    Ok(page) => {
                        let mut hits = page.hits;
                        hits.truncate(state.remaining);
                        let remaining = state.remaining - hits.len();
                        let next = match page.next {
                            Some(cursor) if !hits.is_empty() && remaining > 0 => Some(State {
                                cursor: Some(cursor),
                                remaining,
                            }),
                            _ => None,
                        };
                        Some((Ok(hits), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .map_ok(|hits| stream::iter(hits.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

/// Extracts a `Retry-After` delay given in seconds
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Determines if an error message is a rate limiting error
pub(crate) fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
        || lower.contains("throttle")
        || lower.contains("usage limits")
}

/// Maps a non-success HTTP response to the error taxonomy
pub(crate) fn status_error(
    engine: Engine,
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth { engine, message },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimit {
            engine,
            message,
            retry_after,
        },
        _ if is_rate_limit_message(&message) => Error::RateLimit {
            engine,
            message,
            retry_after,
        },
        _ => Error::Backend {
            engine,
            message: format!("{} ({})", message, status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, CustomScripts, HostAttributes, HostKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend serving fixed-size pages of synthetic hits
    struct PagedBackend {
        page_size: usize,
        pages: u32,
        calls: AtomicUsize,
        fail_on_page: Option<u32>,
    }

    impl PagedBackend {
        fn new(page_size: usize, pages: u32) -> Self {
            Self {
                page_size,
                pages,
                calls: AtomicUsize::new(0),
                fail_on_page: None,
            }
        }
    }

    #[async_trait]
    impl SearchBackend for PagedBackend {
        fn engine(&self) -> Engine {
            Engine::Shodan
        }

        async fn fetch_page(&self, query: &Query, cursor: Option<&PageCursor>) -> Result<SearchPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page = match cursor {
                None => 1,
                Some(PageCursor::Page(n)) => *n,
                Some(PageCursor::Token(_)) => unreachable!(),
            };
            if self.fail_on_page == Some(page) {
                return Err(Error::Backend {
                    engine: Engine::Shodan,
                    message: "boom".into(),
                });
            }
            let query = Arc::new(query.clone());
            let hits = (0..self.page_size)
                .map(|i| RawHit {
                    key: HostKey::new(
                        format!("198.51.100.{}", page as usize * 10 + i).parse().unwrap(),
                        80,
                    ),
                    engine: Engine::Shodan,
                    attributes: HostAttributes::default(),
                    query: Arc::clone(&query),
                })
                .collect();
            Ok(SearchPage {
                hits,
                next: (page < self.pages).then(|| PageCursor::Page(page + 1)),
                total: Some(self.page_size as u64 * self.pages as u64),
            })
        }
    }

    fn query() -> Arc<Query> {
        Arc::new(Query {
            vendor: "Acme".into(),
            product: "Widget".into(),
            engine: Engine::Shodan,
            query: "widget".into(),
            query_confidence: Confidence::Firm,
            vendor_confidence: Confidence::Firm,
            scripts: CustomScripts::default(),
        })
    }

    #[tokio::test]
    async fn test_search_paginates_until_exhausted() {
        let backend = PagedBackend::new(3, 4);
        let hits: Vec<RawHit> = backend.search(query(), 100).try_collect().await.unwrap();
        assert_eq!(hits.len(), 12);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_search_stops_at_cap() {
        let backend = PagedBackend::new(3, 10);
        let hits: Vec<RawHit> = backend.search(query(), 5).try_collect().await.unwrap();
        assert_eq!(hits.len(), 5);
        // the third page is never requested
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_search_is_lazy() {
        let backend = PagedBackend::new(3, 10);
        let mut stream = backend.search(query(), 100);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        let _ = stream.next().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_zero_cap_makes_no_request() {
        let backend = PagedBackend::new(3, 10);
        let hits: Vec<RawHit> = backend.search(query(), 0).try_collect().await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_error_ends_stream() {
        let mut backend = PagedBackend::new(2, 5);
        backend.fail_on_page = Some(2);
        let items: Vec<Result<RawHit>> = backend.search(query(), 100).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }

    #[test]
    fn test_status_error_mapping() {
        let auth = status_error(Engine::Censys, StatusCode::UNAUTHORIZED, "bad".into(), None);
        assert!(matches!(auth, Error::Auth { engine: Engine::Censys, .. }));

        let limited = status_error(
            Engine::Shodan,
            StatusCode::TOO_MANY_REQUESTS,
            "slow down".into(),
            Some(Duration::from_secs(3)),
        );
        assert!(matches!(
            limited,
            Error::RateLimit { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));

        let quota = status_error(
            Engine::Shodan,
            StatusCode::PAYMENT_REQUIRED,
            "Monthly quota exceeded".into(),
            None,
        );
        assert!(matches!(quota, Error::RateLimit { .. }));

        let other = status_error(Engine::Shodan, StatusCode::BAD_GATEWAY, "upstream".into(), None);
        assert!(matches!(other, Error::Backend { .. }));
    }
}
