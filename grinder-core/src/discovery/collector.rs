//! Per-backend query runner with retry, disable and concurrency policy

use super::{PageCursor, SearchBackend, SearchPage};
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::types::{Engine, Query, RawHit};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A query that produced no results because of a backend problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryWarning {
    /// Backend the query ran on
    pub engine: Engine,
    /// Vendor of the query
    pub vendor: String,
    /// Product of the query
    pub product: String,
    /// Query string
    pub query: String,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for QueryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} query '{}' ({} {}): {}",
            self.engine, self.query, self.vendor, self.product, self.message
        )
    }
}

/// Everything one collector produced during a run
#[derive(Debug, Clone)]
pub struct CollectorReport {
    /// Backend
    pub engine: Engine,
    /// Hits of every query that completed, in query order
    pub hits: Vec<RawHit>,
    /// Queries degraded to an empty result
    pub warnings: Vec<QueryWarning>,
    /// Reason the backend was disabled, if it was
    pub disabled: Option<String>,
    /// Queries that ran to completion
    pub queries_run: usize,
    /// Queries not attempted because the backend was disabled or the run cancelled
    pub queries_skipped: usize,
    /// The run was cancelled while this collector was active
    pub cancelled: bool,
}

/// Wraps a [`SearchBackend`] with the run's failure policy
///
/// - rate-limited pages are retried with exponential backoff, honouring
///   `Retry-After`
/// - an authentication failure disables the backend for the rest of the run
/// - at most `concurrency` queries are in flight at once
///
/// `Collector` is itself a [`SearchBackend`], so [`SearchBackend::search`]
/// on it yields the same lazy stream with the policy applied per page.
pub struct Collector {
    backend: Arc<dyn SearchBackend>,
    max_results: usize,
    retry: RetryPolicy,
    concurrency: usize,
    cancel: CancellationToken,
    disabled: AtomicBool,
    disabled_reason: OnceCell<String>,
}

impl Collector {
    /// Creates a collector with default retry policy and concurrency
    pub fn new(backend: Arc<dyn SearchBackend>, max_results: usize) -> Self {
        Self {
            backend,
            max_results,
            retry: RetryPolicy::default(),
            concurrency: crate::config::DEFAULT_DISCOVERY_CONCURRENCY,
            cancel: CancellationToken::new(),
            disabled: AtomicBool::new(false),
            disabled_reason: OnceCell::new(),
        }
    }

    /// Sets the rate-limit retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of queries in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Aborts in-flight requests and backoff sleeps when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns true once an authentication failure was seen
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Why the backend was disabled
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.get().map(String::as_str)
    }

    fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            let _ = self.disabled_reason.set(reason.to_string());
            warn!(
                engine = %self.backend.engine(),
                reason,
                "backend disabled for the rest of the run"
            );
        }
    }

    /// Runs one query to completion
    ///
    /// A disabled backend returns an empty result without any request.
    pub async fn collect(&self, query: Arc<Query>) -> Result<Vec<RawHit>> {
        if self.is_disabled() {
            return Ok(Vec::new());
        }
        self.search(query, self.max_results).try_collect().await
    }

    /// Runs `queries` with bounded concurrency and contains their failures
    pub async fn run(&self, queries: Vec<Arc<Query>>) -> CollectorReport {
        let engine = self.backend.engine();
        info!(%engine, queries = queries.len(), "starting discovery");

        let mut report = CollectorReport {
            engine,
            hits: Vec::new(),
            warnings: Vec::new(),
            disabled: None,
            queries_run: 0,
            queries_skipped: 0,
            cancelled: false,
        };

        let results: Vec<(Arc<Query>, Option<Result<Vec<RawHit>>>)> = stream::iter(queries)
            .map(|query| async move {
                if self.is_disabled() || self.cancel.is_cancelled() {
                    return (query, None);
                }
                let result = self.collect(Arc::clone(&query)).await;
                (query, Some(result))
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        for (query, result) in results {
            match result {
                None => report.queries_skipped += 1,
                Some(Ok(hits)) => {
                    debug!(%engine, query = %query.query, hits = hits.len(), "query finished");
                    report.queries_run += 1;
                    report.hits.extend(hits);
                }
                Some(Err(Error::Cancelled)) => {
                    report.cancelled = true;
                    report.queries_skipped += 1;
                }
                Some(Err(e)) => {
                    warn!(%engine, query = %query.query, error = %e, "query degraded to empty result");
                    report.queries_run += 1;
                    report.warnings.push(QueryWarning {
                        engine,
                        vendor: query.vendor.clone(),
                        product: query.product.clone(),
                        query: query.query.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report.cancelled |= self.cancel.is_cancelled();
        report.disabled = self.disabled_reason().map(str::to_string);
        info!(
            %engine,
            hits = report.hits.len(),
            warnings = report.warnings.len(),
            disabled = report.disabled.is_some(),
            "discovery finished"
        );
        report
    }
}

#[async_trait]
impl SearchBackend for Collector {
    fn engine(&self) -> Engine {
        self.backend.engine()
    }

    async fn fetch_page(&self, query: &Query, cursor: Option<&PageCursor>) -> Result<SearchPage> {
        let mut attempt = 0;
        loop {
            if self.is_disabled() {
                return Ok(SearchPage::default());
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = self.backend.fetch_page(query, cursor) => result,
            };

            match result {
                Err(Error::RateLimit {
                    message,
                    retry_after,
                    ..
                }) if attempt + 1 < self.retry.attempts => {
                    attempt += 1;
                    let delay = retry_after.unwrap_or_else(|| self.retry.delay_for(attempt));
                    debug!(
                        engine = %self.backend.engine(),
                        query = %query.query,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "rate limited, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(Error::Auth { engine, message }) => {
                    self.disable(&message);
                    return Err(Error::Auth { engine, message });
                }
                other => return other,
            }
        }
    }
}
