//! HTTP-level tests of the Shodan and Censys backends against a mock server

use futures::TryStreamExt;
use grinder_core::{
    config::RetryPolicy,
    discovery::{CensysClient, Collector, SearchBackend, ShodanClient},
    error::Error,
    types::{Confidence, CustomScripts, Engine, Query},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{basic_auth, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn query(engine: Engine, text: &str) -> Arc<Query> {
    Arc::new(Query {
        vendor: "Acme".into(),
        product: "Widget".into(),
        engine,
        query: text.into(),
        query_confidence: Confidence::Certain,
        vendor_confidence: Confidence::Firm,
        scripts: CustomScripts::default(),
    })
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(10),
    }
}

fn shodan_match(i: usize) -> Value {
    json!({
        "ip_str": format!("198.51.{}.{}", i / 250, i % 250 + 1),
        "port": 443,
        "transport": "tcp",
        "data": format!("banner {}", i),
    })
}

fn shodan_page(range: std::ops::Range<usize>, total: usize) -> Value {
    json!({
        "matches": range.map(shodan_match).collect::<Vec<_>>(),
        "total": total,
    })
}

#[tokio::test]
async fn test_shodan_match_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shodan/host/search"))
        .and(query_param("key", "test-key"))
        .and(query_param("query", "product:widget"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [
                {
                    "ip_str": "203.0.113.7",
                    "port": 443,
                    "transport": "tcp",
                    "product": "Widget httpd",
                    "version": "2.1",
                    "data": "HTTP/1.1 200 OK\r\nServer: Widget",
                    "hostnames": ["widget.example.net"],
                    "org": "Example Hosting",
                    "location": {"country_name": "Germany", "city": "Berlin",
                                 "latitude": 52.52, "longitude": 13.40},
                    "vulns": {"CVE-2023-0001": {"cvss": 7.5}},
                    "cpe": ["cpe:/a:acme:widget:2.1"],
                    "_shodan": {"module": "https"}
                },
                {"ip_str": "not-an-address", "port": 80}
            ],
            "total": 2
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ShodanClient::new("test-key").unwrap().with_base_url(server.uri());
    let hits: Vec<_> = client
        .search(query(Engine::Shodan, "product:widget"), 100)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    let hit = &hits[0];
    assert_eq!(hit.key.to_string(), "203.0.113.7:443");
    assert_eq!(hit.engine, Engine::Shodan);
    assert_eq!(hit.attributes.banner.as_deref(), Some("HTTP/1.1 200 OK\r\nServer: Widget"));
    assert_eq!(hit.attributes.module.as_deref(), Some("https"));
    assert_eq!(hit.attributes.organization.as_deref(), Some("Example Hosting"));
    assert_eq!(hit.attributes.vulnerabilities, vec!["CVE-2023-0001"]);
    let location = hit.attributes.location.as_ref().unwrap();
    assert_eq!(location.country.as_deref(), Some("Germany"));
    assert_eq!(hit.query.vendor, "Acme");
}

#[tokio::test]
async fn test_shodan_pagination_stops_at_cap() {
    let server = MockServer::start().await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(0..100, 450)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(100..200, 450)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(200..300, 450)))
        .expect(0)
        .mount(&server)
        .await;

    let client = ShodanClient::new("k").unwrap().with_base_url(server.uri());
    let hits: Vec<_> = client
        .search(query(Engine::Shodan, "widget"), 150)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(hits.len(), 150);
    assert_eq!(hits[149].attributes.banner.as_deref(), Some("banner 149"));
}

#[tokio::test]
async fn test_shodan_last_page_ends_stream() {
    let server = MockServer::start().await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(0..100, 130)))
        .mount(&server)
        .await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(100..130, 130)))
        .mount(&server)
        .await;

    let client = ShodanClient::new("k").unwrap().with_base_url(server.uri());
    let hits: Vec<_> = client
        .search(query(Engine::Shodan, "widget"), 1_000)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(hits.len(), 130);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_shodan_unauthorized_disables_backend() {
    let server = MockServer::start().await;
    Mock::given(path("/shodan/host/search"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid API key"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ShodanClient::new("bad").unwrap().with_base_url(server.uri());
    let collector = Collector::new(Arc::new(client), 100)
        .with_retry(fast_retry())
        .with_concurrency(1);
    let report = collector
        .run(vec![
            query(Engine::Shodan, "first"),
            query(Engine::Shodan, "second"),
            query(Engine::Shodan, "third"),
        ])
        .await;

    assert!(collector.is_disabled());
    assert_eq!(report.disabled.as_deref(), Some("Invalid API key"));
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.queries_run, 1);
    assert_eq!(report.queries_skipped, 2);
    assert!(report.hits.is_empty());
}

#[tokio::test]
async fn test_shodan_rate_limit_is_retried() {
    let server = MockServer::start().await;
    Mock::given(path("/shodan/host/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/shodan/host/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shodan_page(0..3, 3)))
        .expect(1)
        .mount(&server)
        .await;

    let client = ShodanClient::new("k").unwrap().with_base_url(server.uri());
    let collector = Collector::new(Arc::new(client), 100).with_retry(fast_retry());
    let report = collector.run(vec![query(Engine::Shodan, "widget")]).await;

    assert!(report.warnings.is_empty());
    assert_eq!(report.hits.len(), 3);
    assert!(report.disabled.is_none());
}

#[tokio::test]
async fn test_shodan_error_body_with_ok_status() {
    let server = MockServer::start().await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("query", "busy"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"error": "Rate limit reached, please slow down"})),
        )
        .mount(&server)
        .await;
    Mock::given(path("/shodan/host/search"))
        .and(query_param("query", "broken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "Invalid search query"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ShodanClient::new("k").unwrap().with_base_url(server.uri());
    let err = client
        .fetch_page(&query(Engine::Shodan, "busy"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimit { engine: Engine::Shodan, .. }));

    // exhausted retries and other backend errors degrade to a warning
    let collector = Collector::new(Arc::new(client), 100).with_retry(RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(1),
    });
    let report = collector
        .run(vec![query(Engine::Shodan, "busy"), query(Engine::Shodan, "broken")])
        .await;
    assert_eq!(report.warnings.len(), 2);
    assert_eq!(report.queries_run, 2);
    assert!(report.warnings[1].message.contains("Invalid search query"));
    assert!(report.disabled.is_none());
}

fn censys_host(ip: &str, ports: &[u16]) -> Value {
    json!({
        "ip": ip,
        "services": ports.iter().map(|port| json!({
            "port": port,
            "service_name": "HTTP",
            "transport_protocol": "TCP",
            "banner": format!("widget on {}", port),
        })).collect::<Vec<_>>(),
        "location": {"country": "France", "city": "Paris",
                     "coordinates": {"latitude": 48.85, "longitude": 2.35}},
        "autonomous_system": {"name": "EXAMPLE-AS"},
        "dns": {"names": ["widget.example.org"]},
    })
}

fn censys_page(hits: Vec<Value>, total: usize, next: &str) -> Value {
    json!({
        "code": 200,
        "status": "OK",
        "result": {
            "query": "services.service_name: widget",
            "total": total,
            "hits": hits,
            "links": {"prev": "", "next": next},
        }
    })
}

#[tokio::test]
async fn test_censys_cursor_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/hosts/search"))
        .and(basic_auth("censys-id", "censys-secret"))
        .and(query_param("q", "services.service_name: widget"))
        .and(query_param("per_page", "100"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(censys_page(
            vec![censys_host("192.0.2.10", &[80, 443])],
            2,
            "cursor-2",
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/hosts/search"))
        .and(basic_auth("censys-id", "censys-secret"))
        .and(query_param("cursor", "cursor-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(censys_page(
            vec![censys_host("2001:db8::10", &[8443])],
            2,
            "",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = CensysClient::new("censys-id", "censys-secret")
        .unwrap()
        .with_base_url(server.uri());
    let hits: Vec<_> = client
        .search(query(Engine::Censys, "services.service_name: widget"), 100)
        .try_collect()
        .await
        .unwrap();

    // one hit per service
    let keys: Vec<String> = hits.iter().map(|h| h.key.to_string()).collect();
    assert_eq!(
        keys,
        vec!["192.0.2.10:80", "192.0.2.10:443", "[2001:db8::10]:8443"]
    );
    let attrs = &hits[0].attributes;
    assert_eq!(attrs.banner.as_deref(), Some("widget on 80"));
    assert_eq!(attrs.transport.as_deref(), Some("tcp"));
    assert_eq!(attrs.module.as_deref(), Some("http"));
    assert_eq!(attrs.organization.as_deref(), Some("EXAMPLE-AS"));
    assert_eq!(attrs.hostnames, vec!["widget.example.org"]);
    assert_eq!(
        attrs.location.as_ref().and_then(|l| l.country.as_deref()),
        Some("France")
    );
}

#[tokio::test]
async fn test_censys_forbidden_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(path("/v2/hosts/search"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "code": 403,
            "status": "Forbidden",
            "error": "Invalid API credentials"
        })))
        .mount(&server)
        .await;

    let client = CensysClient::new("id", "wrong").unwrap().with_base_url(server.uri());
    let err = client
        .fetch_page(&query(Engine::Censys, "widget"), None)
        .await
        .unwrap_err();
    match err {
        Error::Auth { engine, message } => {
            assert_eq!(engine, Engine::Censys);
            assert_eq!(message, "Invalid API credentials");
        }
        other => panic!("expected auth error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_censys_server_error_is_backend_error() {
    let server = MockServer::start().await;
    Mock::given(path("/v2/hosts/search"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let client = CensysClient::new("id", "secret").unwrap().with_base_url(server.uri());
    let err = client
        .fetch_page(&query(Engine::Censys, "widget"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { engine: Engine::Censys, .. }));
    assert!(!err.is_fatal());
}
