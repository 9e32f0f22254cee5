//! HTTP discovery client with single-flight semantics.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::cache::{parse_max_age, DiscoveryCache};
use super::DiscoveryError;
use crate::models::Endpoint;

/// Placeholder substituted with the fleet id in the URI pattern.
pub const FLEET_ID_PLACEHOLDER: &str = "{fleet_id}";

/// Discovery response body.
#[derive(Debug, Deserialize)]
struct ServersResponse {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    ipv4: String,
    port: u16,
    #[serde(rename = "locationid")]
    location_id: i64,
    #[serde(rename = "regionid")]
    region_id: String,
}

/// What one HTTP round trip produced, before it is applied to the cache.
#[derive(Debug)]
enum FetchOutcome {
    NotModified {
        max_age: Option<Duration>,
    },
    Fresh {
        etag: Option<String>,
        max_age: Option<Duration>,
        servers: Vec<Endpoint>,
    },
}

type Delivery = (u64, Result<FetchOutcome, DiscoveryError>);

enum Pending {
    Ready(Result<Vec<Endpoint>, DiscoveryError>),
    InFlight {
        rx: oneshot::Receiver<Delivery>,
        handle: JoinHandle<()>,
    },
}

/// Resolves a fleet to its QoS servers. At most one call is in flight.
pub struct DiscoveryClient {
    http: reqwest::Client,
    uri_pattern: String,
    fleet_id: Option<String>,
    cache: DiscoveryCache,
    /// Bumped whenever an outstanding call is superseded.
    generation: u64,
    pending: Option<Pending>,
}

impl DiscoveryClient {
    pub fn new(uri_pattern: &str) -> Self {
        Self::with_client(reqwest::Client::new(), uri_pattern)
    }

    pub fn with_client(http: reqwest::Client, uri_pattern: &str) -> Self {
        Self {
            http,
            uri_pattern: uri_pattern.to_string(),
            fleet_id: None,
            cache: DiscoveryCache::default(),
            generation: 0,
            pending: None,
        }
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    /// Cached servers, including any back-off stamps.
    pub fn servers(&self) -> &[Endpoint] {
        &self.cache.servers
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.pending, Some(Pending::InFlight { .. }))
    }

    /// Point the client at another discovery service. Drops all cached
    /// state and any outstanding call.
    pub fn set_uri_pattern(&mut self, uri_pattern: &str) {
        if self.uri_pattern != uri_pattern {
            self.uri_pattern = uri_pattern.to_string();
            self.invalidate();
        }
    }

    /// Mark a cached server as backed off until `until`.
    pub fn set_backoff(&mut self, endpoint_id: u64, until: chrono::DateTime<Utc>) {
        self.cache.set_backoff(endpoint_id, until);
    }

    /// Start resolving `fleet_id`. Any outstanding call is abandoned and its
    /// outcome never delivered. Must be called from within a tokio runtime.
    pub fn begin(&mut self, fleet_id: &str, timeout: Duration) {
        if self.fleet_id.as_deref() != Some(fleet_id) {
            self.invalidate();
            self.fleet_id = Some(fleet_id.to_string());
        } else {
            self.cancel();
        }

        let now = Utc::now();
        if self.cache.is_fresh(now) {
            let cached = if self.cache.failed && self.cache.servers.is_empty() {
                Err(DiscoveryError::CoolingDown(self.cache.expires_at.unwrap_or(now)))
            } else {
                Ok(self.cache.servers.clone())
            };
            self.pending = Some(Pending::Ready(cached));
            return;
        }

        let url = self.uri_pattern.replace(FLEET_ID_PLACEHOLDER, fleet_id);
        let etag = self.cache.etag.clone();
        let http = self.http.clone();
        let generation = self.generation;
        let (tx, rx) = oneshot::channel();

        tracing::debug!("Discovery: requesting {} (etag: {:?})", url, etag);

        let handle = tokio::spawn(async move {
            let outcome = fetch(&http, &url, etag, timeout).await;
            let _ = tx.send((generation, outcome));
        });

        self.pending = Some(Pending::InFlight { rx, handle });
    }

    /// Outcome of the last `begin`, delivered exactly once.
    pub fn poll(&mut self) -> Option<Result<Vec<Endpoint>, DiscoveryError>> {
        match self.pending.take()? {
            Pending::Ready(result) => Some(result),
            Pending::InFlight { mut rx, handle } => match rx.try_recv() {
                Ok(delivery) => self.complete(delivery),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.pending = Some(Pending::InFlight { rx, handle });
                    None
                }
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(DiscoveryError::Cancelled)),
            },
        }
    }

    /// Wait for the outcome of the last `begin`.
    pub async fn wait(&mut self) -> Result<Vec<Endpoint>, DiscoveryError> {
        match self.pending.take() {
            Some(Pending::Ready(result)) => result,
            Some(Pending::InFlight { rx, .. }) => match rx.await {
                Ok(delivery) => self.complete(delivery).unwrap_or(Err(DiscoveryError::Cancelled)),
                Err(_) => Err(DiscoveryError::Cancelled),
            },
            None => Err(DiscoveryError::Cancelled),
        }
    }

    /// Resolve `fleet_id`, using the cache when it is fresh.
    pub async fn discover(
        &mut self,
        fleet_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.begin(fleet_id, timeout);
        self.wait().await
    }

    fn complete(&mut self, (generation, outcome): Delivery) -> Option<Result<Vec<Endpoint>, DiscoveryError>> {
        if generation != self.generation {
            return None;
        }

        let now = Utc::now();
        let result = match outcome {
            Ok(FetchOutcome::NotModified { max_age }) => {
                self.cache.refresh(now, max_age);
                tracing::debug!(
                    "Discovery: not modified, keeping {} servers",
                    self.cache.servers.len()
                );
                Ok(self.cache.servers.clone())
            }
            Ok(FetchOutcome::Fresh {
                etag,
                max_age,
                servers,
            }) => {
                tracing::info!("Discovery: received {} servers", servers.len());
                self.cache.replace_servers(servers);
                self.cache.etag = etag;
                self.cache.refresh(now, max_age);
                Ok(self.cache.servers.clone())
            }
            Err(e) => {
                tracing::warn!("Discovery failed: {}", e);
                self.cache.mark_failed(now);
                Err(e)
            }
        };
        Some(result)
    }

    fn cancel(&mut self) {
        if let Some(Pending::InFlight { handle, .. }) = self.pending.take() {
            handle.abort();
            tracing::debug!("Discovery: superseded outstanding call");
        }
        self.generation = self.generation.wrapping_add(1);
    }

    fn invalidate(&mut self) {
        self.cancel();
        self.cache = DiscoveryCache::default();
    }
}

async fn fetch(
    http: &reqwest::Client,
    url: &str,
    etag: Option<String>,
    timeout: Duration,
) -> Result<FetchOutcome, DiscoveryError> {
    let mut request = http.get(url).timeout(timeout);
    if let Some(etag) = &etag {
        request = request.header(IF_NONE_MATCH, etag.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| DiscoveryError::Http(e.to_string()))?;

    let status = response.status();
    let max_age = response
        .headers()
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_age);

    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified { max_age });
    }
    if !status.is_success() {
        return Err(DiscoveryError::Status(status.as_u16()));
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = response
        .bytes()
        .await
        .map_err(|e| DiscoveryError::Http(e.to_string()))?;
    let servers = parse_servers(&body)?;

    Ok(FetchOutcome::Fresh {
        etag,
        max_age,
        servers,
    })
}

/// Parse a discovery response body into endpoints.
pub fn parse_servers(body: &[u8]) -> Result<Vec<Endpoint>, DiscoveryError> {
    let parsed: ServersResponse =
        serde_json::from_slice(body).map_err(|e| DiscoveryError::Parse(e.to_string()))?;

    parsed
        .servers
        .into_iter()
        .map(|entry| {
            let ip: Ipv4Addr = entry
                .ipv4
                .parse()
                .map_err(|_| DiscoveryError::Parse(format!("invalid ipv4 address {:?}", entry.ipv4)))?;
            Ok(Endpoint::new(ip, entry.port, entry.location_id, &entry.region_id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{header, HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct FakeQos {
        hits: AtomicUsize,
        revalidations: AtomicUsize,
        failing: AtomicBool,
        max_age: AtomicUsize,
        delay_ms: AtomicUsize,
    }

    fn body_for(fleet: &str) -> String {
        format!(
            r#"{{"servers":[
                {{"ipv4":"10.0.0.1","ipv6":"","port":9000,"locationid":1,"regionid":"{fleet}-eu"}},
                {{"ipv4":"10.0.0.2","ipv6":"","port":9001,"locationid":2,"regionid":"{fleet}-us"}}
            ]}}"#
        )
    }

    async fn handle_servers(
        State(state): State<Arc<FakeQos>>,
        Path(fleet): Path<String>,
        headers: HeaderMap,
    ) -> Response {
        state.hits.fetch_add(1, Ordering::SeqCst);

        let delay = state.delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if state.failing.load(Ordering::SeqCst) {
            return AxumStatus::INTERNAL_SERVER_ERROR.into_response();
        }

        let cache_control = format!("max-age={}", state.max_age.load(Ordering::SeqCst));
        if fleet == "garbage" {
            return (AxumStatus::OK, "not json").into_response();
        }
        if headers.get(header::IF_NONE_MATCH).is_some_and(|v| v == "\"v1\"") {
            state.revalidations.fetch_add(1, Ordering::SeqCst);
            return (AxumStatus::NOT_MODIFIED, [(header::CACHE_CONTROL, cache_control)]).into_response();
        }

        (
            AxumStatus::OK,
            [
                (header::ETAG, "\"v1\"".to_string()),
                (header::CACHE_CONTROL, cache_control),
            ],
            body_for(&fleet),
        )
            .into_response()
    }

    async fn serve(state: Arc<FakeQos>) -> SocketAddr {
        let app = Router::new()
            .route("/v1/fleets/{fleet}/servers", get(handle_servers))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn setup(max_age: usize) -> (Arc<FakeQos>, DiscoveryClient) {
        let state = Arc::new(FakeQos::default());
        state.max_age.store(max_age, Ordering::SeqCst);
        let addr = serve(state.clone()).await;
        let client = DiscoveryClient::new(&format!("http://{}/v1/fleets/{{fleet_id}}/servers", addr));
        (state, client)
    }

    async fn let_cache_expire() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_parse_servers() {
        let servers = parse_servers(body_for("f").as_bytes()).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(servers[0].port, 9000);
        assert_eq!(servers[0].location_id, 1);
        assert_eq!(servers[0].region_id, "f-eu");
        assert!(servers[0].backoff_until.is_none());

        assert!(parse_servers(br#"{"servers":[]}"#).unwrap().is_empty());
        assert!(matches!(parse_servers(b"nope"), Err(DiscoveryError::Parse(_))));
        assert!(matches!(
            parse_servers(br#"{"servers":[{"ipv4":"::1","port":1,"locationid":1,"regionid":"r"}]}"#),
            Err(DiscoveryError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let (state, mut client) = setup(60).await;

        let first = client.discover("prod", TIMEOUT).await.unwrap();
        let second = client.discover("prod", TIMEOUT).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.cache().etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_not_modified_preserves_list() {
        let (state, mut client) = setup(0).await;

        let first = client.discover("prod", TIMEOUT).await.unwrap();
        let_cache_expire().await;
        let second = client.discover("prod", TIMEOUT).await.unwrap();

        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
        assert_eq!(state.revalidations.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_known_good() {
        let (state, mut client) = setup(0).await;

        let good = client.discover("prod", TIMEOUT).await.unwrap();
        let_cache_expire().await;

        state.failing.store(true, Ordering::SeqCst);
        let err = client.discover("prod", TIMEOUT).await.unwrap_err();
        assert_eq!(err, DiscoveryError::Status(500));
        assert!(client.cache().failed);

        // Inside the failure window the last good list is served without a call
        let cached = client.discover("prod", TIMEOUT).await.unwrap();
        assert_eq!(cached, good);
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parse_failure_cools_down() {
        let (state, mut client) = setup(0).await;

        let err = client.discover("garbage", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse(_)));

        let err = client.discover("garbage", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::CoolingDown(_)));
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = DiscoveryClient::new(&format!("http://{}/{{fleet_id}}", addr));
        let err = client.discover("prod", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Http(_)));
    }

    #[tokio::test]
    async fn test_fleet_change_clears_cache() {
        let (state, mut client) = setup(60).await;

        let a = client.discover("alpha", TIMEOUT).await.unwrap();
        let b = client.discover("beta", TIMEOUT).await.unwrap();

        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
        assert_eq!(a[0].region_id, "alpha-eu");
        assert_eq!(b[0].region_id, "beta-eu");
    }

    #[tokio::test]
    async fn test_uri_change_clears_cache() {
        let (_state, mut client) = setup(60).await;
        client.discover("prod", TIMEOUT).await.unwrap();
        assert!(client.cache().etag.is_some());

        client.set_uri_pattern("http://127.0.0.1:1/{fleet_id}");
        assert!(client.cache().etag.is_none());
        assert!(client.servers().is_empty());
    }

    #[tokio::test]
    async fn test_poll_delivers_once() {
        let (state, mut client) = setup(60).await;
        state.delay_ms.store(50, Ordering::SeqCst);

        client.begin("prod", TIMEOUT);
        assert!(client.is_in_flight());

        let mut delivered = None;
        for _ in 0..200 {
            if let Some(result) = client.poll() {
                delivered = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(delivered.unwrap().unwrap().len(), 2);
        assert!(client.poll().is_none());
        assert!(!client.is_in_flight());
    }

    #[tokio::test]
    async fn test_superseded_call_never_delivers() {
        let (state, mut client) = setup(60).await;
        state.delay_ms.store(100, Ordering::SeqCst);

        client.begin("alpha", TIMEOUT);
        client.begin("beta", TIMEOUT);

        let servers = client.wait().await.unwrap();
        assert_eq!(servers[0].region_id, "beta-eu");
        assert!(client.poll().is_none());

        // The abandoned alpha call must not have populated the cache
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.servers()[0].region_id, "beta-eu");
    }

    #[tokio::test]
    async fn test_backoff_survives_refresh() {
        let (state, mut client) = setup(0).await;
        let servers = client.discover("prod", TIMEOUT).await.unwrap();

        let until = Utc::now() + chrono::Duration::minutes(3);
        client.set_backoff(servers[1].id(), until);

        // Force a full 200 response instead of a 304
        let_cache_expire().await;
        client.cache.etag = None;
        let refreshed = client.discover("prod", TIMEOUT).await.unwrap();

        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed[0].backoff_until, None);
        assert_eq!(refreshed[1].backoff_until, Some(until));
    }
}
