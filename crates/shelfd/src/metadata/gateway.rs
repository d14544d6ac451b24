//! Comick HTTP gateway with sticky challenge-bypass fallback.
//!
//! Direct requests are the default. When a direct request trips a
//! Cloudflare challenge, the endpoint goes sticky: every request until
//! `now + direct_retry_interval` routes through the configured bypass
//! proxy. A direct success past the sticky expiry clears the state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shelf_core::eventlog::EventLog;

use super::payload::{
    validate_detail, validate_search, Candidate, ComicDetail, DetailPayload, SearchItem,
};

/// How a gateway call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Success,
    HttpFailure,
    Cancelled,
}

/// One gateway response.
#[derive(Debug, Clone)]
pub struct GatewayResponse<T> {
    pub status: GatewayStatus,
    pub payload: Option<T>,
    pub detail: String,
}

impl<T> GatewayResponse<T> {
    fn success(payload: T) -> Self {
        Self {
            status: GatewayStatus::Success,
            payload: Some(payload),
            detail: String::new(),
        }
    }

    fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::HttpFailure,
            payload: None,
            detail: detail.into(),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: GatewayStatus::Cancelled,
            payload: None,
            detail: String::new(),
        }
    }
}

/// Metadata API seam.
#[async_trait]
pub trait ComickGateway: Send + Sync {
    async fn search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<Vec<Candidate>>;

    async fn comic_detail(
        &self,
        slug: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<ComicDetail>;

    async fn fetch_cover(
        &self,
        b2key: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<Vec<u8>>;
}

/// Challenge body markers, checked alongside the `cf-mitigated` header.
const CHALLENGE_MARKERS: [&str; 3] =
    ["cf_chl_opt", "/cdn-cgi/challenge-platform", "Just a moment"];

fn looks_like_challenge(status: u16, cf_mitigated: Option<&str>, body: &[u8]) -> bool {
    if status != 403 && status != 503 {
        return false;
    }
    if cf_mitigated == Some("challenge") {
        return true;
    }
    let text = String::from_utf8_lossy(body);
    CHALLENGE_MARKERS.iter().any(|marker| text.contains(marker))
}

/// reqwest-backed gateway.
pub struct HttpComickGateway {
    client: reqwest::Client,
    api_base: String,
    covers_base: String,
    proxy_base: Option<String>,
    direct_retry_interval: chrono::Duration,
    sticky: Mutex<HashMap<String, DateTime<Utc>>>,
    log: Arc<dyn EventLog>,
}

impl std::fmt::Debug for HttpComickGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpComickGateway")
            .field("api_base", &self.api_base)
            .field("proxy_configured", &self.proxy_base.is_some())
            .finish_non_exhaustive()
    }
}

struct Fetched {
    status: GatewayStatus,
    body: Vec<u8>,
    detail: String,
}

impl HttpComickGateway {
    pub fn new(
        api_base: String,
        proxy_base: Option<String>,
        direct_retry_interval: Duration,
        request_timeout: Duration,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            covers_base: "https://meo.comick.pictures".to_string(),
            proxy_base,
            direct_retry_interval: chrono::Duration::from_std(direct_retry_interval)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            sticky: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn with_covers_base(mut self, covers_base: String) -> Self {
        self.covers_base = covers_base.trim_end_matches('/').to_string();
        self
    }

    fn endpoint_key(url: &str) -> String {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|host| match u.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })
            .unwrap_or_else(|| url.to_string())
    }

    fn sticky_until(&self, endpoint: &str) -> Option<DateTime<Utc>> {
        self.sticky
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(endpoint)
            .copied()
    }

    fn set_sticky(&self, endpoint: &str, until: DateTime<Utc>) {
        self.sticky
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(endpoint.to_string(), until);
    }

    fn clear_sticky(&self, endpoint: &str) -> bool {
        self.sticky
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(endpoint)
            .is_some()
    }

    async fn send(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<(u16, Option<String>, Vec<u8>)>, String> {
        let request = self.client.get(url);
        let response = tokio::select! {
            response = request.send() => response.map_err(|e| e.to_string())?,
            _ = cancel.cancelled() => return Ok(None),
        };
        let status = response.status().as_u16();
        let cf_mitigated = response
            .headers()
            .get("cf-mitigated")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = tokio::select! {
            body = response.bytes() => body.map_err(|e| e.to_string())?.to_vec(),
            _ = cancel.cancelled() => return Ok(None),
        };
        Ok(Some((status, cf_mitigated, body)))
    }

    async fn route_via_proxy(&self, url: &str, endpoint: &str, cancel: &CancellationToken) -> Fetched {
        let Some(proxy_base) = &self.proxy_base else {
            self.log.warning(
                "metadata.cloudflare.fallback.unavailable",
                "challenge-bypass proxy is not configured",
                &[("endpoint", endpoint.to_string())],
            );
            return Fetched {
                status: GatewayStatus::HttpFailure,
                body: Vec::new(),
                detail: "challenge detected and no bypass proxy configured".to_string(),
            };
        };
        self.log.debug(
            "metadata.cloudflare.fallback.sticky_route",
            "routing request via challenge-bypass proxy",
            &[("endpoint", endpoint.to_string())],
        );
        let encoded = utf8_percent_encode(url, NON_ALPHANUMERIC).to_string();
        let separator = if proxy_base.contains('?') { "&" } else { "?" };
        let proxied = format!("{proxy_base}{separator}url={encoded}");
        match self.send(&proxied, cancel).await {
            Ok(None) => Fetched {
                status: GatewayStatus::Cancelled,
                body: Vec::new(),
                detail: String::new(),
            },
            Err(err) => Fetched {
                status: GatewayStatus::HttpFailure,
                body: Vec::new(),
                detail: format!("proxy request failed: {err}"),
            },
            Ok(Some((status, _, body))) if (200..300).contains(&status) => Fetched {
                status: GatewayStatus::Success,
                body,
                detail: String::new(),
            },
            Ok(Some((status, _, _))) => Fetched {
                status: GatewayStatus::HttpFailure,
                body: Vec::new(),
                detail: format!("proxy returned status {status}"),
            },
        }
    }

    /// Fetch a URL under the sticky-fallback policy.
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Fetched {
        let endpoint = Self::endpoint_key(url);
        let now = Utc::now();

        let sticky = self.sticky_until(&endpoint);
        if matches!(sticky, Some(until) if until > now) {
            return self.route_via_proxy(url, &endpoint, cancel).await;
        }

        match self.send(url, cancel).await {
            Ok(None) => Fetched {
                status: GatewayStatus::Cancelled,
                body: Vec::new(),
                detail: String::new(),
            },
            Err(err) => Fetched {
                status: GatewayStatus::HttpFailure,
                body: Vec::new(),
                detail: format!("request failed: {err}"),
            },
            Ok(Some((status, cf_mitigated, body))) => {
                if looks_like_challenge(status, cf_mitigated.as_deref(), &body) {
                    let until = now + self.direct_retry_interval;
                    self.set_sticky(&endpoint, until);
                    debug!(endpoint = %endpoint, %until, "challenge detected, sticky fallback set");
                    return self.route_via_proxy(url, &endpoint, cancel).await;
                }
                if (200..300).contains(&status) {
                    if sticky.is_some() && self.clear_sticky(&endpoint) {
                        self.log.normal(
                            "metadata.cloudflare.fallback.sticky_cleared",
                            "direct request succeeded, sticky fallback cleared",
                            &[("endpoint", endpoint.clone())],
                        );
                    }
                    return Fetched {
                        status: GatewayStatus::Success,
                        body,
                        detail: String::new(),
                    };
                }
                Fetched {
                    status: GatewayStatus::HttpFailure,
                    body: Vec::new(),
                    detail: format!("status {status}"),
                }
            }
        }
    }

    fn decode<T>(
        fetched: Fetched,
        parse: impl FnOnce(&[u8]) -> Result<T, String>,
    ) -> GatewayResponse<T> {
        match fetched.status {
            GatewayStatus::Cancelled => GatewayResponse::cancelled(),
            GatewayStatus::HttpFailure => GatewayResponse::failure(fetched.detail),
            GatewayStatus::Success => match parse(&fetched.body) {
                Ok(payload) => GatewayResponse::success(payload),
                Err(detail) => GatewayResponse::failure(detail),
            },
        }
    }
}

#[async_trait]
impl ComickGateway for HttpComickGateway {
    async fn search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<Vec<Candidate>> {
        let encoded = utf8_percent_encode(query, NON_ALPHANUMERIC).to_string();
        let url = format!("{}/v1.0/search?q={encoded}&limit=25&page=1", self.api_base);
        let fetched = self.fetch(&url, cancel).await;
        Self::decode(fetched, |body| {
            let items: Vec<SearchItem> = serde_json::from_slice(body)
                .map_err(|e| format!("Malformed payload: {e}"))?;
            validate_search(&items)
        })
    }

    async fn comic_detail(
        &self,
        slug: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<ComicDetail> {
        let url = format!("{}/comic/{slug}", self.api_base);
        let fetched = self.fetch(&url, cancel).await;
        Self::decode(fetched, |body| {
            let payload: DetailPayload = serde_json::from_slice(body)
                .map_err(|e| format!("Malformed payload: {e}"))?;
            validate_detail(&payload)
        })
    }

    async fn fetch_cover(
        &self,
        b2key: &str,
        cancel: &CancellationToken,
    ) -> GatewayResponse<Vec<u8>> {
        let url = format!("{}/{b2key}", self.covers_base);
        let fetched = self.fetch(&url, cancel).await;
        Self::decode(fetched, |body| {
            if body.is_empty() {
                Err("empty cover body".to_string())
            } else {
                Ok(body.to_vec())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shelf_core::eventlog::CapturingLog;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves scripted raw HTTP responses, one per connection.
    struct TestServer {
        base: String,
        hits: Arc<AtomicUsize>,
    }

    fn response(status_line: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n{headers}\r\n{body}",
            body.len()
        )
    }

    async fn spawn_server(responses: Vec<String>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut queued = responses.into_iter();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut buffer = [0u8; 4096];
                let _ = socket.read(&mut buffer).await;
                let payload = queued
                    .next()
                    .unwrap_or_else(|| response("404 Not Found", "", ""));
                let _ = socket.write_all(payload.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        TestServer { base, hits }
    }

    fn gateway(
        api: &TestServer,
        proxy: Option<&TestServer>,
        retry: Duration,
        log: Arc<CapturingLog>,
    ) -> HttpComickGateway {
        HttpComickGateway::new(
            api.base.clone(),
            proxy.map(|p| format!("{}/fetch", p.base)),
            retry,
            Duration::from_secs(5),
            log,
        )
    }

    #[tokio::test]
    async fn direct_success_returns_candidates() {
        let api = spawn_server(vec![response(
            "200 OK",
            "content-type: application/json\r\n",
            r#"[{"hid":"h","slug":"s","title":"T","md_titles":[],"md_covers":[]}]"#,
        )])
        .await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(&api, None, Duration::from_secs(60), log);
        let result = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(result.status, GatewayStatus::Success);
        assert_eq!(result.payload.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn challenge_activates_sticky_and_routes_via_proxy() {
        let api = spawn_server(vec![response(
            "403 Forbidden",
            "cf-mitigated: challenge\r\n",
            "",
        )])
        .await;
        let proxy = spawn_server(vec![
            response("200 OK", "", "[]"),
            response("200 OK", "", "[]"),
        ])
        .await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(&api, Some(&proxy), Duration::from_secs(300), Arc::clone(&log));

        // First call: direct challenge, then proxy.
        let first = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(first.status, GatewayStatus::Success);
        assert_eq!(api.hits.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.hits.load(Ordering::SeqCst), 1);

        // Second call: sticky, no direct attempt.
        let second = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(second.status, GatewayStatus::Success);
        assert_eq!(api.hits.load(Ordering::SeqCst), 1, "no new direct attempt");
        assert_eq!(proxy.hits.load(Ordering::SeqCst), 2);
        assert!(log.contains_id("metadata.cloudflare.fallback.sticky_route"));
    }

    #[tokio::test]
    async fn direct_success_past_expiry_clears_sticky() {
        let api = spawn_server(vec![
            response("503 Service Unavailable", "", "<html>Just a moment</html>"),
            response("200 OK", "", "[]"),
        ])
        .await;
        let proxy = spawn_server(vec![response("200 OK", "", "[]")]).await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(
            &api,
            Some(&proxy),
            Duration::from_millis(50),
            Arc::clone(&log),
        );

        let first = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(first.status, GatewayStatus::Success);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(second.status, GatewayStatus::Success);
        assert_eq!(api.hits.load(Ordering::SeqCst), 2, "direct retried after expiry");
        assert!(log.contains_id("metadata.cloudflare.fallback.sticky_cleared"));
    }

    #[tokio::test]
    async fn challenge_without_proxy_is_an_interruption() {
        let api = spawn_server(vec![response(
            "403 Forbidden",
            "cf-mitigated: challenge\r\n",
            "",
        )])
        .await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(&api, None, Duration::from_secs(60), Arc::clone(&log));
        let result = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(result.status, GatewayStatus::HttpFailure);
        assert!(log.contains_id("metadata.cloudflare.fallback.unavailable"));
    }

    #[tokio::test]
    async fn cancellation_maps_to_cancelled() {
        let api = spawn_server(vec![]).await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(&api, None, Duration::from_secs(60), log);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gw.search("t", &cancel).await;
        assert_eq!(result.status, GatewayStatus::Cancelled);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_failure_with_diagnostic() {
        let api = spawn_server(vec![response(
            "200 OK",
            "",
            r#"[{"slug":"s","title":"T","md_titles":[],"md_covers":[]}]"#,
        )])
        .await;
        let log = Arc::new(CapturingLog::new());
        let gw = gateway(&api, None, Duration::from_secs(60), log);
        let result = gw.search("t", &CancellationToken::new()).await;
        assert_eq!(result.status, GatewayStatus::HttpFailure);
        assert!(result.detail.contains("Malformed payload"), "{}", result.detail);
    }
}
