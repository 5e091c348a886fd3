//! Fetch worker backed by a cookie-keeping `reqwest` session routed through
//! the worker's proxy egress.

use super::auth::ProxyConfig;
use super::error::FetchError;
use super::governor::{ByteBudget, DEFAULT_GOVERNOR_CEILING_BYTES, DEFAULT_MAX_RESPONSE_BYTES};
use super::request::{validate_response, FetchRequest, HttpMethod};
use super::worker::{FetchResponse, FetchWorker, WorkerFactory, WorkerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_ORIGIN: &str = "https://turo.com";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpWorkerConfig {
    pub origin: String,
    pub proxy: Option<ProxyConfig>,
    pub request_timeout: Duration,
    /// Byte ceiling for the warm-up navigation.
    pub governor_ceiling: usize,
    /// Byte ceiling for a single API response.
    pub max_response_bytes: usize,
    pub user_agent: String,
}

impl HttpWorkerConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            proxy: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            governor_ceiling: DEFAULT_GOVERNOR_CEILING_BYTES,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

impl Default for HttpWorkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGIN)
    }
}

pub struct HttpFetchWorker {
    id: WorkerId,
    config: Arc<HttpWorkerConfig>,
    session: Mutex<Option<reqwest::Client>>,
    running: AtomicBool,
    destroyed: AtomicBool,
}

impl HttpFetchWorker {
    pub fn new(id: WorkerId, config: Arc<HttpWorkerConfig>) -> Self {
        Self {
            id,
            config,
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.config.request_timeout)
            .user_agent(self.config.user_agent.as_str());

        if let Some(proxy) = &self.config.proxy {
            let mut egress = reqwest::Proxy::all(proxy.server_url())
                .with_context(|| format!("invalid proxy server {}", proxy.server()))?;
            if let Some(header) = proxy.authorization()? {
                egress = egress.custom_http_auth(header);
            }
            builder = builder.proxy(egress);
        }

        builder.build().context("failed to build http session")
    }

    async fn client(&self) -> Result<reqwest::Client, FetchError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(FetchError::WorkerClosed);
        }
        self.session
            .lock()
            .await
            .clone()
            .ok_or(FetchError::WorkerClosed)
    }
}

#[async_trait]
impl FetchWorker for HttpFetchWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn init(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            anyhow::bail!("worker {} was destroyed", self.id);
        }

        let client = self.build_client()?;
        let response = client
            .get(format!("{}/", self.config.origin))
            .header(ACCEPT, "text/html")
            .send()
            .await
            .with_context(|| format!("worker {} warm-up navigation failed", self.id))?;

        let mut budget = ByteBudget::new(self.config.governor_ceiling);
        match read_body(response, &mut budget).await {
            Ok(_) | Err(FetchError::PayloadLimit { .. }) => {}
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("worker {} warm-up read failed", self.id)))
            }
        }

        tracing::debug!(
            worker = self.id,
            bytes = budget.received(),
            "fetch worker session established"
        );

        *self.session.lock().await = Some(client);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let client = self.client().await?;
        let url = format!("{}{}", self.config.origin, request.path);

        let builder = match request.method {
            HttpMethod::Get => client.get(url),
            HttpMethod::Post => client.post(url),
        }
        .header(ACCEPT, "*/*")
        .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
        .header(CONTENT_TYPE, "application/json")
        .query(&request.query);
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                code: status.as_u16(),
            });
        }

        let mut budget = ByteBudget::new(self.config.max_response_bytes);
        let body = read_body(response, &mut budget).await?;
        let body: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| FetchError::MalformedResponse(err.to_string()))?;
        validate_response(request.kind, &body)?;

        Ok(FetchResponse {
            status: status.as_u16(),
            body,
            bytes: budget.received(),
        })
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.session.lock().await.take();
        tracing::debug!(worker = self.id, "fetch worker destroyed");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn read_body(
    mut response: reqwest::Response,
    budget: &mut ByteBudget,
) -> Result<Bytes, FetchError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        budget.admit(chunk.len())?;
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Builds [`HttpFetchWorker`]s that share one configuration.
#[derive(Debug, Clone)]
pub struct HttpWorkerFactory {
    config: Arc<HttpWorkerConfig>,
}

impl HttpWorkerFactory {
    pub fn new(config: HttpWorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl WorkerFactory for HttpWorkerFactory {
    fn build(&self, id: WorkerId) -> Result<Arc<dyn FetchWorker>> {
        Ok(Arc::new(HttpFetchWorker::new(id, self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cell, Coordinate};
    use crate::fetch::request::SearchOptions;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ready_worker(server: &MockServer) -> HttpFetchWorker {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(server)
            .await;
        let worker = HttpFetchWorker::new(1, Arc::new(HttpWorkerConfig::new(server.uri())));
        worker.init().await.expect("init should succeed");
        worker
    }

    fn cell() -> Cell {
        Cell::new(
            Coordinate::new(10.0, 10.0),
            Coordinate::new(8.0, 8.0),
            "US",
            2.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn executes_search_and_validates_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/search"))
            .and(body_partial_json(json!({"filters": {"location": {"type": "boundingbox"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vehicles": [{"id": 1}]})))
            .mount(&server)
            .await;

        let worker = ready_worker(&server).await;
        assert!(worker.is_running());
        let response = worker
            .execute(&FetchRequest::search(&cell(), &SearchOptions::default()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["vehicles"][0]["id"], 1);
        assert!(response.bytes > 0);
    }

    #[tokio::test]
    async fn maps_status_and_shape_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/vehicle/detail"))
            .and(query_param("vehicleId", "404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vehicle/daily_pricing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .mount(&server)
            .await;

        let worker = ready_worker(&server).await;
        let target = crate::domain::VehicleTarget {
            vehicle_id: "404".into(),
            start_date: None,
            end_date: None,
            start_time: None,
            end_time: None,
            country: None,
        };
        let err = worker.execute(&FetchRequest::detail(&target)).await.unwrap_err();
        assert_eq!(err, FetchError::HttpStatus { code: 404 });

        let err = worker.execute(&FetchRequest::pricing(&target)).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn oversized_response_trips_ceiling() {
        let server = MockServer::start().await;
        let vehicles: Vec<_> = (0..500).map(|id| json!({"id": id})).collect();
        Mock::given(method("POST"))
            .and(path("/api/v2/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vehicles": vehicles})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64 * 1024)))
            .mount(&server)
            .await;

        let mut config = HttpWorkerConfig::new(server.uri());
        config.max_response_bytes = 256;
        let worker = HttpFetchWorker::new(2, Arc::new(config));
        worker
            .init()
            .await
            .expect("warm-up past the governor ceiling still counts as established");

        let err = worker
            .execute(&FetchRequest::search(&cell(), &SearchOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::PayloadLimit { limit: 256 });
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_closes_worker() {
        let server = MockServer::start().await;
        let worker = ready_worker(&server).await;

        worker.destroy().await;
        worker.destroy().await;
        assert!(!worker.is_running());

        let err = worker
            .execute(&FetchRequest::search(&cell(), &SearchOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::WorkerClosed);
        assert!(worker.init().await.is_err());
    }

    #[tokio::test]
    async fn init_fails_when_origin_is_unreachable() {
        let config = HttpWorkerConfig::new("http://127.0.0.1:9");
        let worker = HttpFetchWorker::new(3, Arc::new(config));
        assert!(worker.init().await.is_err());
        assert!(!worker.is_running());
    }
}
