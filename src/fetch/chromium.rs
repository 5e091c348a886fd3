//! Browser-backed fetch worker. Each worker owns one headless Chromium
//! process launched behind its proxy egress; calls are issued with `fetch`
//! from inside the page so they carry the browser's cookies and fingerprint.

use super::auth::ProxyConfig;
use super::error::FetchError;
use super::governor::{ByteBudget, DEFAULT_GOVERNOR_CEILING_BYTES, DEFAULT_MAX_RESPONSE_BYTES};
use super::request::{validate_response, FetchRequest, HttpMethod};
use super::worker::{FetchResponse, FetchWorker, WorkerFactory, WorkerId};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingDataReceived, SetBlockedUrLsParams,
};
use chromiumoxide::cdp::browser_protocol::page::StopLoadingParams;
use chromiumoxide::page::Page;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ChromiumWorkerConfig {
    pub origin: String,
    pub proxy: Option<ProxyConfig>,
    pub executable: Option<PathBuf>,
    pub navigation_timeout: Duration,
    /// Byte ceiling for the warm-up navigation.
    pub governor_ceiling: usize,
    /// Byte ceiling for a single API response.
    pub max_response_bytes: usize,
}

impl ChromiumWorkerConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            proxy: None,
            executable: None,
            navigation_timeout: Duration::from_secs(30),
            governor_ceiling: DEFAULT_GOVERNOR_CEILING_BYTES,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// Heavy resources the warm-up never needs.
const BLOCKED_RESOURCES: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.mp4", "*.webm",
    "*.woff", "*.woff2",
];

struct Session {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

pub struct ChromiumFetchWorker {
    id: WorkerId,
    config: Arc<ChromiumWorkerConfig>,
    session: Mutex<Option<Session>>,
    running: AtomicBool,
    destroyed: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct PageFetchResult {
    status: u16,
    #[serde(default)]
    text: String,
    #[serde(default)]
    received: usize,
    /// Set when the page aborted the read past the ceiling.
    #[serde(default)]
    truncated: bool,
}

impl PageFetchResult {
    fn admit(&self, ceiling: usize) -> Result<ByteBudget, FetchError> {
        let mut budget = ByteBudget::new(ceiling);
        if self.truncated {
            budget.admit(self.received.max(ceiling.saturating_add(1)))?;
        }
        budget.admit(self.received.max(self.text.len()))?;
        Ok(budget)
    }
}

/// Feeds chunk sizes into a budget. Returns the budget once it trips, or
/// `None` if the stream ends first.
async fn watch_budget<S>(mut chunks: S, ceiling: usize) -> Option<ByteBudget>
where
    S: Stream<Item = usize> + Unpin,
{
    let mut budget = ByteBudget::new(ceiling);
    while let Some(len) = chunks.next().await {
        if budget.admit(len).is_err() {
            return Some(budget);
        }
    }
    None
}

/// In-page `fetch` that streams the body and aborts once `limit` bytes are read.
fn fetch_script(url: &str, method: &str, body: &str, limit: usize) -> String {
    format!(
        r#"(async () => {{
            const controller = new AbortController();
            const res = await fetch({url}, {{
                method: "{method}",
                headers: {{ "accept": "*/*", "content-type": "application/json" }},
                body: {body},
                mode: "cors",
                credentials: "include",
                signal: controller.signal,
            }});
            const reader = res.body.getReader();
            const decoder = new TextDecoder();
            let received = 0;
            let text = "";
            while (true) {{
                const {{ done, value }} = await reader.read();
                if (done) break;
                received += value.length;
                if (received > {limit}) {{
                    controller.abort();
                    return {{ status: res.status, received, truncated: true }};
                }}
                text += decoder.decode(value, {{ stream: true }});
            }}
            text += decoder.decode();
            return {{ status: res.status, text, received, truncated: false }};
        }})()"#,
        url = serde_json::Value::String(url.to_string()),
    )
}

impl ChromiumFetchWorker {
    pub fn new(id: WorkerId, config: Arc<ChromiumWorkerConfig>) -> Self {
        Self {
            id,
            config,
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--blink-settings=imagesEnabled=false")
            .arg("--autoplay-policy=user-gesture-required");
        if let Some(path) = &self.config.executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(proxy) = &self.config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server()));
        }
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))
    }

    async fn launch(&self) -> Result<Session> {
        let (browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .context("failed to launch Chromium")?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        if let Some(proxy) = &self.config.proxy {
            if let (Some(username), Some(password)) = (proxy.username(), proxy.password()) {
                page.authenticate(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                })
                .await
                .context("failed to apply proxy credentials")?;
            }
        }

        page.execute(EnableParams::default())
            .await
            .context("failed to enable network events")?;
        page.execute(SetBlockedUrLsParams::new(
            BLOCKED_RESOURCES.iter().map(|pattern| pattern.to_string()).collect::<Vec<_>>(),
        ))
        .await
        .context("failed to block heavy resources")?;
        let received = Box::pin(
            page.event_listener::<EventLoadingDataReceived>()
                .await
                .context("failed to watch network traffic")?
                .map(|event| event.encoded_data_length.max(0) as usize),
        );

        let navigation =
            tokio::time::timeout(self.config.navigation_timeout, page.goto(self.config.origin.as_str()));
        tokio::select! {
            navigated = navigation => match navigated {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => bail!("warm-up navigation failed: {e}"),
                Err(_) => bail!(
                    "warm-up navigation timed out after {:?}",
                    self.config.navigation_timeout
                ),
            },
            Some(budget) = watch_budget(received, self.config.governor_ceiling) => {
                if let Err(err) = page.execute(StopLoadingParams::default()).await {
                    tracing::warn!(worker = self.id, error = %err, "failed to stop warm-up navigation");
                }
                tracing::debug!(
                    worker = self.id,
                    bytes = budget.received(),
                    ceiling = budget.ceiling(),
                    "warm-up navigation stopped at governor ceiling"
                );
            }
        }

        Ok(Session {
            browser,
            page,
            handler,
        })
    }
}

#[async_trait]
impl FetchWorker for ChromiumFetchWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn init(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            bail!("worker {} was destroyed", self.id);
        }
        let session = self
            .launch()
            .await
            .with_context(|| format!("worker {} failed to start browser session", self.id))?;
        *self.session.lock().await = Some(session);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(FetchError::WorkerClosed);
        }

        let url = reqwest::Url::parse_with_params(
            &format!("{}{}", self.config.origin, request.path),
            &request.query,
        )
        .map_err(|e| FetchError::Network(e.to_string()))?;
        let method = match request.method {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        };
        let body = match &request.body {
            Some(body) => serde_json::to_string(&body.to_string())
                .map_err(|e| FetchError::Network(e.to_string()))?,
            None => "null".to_string(),
        };
        let script = fetch_script(url.as_str(), method, &body, self.config.max_response_bytes);

        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(FetchError::WorkerClosed)?;
        let result: PageFetchResult = session
            .page
            .evaluate(script)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .into_value()
            .map_err(|e| FetchError::MalformedResponse(format!("{e:?}")))?;
        drop(guard);

        if !(200..300).contains(&result.status) {
            return Err(FetchError::HttpStatus {
                code: result.status,
            });
        }

        let budget = result.admit(self.config.max_response_bytes)?;
        let body: serde_json::Value = serde_json::from_str(&result.text)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
        validate_response(request.kind, &body)?;

        Ok(FetchResponse {
            status: result.status,
            body,
            bytes: budget.received(),
        })
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(err) = session.browser.close().await {
                tracing::warn!(worker = self.id, error = %err, "failed to close browser");
            }
            let _ = session.browser.wait().await;
            session.handler.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumWorkerFactory {
    config: Arc<ChromiumWorkerConfig>,
}

impl ChromiumWorkerFactory {
    pub fn new(config: ChromiumWorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl WorkerFactory for ChromiumWorkerFactory {
    fn build(&self, id: WorkerId) -> Result<Arc<dyn FetchWorker>> {
        Ok(Arc::new(ChromiumFetchWorker::new(id, self.config.clone())))
    }
}
