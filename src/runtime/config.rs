use crate::broker::log::{DEFAULT_COMMIT_BACKOFF, DEFAULT_COMMIT_RETRIES};
use crate::broker::{LogBroker, LogTransport, DEFAULT_RECONNECT_DELAY};
use crate::domain::WorkKind;
use crate::fetch::governor::DEFAULT_MAX_RESPONSE_BYTES;
use crate::fetch::http::{DEFAULT_ORIGIN, DEFAULT_REQUEST_TIMEOUT};
use crate::fetch::{HttpWorkerConfig, ProxyConfig, SearchOptions, DEFAULT_GOVERNOR_CEILING_BYTES};
use crate::gate::{HttpJobStatusClient, DEFAULT_GATE_TIMEOUT};
use crate::pipeline::{BrokerFlavor, Destinations};
use crate::pool::worker_pool::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_INIT_ATTEMPTS, DEFAULT_INIT_BACKOFF, DEFAULT_MAX_POOL_SIZE,
};
use crate::pool::PoolConfig;
use crate::runtime::telemetry;
use crate::search::retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MAX, DEFAULT_RETRY_BACKOFF_MIN,
};
use crate::search::{
    RefineParams, RetryPolicy, DEFAULT_DIVIDER, DEFAULT_MAX_RECURSION_DEPTH,
    DEFAULT_SPLIT_DELAY_MAX, DEFAULT_SPLIT_DELAY_MIN, DEFAULT_THRESHOLD,
};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Runtime configuration for one harvesting pipeline.
///
/// All instances must be constructed via [`HarvesterConfig::builder`] or [`HarvesterConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvesterConfig {
    kind: WorkKind,
    broker_flavor: BrokerFlavor,
    destinations: Destinations,
    max_pool_size: usize,
    idle_timeout: Duration,
    worker_init_attempts: usize,
    worker_init_backoff: Duration,
    max_in_flight: usize,
    threshold: usize,
    divider: usize,
    max_recursion_depth: usize,
    max_retries: usize,
    retry_backoff_min: Duration,
    retry_backoff_max: Duration,
    split_delay_min: Duration,
    split_delay_max: Duration,
    reconnect_delay: Duration,
    commit_retries: usize,
    commit_backoff: Duration,
    origin: String,
    proxy: Option<ProxyConfig>,
    request_timeout: Duration,
    governor_ceiling_bytes: usize,
    max_response_bytes: usize,
    job_status_url: Option<String>,
    gate_timeout: Duration,
    metrics_interval: Duration,
    search_options: SearchOptions,
}

pub struct HarvesterConfigParams {
    pub kind: WorkKind,
    pub broker_flavor: BrokerFlavor,
    pub destinations: Destinations,
    pub max_pool_size: usize,
    pub idle_timeout: Duration,
    pub worker_init_attempts: usize,
    pub worker_init_backoff: Duration,
    pub max_in_flight: usize,
    pub threshold: usize,
    pub divider: usize,
    pub max_recursion_depth: usize,
    pub max_retries: usize,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    pub split_delay_min: Duration,
    pub split_delay_max: Duration,
    pub reconnect_delay: Duration,
    pub commit_retries: usize,
    pub commit_backoff: Duration,
    pub origin: String,
    pub proxy: Option<ProxyConfig>,
    pub request_timeout: Duration,
    pub governor_ceiling_bytes: usize,
    pub max_response_bytes: usize,
    pub job_status_url: Option<String>,
    pub gate_timeout: Duration,
    pub metrics_interval: Duration,
    pub search_options: SearchOptions,
}

impl HarvesterConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> HarvesterConfigBuilder {
        HarvesterConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: HarvesterConfigParams) -> Result<Self> {
        let HarvesterConfigParams {
            kind,
            broker_flavor,
            destinations,
            max_pool_size,
            idle_timeout,
            worker_init_attempts,
            worker_init_backoff,
            max_in_flight,
            threshold,
            divider,
            max_recursion_depth,
            max_retries,
            retry_backoff_min,
            retry_backoff_max,
            split_delay_min,
            split_delay_max,
            reconnect_delay,
            commit_retries,
            commit_backoff,
            origin,
            proxy,
            request_timeout,
            governor_ceiling_bytes,
            max_response_bytes,
            job_status_url,
            gate_timeout,
            metrics_interval,
            search_options,
        } = params;

        let config = Self {
            kind,
            broker_flavor,
            destinations: Destinations {
                source: trimmed_string(destinations.source),
                scraped: trimmed_string(destinations.scraped),
                dead_letter: trimmed_string(destinations.dead_letter),
            },
            max_pool_size,
            idle_timeout,
            worker_init_attempts,
            worker_init_backoff,
            max_in_flight,
            threshold,
            divider,
            max_recursion_depth,
            max_retries,
            retry_backoff_min,
            retry_backoff_max,
            split_delay_min,
            split_delay_max,
            reconnect_delay,
            commit_retries,
            commit_backoff,
            origin: trimmed_string(origin).trim_end_matches('/').to_owned(),
            proxy,
            request_timeout,
            governor_ceiling_bytes,
            max_response_bytes,
            job_status_url: job_status_url.map(trimmed_string),
            gate_timeout,
            metrics_interval,
            search_options,
        };

        config.validate()?;
        Ok(config)
    }

    /// Which of the three pipelines this process runs.
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn broker_flavor(&self) -> BrokerFlavor {
        self.broker_flavor
    }

    /// Source, scraped, and dead-letter names.
    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Upper bound on unsettled deliveries held by one consumer.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn commit_retries(&self) -> usize {
        self.commit_retries
    }

    pub fn commit_backoff(&self) -> Duration {
        self.commit_backoff
    }

    /// Marketplace origin every worker warms up against.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Base URL of the job status service, when one is configured.
    pub fn job_status_url(&self) -> Option<&str> {
        self.job_status_url.as_deref()
    }

    pub fn gate_timeout(&self) -> Duration {
        self.gate_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn search_options(&self) -> &SearchOptions {
        &self.search_options
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.max_pool_size,
            idle_timeout: self.idle_timeout,
            init_attempts: self.worker_init_attempts,
            init_backoff: self.worker_init_backoff,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_min: self.retry_backoff_min,
            backoff_max: self.retry_backoff_max,
        }
    }

    pub fn refine_params(&self) -> RefineParams {
        RefineParams {
            threshold: self.threshold,
            divider: self.divider,
            max_depth: self.max_recursion_depth,
            retry: self.retry_policy(),
            split_delay_min: self.split_delay_min,
            split_delay_max: self.split_delay_max,
        }
    }

    /// Settings shared by every HTTP fetch worker in the pool.
    pub fn worker_config(&self) -> HttpWorkerConfig {
        let mut config = HttpWorkerConfig::new(self.origin.clone());
        config.proxy = self.proxy.clone();
        config.request_timeout = self.request_timeout;
        config.governor_ceiling = self.governor_ceiling_bytes;
        config.max_response_bytes = self.max_response_bytes;
        config
    }

    /// HTTP client for the job status service, when a URL is configured.
    pub fn job_status_client(&self) -> Result<Option<HttpJobStatusClient>> {
        self.job_status_url
            .as_deref()
            .map(|url| HttpJobStatusClient::new(url, self.gate_timeout))
            .transpose()
    }

    /// A log broker over `transport` using this configuration's commit retry.
    pub fn log_broker(&self, transport: Arc<dyn LogTransport>) -> LogBroker {
        LogBroker::new(transport).with_commit_retry(self.commit_retries, self.commit_backoff)
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.destinations.source, "source")?;
        ensure_not_empty(&self.destinations.scraped, "scraped destination")?;
        ensure_not_empty(&self.destinations.dead_letter, "dead-letter destination")?;
        validate_url(&self.origin, "origin")?;
        if let Some(url) = &self.job_status_url {
            validate_url(url, "job_status_url")?;
        }

        if self.max_pool_size == 0 {
            bail!("max_pool_size must be greater than 0");
        }

        if self.idle_timeout.is_zero() {
            bail!("idle_timeout must be greater than 0");
        }

        if self.worker_init_attempts == 0 {
            bail!("worker_init_attempts must be greater than 0");
        }

        if self.max_in_flight == 0 {
            bail!("max_in_flight must be greater than 0");
        }

        if self.threshold == 0 {
            bail!("threshold must be greater than 0");
        }

        if self.divider < 2 {
            bail!("divider must be at least 2 (got {})", self.divider);
        }

        if self.retry_backoff_min > self.retry_backoff_max {
            bail!("retry_backoff_min must not exceed retry_backoff_max");
        }

        if self.split_delay_min > self.split_delay_max {
            bail!("split_delay_min must not exceed split_delay_max");
        }

        if self.reconnect_delay.is_zero() {
            bail!("reconnect_delay must be greater than 0");
        }

        if self.commit_retries == 0 {
            bail!("commit_retries must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.governor_ceiling_bytes == 0 {
            bail!("governor_ceiling_bytes must be greater than 0");
        }

        if self.max_response_bytes == 0 {
            bail!("max_response_bytes must be greater than 0");
        }

        if self.gate_timeout.is_zero() {
            bail!("gate_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct HarvesterConfigBuilder {
    kind: Option<WorkKind>,
    broker_flavor: Option<BrokerFlavor>,
    source: Option<String>,
    scraped_destination: Option<String>,
    dead_letter_destination: Option<String>,
    max_pool_size: Option<usize>,
    idle_timeout: Option<Duration>,
    worker_init_attempts: Option<usize>,
    worker_init_backoff: Option<Duration>,
    max_in_flight: Option<usize>,
    threshold: Option<usize>,
    divider: Option<usize>,
    max_recursion_depth: Option<usize>,
    max_retries: Option<usize>,
    retry_backoff: Option<(Duration, Duration)>,
    split_delay: Option<(Duration, Duration)>,
    reconnect_delay: Option<Duration>,
    commit_retries: Option<usize>,
    commit_backoff: Option<Duration>,
    origin: Option<String>,
    proxy_server: Option<String>,
    proxy_auth: Option<String>,
    request_timeout: Option<Duration>,
    governor_ceiling_bytes: Option<usize>,
    max_response_bytes: Option<usize>,
    job_status_url: Option<String>,
    gate_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    search_options: Option<SearchOptions>,
}

impl HarvesterConfigBuilder {
    pub fn kind(mut self, kind: WorkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn broker_flavor(mut self, flavor: BrokerFlavor) -> Self {
        self.broker_flavor = Some(flavor);
        self
    }

    pub fn source(mut self, name: impl Into<String>) -> Self {
        self.source = Some(name.into());
        self
    }

    pub fn scraped_destination(mut self, name: impl Into<String>) -> Self {
        self.scraped_destination = Some(name.into());
        self
    }

    pub fn dead_letter_destination(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_destination = Some(name.into());
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn worker_init_attempts(mut self, attempts: usize) -> Self {
        self.worker_init_attempts = Some(attempts);
        self
    }

    pub fn worker_init_backoff(mut self, backoff: Duration) -> Self {
        self.worker_init_backoff = Some(backoff);
        self
    }

    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = Some(count);
        self
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn divider(mut self, divider: usize) -> Self {
        self.divider = Some(divider);
        self
    }

    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff = Some((min, max));
        self
    }

    pub fn split_delay(mut self, min: Duration, max: Duration) -> Self {
        self.split_delay = Some((min, max));
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn commit_retries(mut self, retries: usize) -> Self {
        self.commit_retries = Some(retries);
        self
    }

    pub fn commit_backoff(mut self, backoff: Duration) -> Self {
        self.commit_backoff = Some(backoff);
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Proxy egress; `auth` is a `user:pass` pair.
    pub fn proxy(mut self, server: impl Into<String>, auth: Option<&str>) -> Self {
        self.proxy_server = Some(server.into());
        self.proxy_auth = auth.map(str::to_owned);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn governor_ceiling_bytes(mut self, bytes: usize) -> Self {
        self.governor_ceiling_bytes = Some(bytes);
        self
    }

    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = Some(bytes);
        self
    }

    pub fn job_status_url(mut self, url: impl Into<String>) -> Self {
        self.job_status_url = Some(url.into());
        self
    }

    pub fn gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn search_options(mut self, options: SearchOptions) -> Self {
        self.search_options = Some(options);
        self
    }

    pub fn build(self) -> Result<HarvesterConfig> {
        let kind = self.kind.context("kind is required")?;
        let broker_flavor = self.broker_flavor.unwrap_or(BrokerFlavor::Queue);
        let defaults = Destinations::defaults(kind, broker_flavor);
        let max_pool_size = self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let (retry_backoff_min, retry_backoff_max) = self
            .retry_backoff
            .unwrap_or((DEFAULT_RETRY_BACKOFF_MIN, DEFAULT_RETRY_BACKOFF_MAX));
        let (split_delay_min, split_delay_max) = self
            .split_delay
            .unwrap_or((DEFAULT_SPLIT_DELAY_MIN, DEFAULT_SPLIT_DELAY_MAX));
        let proxy = match self.proxy_server {
            Some(server) => Some(match self.proxy_auth.as_deref() {
                Some(auth) => ProxyConfig::with_auth(server, auth)?,
                None => ProxyConfig::new(server)?,
            }),
            None => None,
        };

        let params = HarvesterConfigParams {
            kind,
            broker_flavor,
            destinations: Destinations {
                source: self.source.unwrap_or(defaults.source),
                scraped: self.scraped_destination.unwrap_or(defaults.scraped),
                dead_letter: self.dead_letter_destination.unwrap_or(defaults.dead_letter),
            },
            max_pool_size,
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            worker_init_attempts: self.worker_init_attempts.unwrap_or(DEFAULT_INIT_ATTEMPTS),
            worker_init_backoff: self.worker_init_backoff.unwrap_or(DEFAULT_INIT_BACKOFF),
            max_in_flight: self.max_in_flight.unwrap_or(max_pool_size),
            threshold: self.threshold.unwrap_or(DEFAULT_THRESHOLD),
            divider: self.divider.unwrap_or(DEFAULT_DIVIDER),
            max_recursion_depth: self
                .max_recursion_depth
                .unwrap_or(DEFAULT_MAX_RECURSION_DEPTH),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_backoff_min,
            retry_backoff_max,
            split_delay_min,
            split_delay_max,
            reconnect_delay: self.reconnect_delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
            commit_retries: self.commit_retries.unwrap_or(DEFAULT_COMMIT_RETRIES),
            commit_backoff: self.commit_backoff.unwrap_or(DEFAULT_COMMIT_BACKOFF),
            origin: self.origin.unwrap_or_else(|| DEFAULT_ORIGIN.to_owned()),
            proxy,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            governor_ceiling_bytes: self
                .governor_ceiling_bytes
                .unwrap_or(DEFAULT_GOVERNOR_CEILING_BYTES),
            max_response_bytes: self.max_response_bytes.unwrap_or(DEFAULT_MAX_RESPONSE_BYTES),
            job_status_url: self.job_status_url,
            gate_timeout: self.gate_timeout.unwrap_or(DEFAULT_GATE_TIMEOUT),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            search_options: self.search_options.unwrap_or_default(),
        };

        HarvesterConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str, field: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must start with http:// or https://");
    }
    Ok(())
}
