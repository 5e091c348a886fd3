//! Proxy egress settings and the `Proxy-Authorization` header derived from
//! a `user:pass` credential pair.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::header::HeaderValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    server: String,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyConfig {
    /// Proxy without credentials. `server` is a `host:port` or full URL.
    pub fn new(server: impl Into<String>) -> Result<Self> {
        let server = server.into().trim().to_owned();
        if server.is_empty() {
            bail!("proxy server cannot be empty");
        }
        Ok(Self {
            server,
            username: None,
            password: None,
        })
    }

    /// Proxy authenticated with a `user:pass` pair.
    pub fn with_auth(server: impl Into<String>, auth: &str) -> Result<Self> {
        let mut config = Self::new(server)?;
        let (username, password) = auth
            .split_once(':')
            .context("proxy auth must be formatted as user:pass")?;
        if username.trim().is_empty() {
            bail!("proxy auth user cannot be empty");
        }
        config.username = Some(username.trim().to_owned());
        config.password = Some(password.to_owned());
        Ok(config)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Server as a URL, defaulting the scheme to `http://`.
    pub fn server_url(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("http://{}", self.server)
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn authorization(&self) -> Result<Option<HeaderValue>> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => build_proxy_auth_header(user, password).map(Some),
            _ => Ok(None),
        }
    }
}

pub(crate) fn build_proxy_auth_header(user: &str, password: &str) -> Result<HeaderValue> {
    let credentials = format!("{user}:{password}");
    let encoded = BASE64_STANDARD.encode(credentials);
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .context("failed to build Proxy-Authorization header")
}
