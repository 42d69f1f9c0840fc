use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::HarvestError;
use crate::identity::Identity;
use crate::pacing::Pacer;

const MESSAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T, HarvestError> {
        serde_json::from_slice(&self.body).map_err(|err| HarvestError::MalformedResponse {
            context: context.to_string(),
            message: err.to_string(),
        })
    }

    fn message(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return "request failed".to_string();
        }
        trimmed.chars().take(MESSAGE_LIMIT).collect()
    }
}

pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, identity: &Identity) -> Result<HttpResponse, HarvestError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn get(&self, url: &str, identity: &Identity) -> Result<HttpResponse, HarvestError> {
        (**self).get(url, identity)
    }
}

/// Blocking transport. Proxies are fixed per `reqwest` client, so one client
/// is kept per proxy; the user agent is set per request.
pub struct ReqwestTransport {
    timeout: Option<Duration>,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&String>) -> Result<Client, HarvestError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| HarvestError::Http("client cache poisoned".to_string()))?;
        let key = proxy.cloned();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|err| HarvestError::Identity(format!("proxy {proxy}: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, identity: &Identity) -> Result<HttpResponse, HarvestError> {
        let client = self.client_for(identity.proxy.as_ref())?;
        let mut request = client.get(url);
        if let Some(agent) = &identity.user_agent {
            let value = HeaderValue::from_str(agent)
                .map_err(|err| HarvestError::Identity(format!("user agent: {err}")))?;
            request = request.header(USER_AGENT, value);
        }
        let response = request
            .send()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        let status = response.status().as_u16();
        // Some deployments spell it Retry_After.
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .or_else(|| response.headers().get("retry_after"))
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string());
        let body = response
            .bytes()
            .map_err(|err| HarvestError::Http(err.to_string()))?
            .to_vec();
        debug!(url, status, bytes = body.len(), "response received");
        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retryable_statuses: Vec<u16>,
    pub fallback_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryNotice<'a> {
    pub url: &'a str,
    pub status: u16,
    pub attempt: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retryable_statuses: vec![429],
            fallback_delay: Duration::from_secs(5),
        }
    }

    pub fn single_retry() -> Self {
        Self {
            max_retries: 1,
            retryable_statuses: vec![429],
            fallback_delay: Duration::from_secs(5),
        }
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn send_with_retries<T, P>(
        &self,
        transport: &T,
        pacer: &P,
        url: &str,
        identity: &Identity,
        on_retry: &dyn Fn(&RetryNotice<'_>),
    ) -> Result<HttpResponse, HarvestError>
    where
        T: HttpTransport + ?Sized,
        P: Pacer + ?Sized,
    {
        let mut attempt = 0u32;
        loop {
            let response = transport.get(url, identity)?;
            attempt += 1;
            if response.is_success() {
                return Ok(response);
            }
            if !self.is_retryable(response.status) {
                return Err(HarvestError::Status {
                    url: url.to_string(),
                    status: response.status,
                    message: response.message(),
                });
            }
            if attempt > self.max_retries {
                return Err(HarvestError::RateLimited {
                    url: url.to_string(),
                    status: response.status,
                    retry_after: response.retry_after,
                    attempts: attempt,
                });
            }
            let delay = response
                .retry_after
                .as_deref()
                .and_then(|value| parse_retry_after(value, Utc::now()))
                .unwrap_or(self.fallback_delay);
            warn!(
                url,
                status = response.status,
                retry_after = response.retry_after.as_deref().unwrap_or("<missing>"),
                "sleeping {}s before retry",
                delay.as_secs_f64()
            );
            on_retry(&RetryNotice {
                url,
                status: response.status,
                attempt,
                delay,
            });
            pacer.sleep(delay);
        }
    }
}

pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
