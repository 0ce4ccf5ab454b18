//! HTTP POST delivery via reqwest.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::Sender;
use super::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER, compute_signature};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{DeliveryOutcome, WorkItem};

pub const ID_HEADER: &str = "X-Webhook-Id";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Settings for [`HttpSender`].
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Whole-request timeout. Keep it below the dispatch lease duration.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("hookq/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpSenderConfig {
    /// Read `sender.timeout_ms` and `sender.user_agent`; missing keys keep
    /// their defaults.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = settings.get_parsed::<u64>("sender.timeout_ms")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(agent) = settings.get("sender.user_agent") {
            config.user_agent = agent.to_string();
        }
        if config.timeout.is_zero() {
            return Err(Error::Config("sender.timeout_ms must be positive".to_string()));
        }
        Ok(config)
    }
}

pub struct HttpSender {
    client: reqwest::Client,
    signing_secret: Option<SecretString>,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            signing_secret: None,
        })
    }

    /// Sign every delivery with this key.
    pub fn with_signing_secret(mut self, secret: SecretString) -> Self {
        self.signing_secret = Some(secret);
        self
    }

    fn build_request(&self, item: &WorkItem, url: Url) -> Result<reqwest::RequestBuilder> {
        let mut request = self
            .client
            .post(url)
            .header(ID_HEADER, item.id.as_str())
            .header(ATTEMPT_HEADER, (item.attempts + 1).to_string());

        let has_content_type = item
            .destination
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
        if !has_content_type {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        for (name, value) in &item.destination.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(ref secret) = self.signing_secret {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string();
            let signature =
                compute_signature(secret.expose_secret().as_bytes(), &timestamp, &item.payload)?;
            request = request
                .header(TIMESTAMP_HEADER, timestamp)
                .header(SIGNATURE_HEADER, signature);
        }

        Ok(request.body(item.payload.clone()))
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn deliver(&self, item: &WorkItem) -> DeliveryOutcome {
        let url = match parse_destination(&item.destination.url) {
            Ok(url) => url,
            Err(reason) => return DeliveryOutcome::PermanentFailure(reason),
        };

        let request = match self.build_request(item, url) {
            Ok(request) => request,
            Err(e) => return DeliveryOutcome::PermanentFailure(e.to_string()),
        };

        match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => classify_transport_error(&e),
        }
    }
}

fn parse_destination(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("malformed destination url: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported destination scheme: {other}")),
    }
}

/// Map a response status to an outcome.
///
/// Throttling (429) and request timeout (408) are worth retrying like server
/// errors; every other client error is permanent. Redirects are followed by
/// the client, so a 3xx that reaches here is treated as permanent too.
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        DeliveryOutcome::TransientFailure(format!("destination returned {status}"))
    } else {
        DeliveryOutcome::PermanentFailure(format!("destination returned {status}"))
    }
}

fn classify_transport_error(e: &reqwest::Error) -> DeliveryOutcome {
    if e.is_builder() {
        // Invalid header names/values; the item will never be sendable.
        DeliveryOutcome::PermanentFailure(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        DeliveryOutcome::TransientFailure(format!("request timed out: {e}"))
    } else if e.is_connect() {
        DeliveryOutcome::TransientFailure(format!("connection failed: {e}"))
    } else {
        DeliveryOutcome::TransientFailure(format!("network error: {e}"))
    }
}
