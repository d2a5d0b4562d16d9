//! Remote image download.
//!
//! URLs are only ever logged in redacted form: image URLs routinely carry
//! signed query strings or API keys.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;
use url::Url;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_BACKOFF_MS: u64 = 250;
/// Upper bound on a downloaded body.
pub const MAX_DOWNLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// Synchronous byte source for remote images. Called from blocking
/// contexts only.
pub trait Fetcher: Send + Sync {
    fn download(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    max_attempts: usize,
    max_bytes: u64,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS), DEFAULT_MAX_ATTEMPTS)
    }
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_attempts: usize) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            max_bytes: MAX_DOWNLOAD_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn download_with_retries(&self, url: &Url, redacted_url: &str) -> Result<Vec<u8>> {
        // Built per call: a blocking client must not be created on an async
        // worker thread.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(self.timeout))
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client for image download")?;

        for attempt in 1..=self.max_attempts {
            match self.download_once(&client, url, redacted_url) {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError { retryable, error }) => {
                    if retryable && attempt < self.max_attempts {
                        debug!(
                            url = %redacted_url,
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %error,
                            "download attempt failed; retrying"
                        );

                        let backoff_ms = RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                        continue;
                    }

                    if retryable {
                        return Err(anyhow!(
                            "download failed after {} attempts for {}: {}",
                            self.max_attempts,
                            redacted_url,
                            error
                        ));
                    }

                    return Err(error);
                }
            }
        }

        Err(anyhow!(
            "download failed after {} attempts for {}",
            self.max_attempts,
            redacted_url
        ))
    }

    fn download_once(
        &self,
        client: &reqwest::blocking::Client,
        url: &Url,
        redacted_url: &str,
    ) -> std::result::Result<Vec<u8>, AttemptError> {
        let response = client.get(url.as_str()).send().map_err(|err| {
            let wrapped = anyhow!("failed to start download from {redacted_url}");
            AttemptError::from_reqwest(&err, wrapped)
        })?;

        let status = response.status();
        if !status.is_success() {
            let wrapped = anyhow!(
                "download request returned HTTP {} for {}",
                status.as_u16(),
                redacted_url
            );
            if is_retryable_status(status) {
                return Err(AttemptError::retryable(wrapped));
            }
            return Err(AttemptError::fatal(wrapped));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(AttemptError::fatal(anyhow!(
                    "response from {redacted_url} is {len} bytes, limit is {}",
                    self.max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        response
            .take(self.max_bytes + 1)
            .read_to_end(&mut body)
            .map_err(|err| {
                AttemptError::retryable(
                    anyhow!(err).context(format!("failed while reading HTTP body from {redacted_url}")),
                )
            })?;

        if body.len() as u64 > self.max_bytes {
            return Err(AttemptError::fatal(anyhow!(
                "response from {redacted_url} exceeds {} bytes",
                self.max_bytes
            )));
        }

        Ok(body)
    }
}

impl Fetcher for HttpFetcher {
    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = parse_http_url(url)?;
        let redacted = redacted_url_for_display(&parsed);
        debug!(url = %redacted, "Downloading image");
        let bytes = self.download_with_retries(&parsed, &redacted)?;
        debug!(url = %redacted, bytes = bytes.len(), "Download complete");
        Ok(bytes)
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw.trim()).with_context(|| {
        format!(
            "invalid image URL: {}",
            crate::logging::redact_sensitive_text(raw)
        )
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => {
            let redacted = redacted_url_for_display(&parsed);
            bail!("unsupported image URL scheme '{scheme}' for '{redacted}' (expected http/https)")
        }
    }
}

/// Drops userinfo and replaces the query string.
pub fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    if redacted.query().is_some() {
        redacted.set_query(None);
        return format!("{redacted}?<redacted>");
    }
    redacted.to_string()
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

struct AttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl AttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }

    fn from_reqwest(err: &reqwest::Error, wrapped: anyhow::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::retryable(wrapped)
        } else {
            Self::fatal(wrapped)
        }
    }
}
