//! Upload protocols.
//!
//! An [`UploadProtocol`] ships one archive file to the remote endpoint. The
//! HTTP implementation keeps a pooled `reqwest` client and retries transient
//! failures with exponential backoff; unsupported endpoint schemes resolve to
//! [`UnknownProtocol`], which refuses every upload.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, error, info, warn};

use crate::sample::base_name;
use crate::worker::{Interrupted, Shutdown};

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Header carrying the archive file name.
pub const ARCHIVE_NAME_HEADER: &str = "X-Archive-Name";

/// Errors that can occur while uploading an archive.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(reqwest::Error),

    /// Server returned an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// The archive could not be read
    #[error("Failed to read archive: {0}")]
    Io(#[from] std::io::Error),

    /// All retry attempts exhausted
    #[error("All {attempts} retry attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),

    /// The endpoint URL uses a scheme no protocol handles
    #[error("Unsupported endpoint: {0}")]
    Unsupported(String),

    #[error("Upload interrupted by shutdown")]
    Interrupted,
}

impl From<reqwest::Error> for ProtocolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProtocolError::Timeout
        } else {
            ProtocolError::Request(err)
        }
    }
}

impl From<Interrupted> for ProtocolError {
    fn from(_: Interrupted) -> Self {
        ProtocolError::Interrupted
    }
}

impl ProtocolError {
    /// Check if an error is worth retrying.
    ///
    /// Retryable errors include:
    /// - Connection errors
    /// - Timeouts
    /// - Server errors (5xx)
    /// - Rate limiting (429)
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ProtocolError::Timeout => true,
            ProtocolError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            ProtocolError::Io(_)
            | ProtocolError::RetriesExhausted { .. }
            | ProtocolError::Config(_)
            | ProtocolError::Unsupported(_)
            | ProtocolError::Interrupted => false,
        }
    }
}

/// Transfers one archive file to the remote endpoint.
#[async_trait]
pub trait UploadProtocol: Send + Sync {
    /// Short protocol name for logs.
    fn name(&self) -> &'static str;

    /// Upload the file at `path`. Backoff waits end early on shutdown.
    async fn upload_file(&self, path: &Path, shutdown: &Shutdown) -> Result<(), ProtocolError>;
}

/// HTTP basic authentication credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings shared by the upload protocols.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub credentials: Option<Credentials>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            credentials: None,
        }
    }
}

/// Calculate the backoff delay for a given retry attempt.
///
/// Uses exponential backoff with jitter:
/// delay = min(base_delay * 2^attempt + jitter, max_delay)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_delay = base.as_millis().min(u128::from(u64::MAX)) as u64;

    let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

    // Up to 25% jitter
    let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

    let total_delay = exponential_delay
        .saturating_add(jitter)
        .min(MAX_RETRY_DELAY_MS);

    Duration::from_millis(total_delay)
}

/// Uploads archives as the body of an HTTP POST.
///
/// The client is reused across uploads for connection pooling.
pub struct HttpProtocol {
    client: Client,
    url: Url,
    settings: ProtocolSettings,
}

impl HttpProtocol {
    /// Create a new HTTP protocol for `url`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Config` if the HTTP client cannot be built.
    pub fn new(url: Url, settings: ProtocolSettings) -> Result<Self, ProtocolError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProtocolError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url,
            settings,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Send a single HTTP request without retry logic.
    async fn send_request(&self, name: &str, body: Vec<u8>) -> Result<(), ProtocolError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .timeout(self.settings.request_timeout)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(ARCHIVE_NAME_HEADER, name)
            .body(body);

        if let Some(credentials) = &self.settings.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ProtocolError::Status {
                code: status,
                message,
            })
        }
    }
}

#[async_trait]
impl UploadProtocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn upload_file(&self, path: &Path, shutdown: &Shutdown) -> Result<(), ProtocolError> {
        let body = tokio::fs::read(path).await?;
        let name = base_name(path).unwrap_or_else(|| "archive".to_string());
        let max_retries = self.settings.max_retries;

        debug!(
            archive = %name,
            bytes = body.len(),
            url = %self.url,
            "Uploading archive"
        );

        let mut last_error: Option<ProtocolError> = None;
        let mut attempt = 0;

        while attempt <= max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.settings.retry_base_delay, attempt - 1);
                warn!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                shutdown.sleep(delay).await?;
            }

            let result = tokio::select! {
                r = self.send_request(&name, body.clone()) => r,
                _ = shutdown.triggered() => return Err(ProtocolError::Interrupted),
            };

            match result {
                Ok(()) => {
                    info!(archive = %name, attempts = attempt + 1, "Archive uploaded");
                    return Ok(());
                }
                Err(e) => {
                    let retryable = e.is_retryable();

                    if retryable && attempt < max_retries {
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_retries,
                            "Upload failed, will retry"
                        );
                        last_error = Some(e);
                        attempt += 1;
                    } else if retryable {
                        last_error = Some(e);
                        break;
                    } else {
                        error!(
                            error = %e,
                            attempts = attempt + 1,
                            "Upload failed permanently"
                        );
                        return Err(e);
                    }
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        error!(archive = %name, attempts = max_retries + 1, error = %last_error, "Upload retries exhausted");

        Err(ProtocolError::RetriesExhausted {
            attempts: max_retries + 1,
            last_error,
        })
    }
}

/// Placeholder for endpoints no protocol can handle. Every upload fails.
#[derive(Debug, Clone)]
pub struct UnknownProtocol {
    endpoint: String,
}

impl UnknownProtocol {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UploadProtocol for UnknownProtocol {
    fn name(&self) -> &'static str {
        "unknown"
    }

    async fn upload_file(&self, _path: &Path, _shutdown: &Shutdown) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported(self.endpoint.clone()))
    }
}

/// Pick the protocol for an endpoint URL.
///
/// `http` and `https` map to [`HttpProtocol`]; any other scheme, a malformed
/// URL or a client that cannot be built yields [`UnknownProtocol`].
pub fn protocol_for_url(endpoint: &str, settings: &ProtocolSettings) -> Arc<dyn UploadProtocol> {
    let url = match Url::parse(endpoint) {
        Ok(url) => url,
        Err(e) => {
            warn!(endpoint, error = %e, "Malformed endpoint URL, uploads disabled");
            return Arc::new(UnknownProtocol::new(endpoint));
        }
    };

    match url.scheme() {
        "http" | "https" => match HttpProtocol::new(url, settings.clone()) {
            Ok(protocol) => Arc::new(protocol),
            Err(e) => {
                warn!(endpoint, error = %e, "Failed to build HTTP client, uploads disabled");
                Arc::new(UnknownProtocol::new(endpoint))
            }
        },
        scheme => {
            warn!(endpoint, scheme, "Unsupported endpoint scheme, uploads disabled");
            Arc::new(UnknownProtocol::new(endpoint))
        }
    }
}
