use crate::types::{FetchConfig, Result};
use backoff::{backoff::Backoff, ExponentialBackoff};
use image::DynamicImage;
use reqwest::Client;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Ways acquiring an image can fail.
///
/// `FetchFailed` is an infrastructure problem (transport, HTTP status) while
/// `DecodeFailed` means bytes arrived but are not a usable image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("file not found: {}", path.display())]
    FileMissing { path: PathBuf },

    #[error("failed to fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("failed to decode {origin}: {reason}")]
    DecodeFailed { origin: String, reason: String },
}

struct FetchFailure {
    retryable: bool,
    reason: String,
}

pub struct ImageCodec {
    client: Client,
    config: FetchConfig,
}

impl ImageCodec {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// `FileMissing` when `path` does not resolve. Reads no image data.
    pub async fn check_local(&self, path: &Path) -> std::result::Result<(), CodecError> {
        match tokio::fs::try_exists(path).await {
            Ok(false) => Err(CodecError::FileMissing {
                path: path.to_path_buf(),
            }),
            // Unreadable metadata surfaces later, when the file is decoded.
            Ok(true) | Err(_) => Ok(()),
        }
    }

    /// Read and decode an image from the local filesystem.
    pub async fn load_local(&self, path: &Path) -> std::result::Result<DynamicImage, CodecError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CodecError::FileMissing {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => {
                return Err(CodecError::DecodeFailed {
                    origin: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        debug!("Read {} bytes from {}", bytes.len(), path.display());
        decode_bytes(&bytes, &path.display().to_string())
    }

    /// Download and decode a hosted image.
    pub async fn fetch_remote(&self, url: &str) -> std::result::Result<DynamicImage, CodecError> {
        let bytes = self.fetch_bytes(url).await?;
        decode_bytes(&bytes, url)
    }

    /// Download raw bytes, retrying transport errors and 5xx responses.
    pub async fn fetch_bytes(&self, url: &str) -> std::result::Result<Vec<u8>, CodecError> {
        if let Err(e) = Url::parse(url) {
            return Err(CodecError::FetchFailed {
                url: url.to_string(),
                reason: format!("invalid URL: {}", e),
            });
        }

        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut backoff = ExponentialBackoff {
            current_interval: retry_delay,
            initial_interval: retry_delay,
            max_interval: retry_delay * 8,
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.timeout_seconds * 2)),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(bytes) => {
                    debug!("Fetched {} ({} bytes)", url, bytes.len());
                    return Ok(bytes);
                }
                Err(failure) => {
                    if failure.retryable && attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}: {}, retrying in {:?}", attempt + 1, url, failure.reason, delay);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }
                    warn!("Giving up on {} after {} attempts: {}", url, attempt + 1, failure.reason);
                    return Err(CodecError::FetchFailed {
                        url: url.to_string(),
                        reason: failure.reason,
                    });
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
        let response = self.client.get(url).send().await.map_err(|e| FetchFailure {
            retryable: true,
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure {
                retryable: status.is_server_error(),
                reason: format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown")),
            });
        }

        let limit = self.config.max_image_size_mb * 1024 * 1024;
        if let Some(content_length) = response.content_length() {
            if content_length as usize > limit {
                return Err(FetchFailure {
                    retryable: false,
                    reason: format!("image too large: {} bytes", content_length),
                });
            }
        }

        let bytes = response.bytes().await.map_err(|e| FetchFailure {
            retryable: true,
            reason: e.to_string(),
        })?;

        if bytes.len() > limit {
            return Err(FetchFailure {
                retryable: false,
                reason: format!("image too large: {} bytes", bytes.len()),
            });
        }

        Ok(bytes.to_vec())
    }
}

/// Decode an in-memory image, guessing the format from its magic bytes.
pub fn decode_bytes(bytes: &[u8], origin: &str) -> std::result::Result<DynamicImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::DecodeFailed {
            origin: origin.to_string(),
            reason: "empty payload".to_string(),
        });
    }

    image::load_from_memory(bytes).map_err(|e| CodecError::DecodeFailed {
        origin: origin.to_string(),
        reason: e.to_string(),
    })
}
