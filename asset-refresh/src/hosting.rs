use crate::types::{RefreshError, Result};
use anyhow::{anyhow, bail, Context};
use asset_interfaces::AssetHost;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const DEFAULT_UPLOAD_ENDPOINT: &str = "https://api.cloudinary.com/v1_1";

#[derive(Clone)]
pub struct HostingConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: Option<String>,
    pub upload_endpoint: String,
    pub timeout_seconds: u64,
}

// Keeps the secret out of logs.
impl fmt::Debug for HostingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostingConfig")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("folder", &self.folder)
            .field("upload_endpoint", &self.upload_endpoint)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl HostingConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).ok_or_else(|| RefreshError::Config(format!("{} is not set", key)));

        let timeout_seconds = match lookup("CLOUDINARY_TIMEOUT_SECONDS") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| RefreshError::Config(format!("CLOUDINARY_TIMEOUT_SECONDS: {}", e)))?,
            None => 60,
        };

        Ok(Self {
            cloud_name: required("CLOUDINARY_CLOUD_NAME")?,
            api_key: required("CLOUDINARY_API_KEY")?,
            api_secret: required("CLOUDINARY_API_SECRET")?,
            folder: lookup("CLOUDINARY_FOLDER"),
            upload_endpoint: lookup("CLOUDINARY_UPLOAD_ENDPOINT").unwrap_or_else(|| DEFAULT_UPLOAD_ENDPOINT.to_string()),
            timeout_seconds,
        })
    }

    pub fn upload_url(&self) -> String {
        format!("{}/{}/image/upload", self.upload_endpoint.trim_end_matches('/'), self.cloud_name)
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    public_id: Option<String>,
}

/// Signed uploads to a Cloudinary account.
pub struct CloudinaryHost {
    client: Client,
    config: HostingConfig,
}

impl CloudinaryHost {
    pub fn new(config: HostingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AssetHost for CloudinaryHost {
    async fn upload(&self, local_path: &Path) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;
        let file_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload")
            .to_string();

        let mut params = BTreeMap::new();
        params.insert("timestamp", Utc::now().timestamp().to_string());
        if let Some(folder) = &self.config.folder {
            params.insert("folder", folder.clone());
        }
        let signature = sign_params(&params, &self.config.api_secret);

        let mut form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name))
            .text("api_key", self.config.api_key.clone())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");
        for (key, value) in params {
            form = form.text(key, value);
        }

        debug!("Uploading {} to {}", local_path.display(), self.config.upload_url());
        let response = self.client.post(self.config.upload_url()).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("upload rejected with HTTP {}: {}", status.as_u16(), body);
        }

        let body: UploadResponse = response.json().await?;
        let url = body
            .secure_url
            .ok_or_else(|| anyhow!("upload response carried no secure_url"))?;

        info!(
            "Uploaded {} as {} ({})",
            local_path.display(),
            body.public_id.as_deref().unwrap_or("?"),
            url
        );
        Ok(url)
    }
}

/// Request signature: parameters sorted by name, joined as `k=v&k=v`,
/// suffixed with the API secret and hashed with SHA-256.
pub fn sign_params(params: &BTreeMap<&str, String>, api_secret: &str) -> String {
    let joined = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Asset host that records uploads instead of sending them anywhere.
pub struct MockAssetHost {
    base_url: String,
    failing: AtomicBool,
    uploads: RwLock<Vec<PathBuf>>,
}

impl MockAssetHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            failing: AtomicBool::new(false),
            uploads: RwLock::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.read().await.clone()
    }

    pub async fn upload_count(&self) -> usize {
        self.uploads.read().await.len()
    }
}

#[async_trait]
impl AssetHost for MockAssetHost {
    async fn upload(&self, local_path: &Path) -> anyhow::Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("mock host is refusing uploads");
        }
        tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;

        let mut uploads = self.uploads.write().await;
        uploads.push(local_path.to_path_buf());
        let name = local_path.file_name().and_then(|name| name.to_str()).unwrap_or("upload");
        Ok(format!("{}/v{}/{}", self.base_url.trim_end_matches('/'), uploads.len(), name))
    }
}
