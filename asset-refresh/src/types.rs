use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use asset_interfaces::{AssetSelector, ViewColumn};
use serde::{Deserialize, Serialize};

use crate::classify::Diagnostics;
use crate::codec::CodecError;

/// A photo submission: new images for some view slots of every record the
/// selector matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(flatten)]
    pub selector: AssetSelector,
    pub image_paths: BTreeMap<ViewColumn, PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ComparisonInput {
    pub new_image: ImageSource,
    pub reference_url: Option<String>,
    pub column: ViewColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeReason {
    NoReference,
    ReferenceDecodeFailed,
    FileMissing,
    NewImageUnreadable,
    DetectionFailed,
    DifferencesDetected,
    NoDifferences,
}

impl OutcomeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeReason::NoReference => "no-reference",
            OutcomeReason::ReferenceDecodeFailed => "reference-decode-failed",
            OutcomeReason::FileMissing => "file-missing",
            OutcomeReason::NewImageUnreadable => "new-image-unreadable",
            OutcomeReason::DetectionFailed => "detection-failed",
            OutcomeReason::DifferencesDetected => "differences-detected",
            OutcomeReason::NoDifferences => "no-differences",
        }
    }
}

impl fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for one (record, view) pair. Built once; `with_asset_url`
/// returns a new value rather than mutating.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub changed: bool,
    pub reason: OutcomeReason,
    pub new_asset_url: Option<String>,
    pub diagnostics: Option<Diagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComparisonOutcome {
    pub fn no_reference() -> Self {
        Self::terminal(false, OutcomeReason::NoReference, None)
    }

    pub fn file_missing(detail: impl Into<String>) -> Self {
        Self::terminal(false, OutcomeReason::FileMissing, Some(detail.into()))
    }

    pub fn new_image_unreadable(detail: impl Into<String>) -> Self {
        Self::terminal(false, OutcomeReason::NewImageUnreadable, Some(detail.into()))
    }

    // An unreadable reference cannot be vouched for, so it must be replaced.
    pub fn reference_unreadable(detail: impl Into<String>) -> Self {
        Self::terminal(true, OutcomeReason::ReferenceDecodeFailed, Some(detail.into()))
    }

    pub fn detection_failed(detail: impl Into<String>) -> Self {
        Self::terminal(false, OutcomeReason::DetectionFailed, Some(detail.into()))
    }

    pub fn from_verdict(changed: bool, diagnostics: Diagnostics) -> Self {
        let reason = if changed {
            OutcomeReason::DifferencesDetected
        } else {
            OutcomeReason::NoDifferences
        };
        Self {
            changed,
            reason,
            new_asset_url: None,
            diagnostics: Some(diagnostics),
            detail: None,
        }
    }

    /// Classify a failure to load the new image.
    pub fn from_new_image_error(error: &CodecError) -> Self {
        match error {
            CodecError::FileMissing { .. } => Self::file_missing(error.to_string()),
            _ => Self::new_image_unreadable(error.to_string()),
        }
    }

    pub fn with_asset_url(self, url: String) -> Self {
        Self {
            new_asset_url: Some(url),
            ..self
        }
    }

    fn terminal(changed: bool, reason: OutcomeReason, detail: Option<String>) -> Self {
        Self {
            changed,
            reason,
            new_asset_url: None,
            diagnostics: None,
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    NoReference,
    FileMissing,
    NewImageUnreadable,
    DetectionFailed,
    NoDifferences,
    DifferencesDetected,
    ReferenceDecodeFailed,
    UploadFailed,
    PersistenceFailed,
    LookupFailed,
    Cancelled,
}

impl UpdateStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            UpdateStatus::FileMissing
                | UpdateStatus::NewImageUnreadable
                | UpdateStatus::DetectionFailed
                | UpdateStatus::UploadFailed
                | UpdateStatus::PersistenceFailed
                | UpdateStatus::LookupFailed
        )
    }
}

impl From<OutcomeReason> for UpdateStatus {
    fn from(reason: OutcomeReason) -> Self {
        match reason {
            OutcomeReason::NoReference => UpdateStatus::NoReference,
            OutcomeReason::ReferenceDecodeFailed => UpdateStatus::ReferenceDecodeFailed,
            OutcomeReason::FileMissing => UpdateStatus::FileMissing,
            OutcomeReason::NewImageUnreadable => UpdateStatus::NewImageUnreadable,
            OutcomeReason::DetectionFailed => UpdateStatus::DetectionFailed,
            OutcomeReason::DifferencesDetected => UpdateStatus::DifferencesDetected,
            OutcomeReason::NoDifferences => UpdateStatus::NoDifferences,
        }
    }
}

/// One entry of the response list, one per (matched record × requested view).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub column: ViewColumn,
    pub record_id: Option<i64>,
    pub status: UpdateStatus,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UpdateResult {
    pub fn from_outcome(column: ViewColumn, record_id: i64, outcome: &ComparisonOutcome) -> Self {
        Self {
            column,
            record_id: Some(record_id),
            status: outcome.reason.into(),
            changed: outcome.changed,
            new_image_url: outcome.new_asset_url.clone(),
            detail: outcome.detail.clone(),
        }
    }

    /// The verdict stood but applying it did not succeed.
    pub fn with_failure(self, status: UpdateStatus, detail: String) -> Self {
        Self {
            status,
            new_image_url: None,
            detail: Some(detail),
            ..self
        }
    }

    pub fn failed(column: ViewColumn, record_id: Option<i64>, status: UpdateStatus, detail: String) -> Self {
        Self {
            column,
            record_id,
            status,
            changed: false,
            new_image_url: None,
            detail: Some(detail),
        }
    }

    pub fn cancelled(column: ViewColumn, record_id: i64) -> Self {
        Self {
            column,
            record_id: Some(record_id),
            status: UpdateStatus::Cancelled,
            changed: false,
            new_image_url: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_image_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Asset-Refresh/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 1,
            retry_delay_ms: 500,
            max_image_size_mb: 25,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Image error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RefreshError>;
