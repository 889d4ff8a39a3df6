use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifies the group of records a photo submission applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetSelector {
    pub segment_id: i32,
    pub model_type: String,
}

impl AssetSelector {
    pub fn new(segment_id: i32, model_type: impl Into<String>) -> Self {
        Self {
            segment_id,
            model_type: model_type.into(),
        }
    }
}

impl fmt::Display for AssetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} / model '{}'", self.segment_id, self.model_type)
    }
}

/// A named photo slot on a record.
///
/// The set is closed: column names reach SQL only through `as_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewColumn {
    ImageData,
    FrontView,
    BackView,
    LeftSideView,
    RightSideView,
}

impl ViewColumn {
    pub const ALL: [ViewColumn; 5] = [
        ViewColumn::ImageData,
        ViewColumn::FrontView,
        ViewColumn::BackView,
        ViewColumn::LeftSideView,
        ViewColumn::RightSideView,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewColumn::ImageData => "image_data",
            ViewColumn::FrontView => "front_view",
            ViewColumn::BackView => "back_view",
            ViewColumn::LeftSideView => "left_side_view",
            ViewColumn::RightSideView => "right_side_view",
        }
    }
}

impl fmt::Display for ViewColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownViewColumn(pub String);

impl fmt::Display for UnknownViewColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown view column '{}'", self.0)
    }
}

impl std::error::Error for UnknownViewColumn {}

impl FromStr for ViewColumn {
    type Err = UnknownViewColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewColumn::ALL
            .iter()
            .copied()
            .find(|column| column.as_str() == s.trim())
            .ok_or_else(|| UnknownViewColumn(s.to_owned()))
    }
}

/// One record's view slot as read from the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub record_id: i64,
    pub selector: AssetSelector,
    pub column: ViewColumn,
    pub current_url: Option<String>,
}

// Object style note:
// Collaborators are injected into the refresher as trait objects and live for
// as long as the caller keeps them (a pooled connection, a shared HTTP client).
// Implementations must not hold per-request state; everything a call needs is
// in its arguments.
