pub mod types;
pub mod codec;
pub mod config;
pub mod normalize;
pub mod difference;
pub mod classify;
pub mod detector;
pub mod store;
pub mod hosting;
pub mod executor;
pub mod refresher;

pub use types::*;
pub use codec::{CodecError, ImageCodec};
pub use config::{AppConfig, ClaheConfig, DetectorConfig, DetectorPreset, NormalizationPolicy};
pub use classify::{ChangeClassifier, Diagnostics, Verdict};
pub use detector::ChangeDetector;
pub use store::{InMemoryRecordStore, PgRecordStore, RecordKind};
pub use hosting::{CloudinaryHost, HostingConfig, MockAssetHost};
pub use executor::UpdateExecutor;
pub use refresher::{AssetRefresher, CancelToken};
