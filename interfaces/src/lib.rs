pub mod collaborators;
pub mod defs;

pub use collaborators::{AssetHost, RecordStore};
pub use defs::{AssetSelector, StoredAsset, UnknownViewColumn, ViewColumn};
