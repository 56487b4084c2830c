//! The streaming atlas archive: blob store, dataset writers, manifest, and
//! the finalizing container writer.

pub mod blob_store;
pub mod dataset;
pub mod manifest;
pub mod schema;
pub mod writer;

pub use blob_store::{BlobStore, BlobStoreStats, StoredBlob};
pub use dataset::{DatasetWriter, PartMeta, RotationPolicy, WriteError};
pub use manifest::{
    ArchiveSummary, Capability, DatasetMetadata, Integrity, Manifest, PrivacyPolicy,
    RobotsPolicyInfo, StorageParams,
};
pub use writer::{ArchiveWriter, FinalizeError, FinalizeOptions, staging_root};
