//! Library entrypoint for namekeeper.
//!
//! namekeeper is the durable namespace checkpoint engine of a distributed
//! file system metadata server: it captures the in-memory namespace tree to
//! storage directories behind an atomic rename protocol, verifies images end
//! to end with streaming digests, coordinates with an append-only edit
//! journal, and supports upgrade, rollback, finalize and import transitions
//! between on-disk layout versions.

pub mod checkpoint_engine;
pub mod codec_registry;
pub mod config;
pub mod digest_stream;
pub mod edit_journal;
pub mod image_format;
pub mod namespace;
pub mod save_context;
pub mod storage_set;
pub mod throttle;

pub use checkpoint_engine::{
    CheckpointEngine, CheckpointSignature, CheckpointState, EngineError, StartupOption,
    StorageInfo, UpgradeManager,
};
pub use codec_registry::{CodecRegistry, ImageCodec};
pub use config::CheckpointConfig;
pub use digest_stream::ImageDigest;
pub use edit_journal::{EditJournal, FileEditJournal, JournalError};
pub use image_format::{ImageFormatError, LAYOUT_VERSION};
pub use namespace::{
    Block, DirectoryNode, FileNode, FileUnderConstruction, INode, NamespaceTree, PermissionStatus,
};
pub use save_context::SaveContext;
pub use storage_set::{StorageDirectory, StorageRole, StorageSet};
pub use throttle::BandwidthThrottler;
