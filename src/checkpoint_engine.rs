//! Checkpoint Engine Module
//!
//! The orchestrator of namespace persistence: formatting, startup recovery
//! and image selection, the saveNamespace protocol with one writer per image
//! directory, the upload-and-roll state machine driven by a secondary actor,
//! and the upgrade / rollback / finalize / import transitions.
//!
//! The engine's public operations are designed for a single driving thread;
//! callers serialize concurrent save/roll/restore through one external mutex.
//! `&mut self` receivers enforce that in safe Rust.

use rand::Rng;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::codec_registry::CodecRegistry;
use crate::config::{CheckpointConfig, ConfigError};
use crate::digest_stream::ImageDigest;
use crate::edit_journal::{EditJournal, FileEditJournal, JournalError};
use crate::image_format::{
    self, ImageFormatError, LoadOptions, SaveOptions, FEATURE_IMAGE_DIGEST, LAYOUT_VERSION,
};
use crate::namespace::NamespaceTree;
use crate::save_context::{SaveCancelled, SaveContext};
use crate::storage_set::{
    delete_dir, rename_overwrite, ImageFile, StorageDirectory, StorageError, StorageRole,
    StorageSet, StorageState, VersionProperties,
};

/// How the surrounding server was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOption {
    Regular,
    Upgrade,
    Rollback,
    Import,
}

/// State machine driving the secondary actor's upload-and-roll protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Start,
    RolledEdits,
    UploadStart,
    UploadDone,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointState::Start => "START",
            CheckpointState::RolledEdits => "ROLLED_EDITS",
            CheckpointState::UploadStart => "UPLOAD_START",
            CheckpointState::UploadDone => "UPLOAD_DONE",
        };
        f.write_str(name)
    }
}

/// Persistent identity of the namespace storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    /// Negative, monotonic in generation; more negative is newer.
    pub layout_version: i32,
    /// Generated once at format time, uniform across directories.
    pub namespace_id: i32,
    /// Changes only on upgrade.
    pub ctime: i64,
}

/// Token a secondary actor carries through a checkpoint round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSignature {
    pub layout_version: i32,
    pub namespace_id: i32,
    pub ctime: i64,
    pub checkpoint_time: i64,
    pub edits_mtime: i64,
    pub image_digest: ImageDigest,
}

/// Pending distributed-upgrade bookkeeping, answering the engine's questions
/// about a cluster-wide upgrade.
pub trait UpgradeManager: Send {
    fn upgrade_state(&self) -> bool;
    fn upgrade_version(&self) -> i32;
    /// Returns true when a distributed upgrade was started and its state
    /// must be persisted.
    fn initialize_upgrade(&mut self) -> bool;
}

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Image(#[from] ImageFormatError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cancelled(#[from] SaveCancelled),

    #[error("inconsistent storage detected: {detail}")]
    InconsistentStorage { detail: String },

    #[error("namespace storage is not formatted")]
    NotFormatted,

    #[error("{operation} requires checkpoint state {expected}, current state is {state}")]
    ProtocolOrdering {
        operation: &'static str,
        expected: &'static str,
        state: CheckpointState,
    },

    #[error("checkpoint signature mismatch: {detail}")]
    SignatureMismatch { detail: String },

    #[error("image layout version {found} requires an upgrade to {current}; restart with the upgrade option")]
    UpgradeRequired { found: i32, current: i32 },

    #[error("a distributed upgrade to version {version} is in progress; restart with the upgrade option")]
    UpgradeInProgress { version: i32 },

    #[error("cannot upgrade: storage directory {dir:?} holds a previous state; finalize or roll back first")]
    PreviousStateExists { dir: PathBuf },

    #[error("cannot roll back: no storage directory holds a previous state")]
    CannotRollback,

    #[error("no image storage directories left")]
    NoImageStorage,
}

pub type EngineResult<T> = Result<T, EngineError>;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn new_namespace_id() -> i32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(1..=i32::MAX)
}

fn stio(dir: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        dir: dir.to_path_buf(),
        source,
    }
}

/// The persistent namespace checkpoint engine.
pub struct CheckpointEngine {
    config: CheckpointConfig,
    storage: StorageSet,
    journal: Box<dyn EditJournal>,
    upgrade_manager: Option<Box<dyn UpgradeManager>>,
    codecs: CodecRegistry,
    context: SaveContext,
    info: StorageInfo,
    checkpoint_time: i64,
    image_digest: Option<ImageDigest>,
    checkpoint_image_digest: Option<ImageDigest>,
    state: CheckpointState,
    distributed_upgrade: Option<i32>,
    upgrade_finalized: bool,
    restore_failed_storage: bool,
}

impl CheckpointEngine {
    /// Build an engine over the configured directories. No disk state is
    /// touched until `format` or `recover_transition_read` runs.
    pub fn new(config: CheckpointConfig, journal: Box<dyn EditJournal>) -> EngineResult<Self> {
        config.validate()?;
        let codecs = CodecRegistry::with_defaults();
        if config.compress_image {
            let name = config.compression_codec.as_deref().unwrap_or_default();
            if codecs.get(name).is_none() {
                return Err(EngineError::Config(ConfigError::Invalid {
                    reason: format!("compression codec {:?} is not registered", name),
                }));
            }
        }
        let storage = StorageSet::configure(&config.image_dirs, &config.edits_dirs);
        let restore_failed_storage = config.restore_failed_storage;
        Ok(Self {
            config,
            storage,
            journal,
            upgrade_manager: None,
            codecs,
            context: SaveContext::new(),
            info: StorageInfo {
                layout_version: LAYOUT_VERSION,
                namespace_id: 0,
                ctime: 0,
            },
            checkpoint_time: -1,
            image_digest: None,
            checkpoint_image_digest: None,
            state: CheckpointState::Start,
            distributed_upgrade: None,
            upgrade_finalized: false,
            restore_failed_storage,
        })
    }

    pub fn with_upgrade_manager(mut self, manager: Box<dyn UpgradeManager>) -> Self {
        self.upgrade_manager = Some(manager);
        self
    }

    pub fn storage(&self) -> &StorageSet {
        &self.storage
    }

    pub fn storage_info(&self) -> StorageInfo {
        self.info
    }

    pub fn checkpoint_time(&self) -> i64 {
        self.checkpoint_time
    }

    pub fn image_digest(&self) -> Option<ImageDigest> {
        self.image_digest
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.state
    }

    pub fn journal(&mut self) -> &mut dyn EditJournal {
        self.journal.as_mut()
    }

    pub fn is_upgrade_finalized(&self) -> bool {
        self.upgrade_finalized
    }

    pub fn set_restore_failed_storage(&mut self, restore: bool) {
        info!("setting restore failed storage: {}", restore);
        self.restore_failed_storage = restore;
    }

    /// Request cooperative cancellation of an in-flight save.
    pub fn cancel_save_namespace(&self, reason: &str) {
        self.context.cancel(reason);
    }

    /// Release all locks and close the journal.
    pub fn close(&mut self) -> EngineResult<()> {
        self.journal.close()?;
        self.storage.unlock_all();
        Ok(())
    }

    fn edits_paths(&self) -> Vec<PathBuf> {
        self.storage
            .iter_role(StorageRole::Edits)
            .map(|d| d.image_file(ImageFile::Edits))
            .collect()
    }

    fn sync_journal(&mut self) {
        let paths = self.edits_paths();
        self.journal.attach(paths);
    }

    fn evict(&mut self, root: &Path, cause: &str) {
        if let Some(role) = self.storage.evict(root, cause) {
            if role.includes_edits() {
                self.journal.process_io_error(root);
            }
        }
    }

    fn evict_all(&mut self, roots: &[PathBuf], cause: &str) -> EngineResult<()> {
        for root in roots {
            self.evict(root, cause);
        }
        self.storage.check_not_empty()?;
        Ok(())
    }

    /// Bump the checkpoint generation. Wall-clock driven, but always
    /// strictly increasing.
    fn renew_checkpoint_time(&mut self) {
        self.checkpoint_time = now_millis().max(self.checkpoint_time + 1);
    }

    fn version_properties(&self) -> VersionProperties {
        VersionProperties {
            layout_version: self.info.layout_version,
            namespace_id: self.info.namespace_id,
            ctime: self.info.ctime,
            distributed_upgrade_state: self.distributed_upgrade.is_some(),
            distributed_upgrade_version: self.distributed_upgrade,
            image_digest: if self.info.layout_version <= FEATURE_IMAGE_DIGEST {
                self.image_digest
            } else {
                None
            },
        }
    }

    /// Write `fstime` then `VERSION` (always last) into one directory.
    fn write_dir_version(&self, dir: &StorageDirectory) -> Result<(), StorageError> {
        dir.write_fstime(self.checkpoint_time)?;
        dir.write_version(&self.version_properties())
    }

    /// Create a new namespace in every configured directory. Destroys any
    /// existing state there.
    pub fn format(&mut self, tree: &NamespaceTree) -> EngineResult<()> {
        self.info = StorageInfo {
            layout_version: LAYOUT_VERSION,
            namespace_id: new_namespace_id(),
            ctime: 0,
        };
        self.renew_checkpoint_time();

        for dir in self.storage.iter_mut() {
            dir.clear()?;
            dir.lock()?;
        }

        self.context.clear();
        self.context.set_tx_id(self.journal.last_written_tx_id());
        self.save_current_all(tree, false)?;
        self.sync_journal();

        for dir in self.storage.iter() {
            info!("storage directory {:?} has been successfully formatted", dir.root());
        }
        Ok(())
    }

    /// Save images (in parallel), create empty edits, then stamp `fstime`
    /// and `VERSION` in every active directory.
    fn save_current_all(&mut self, tree: &NamespaceTree, force_uncompressed: bool) -> EngineResult<()> {
        let results = self.save_images_parallel(tree, force_uncompressed);
        let mut failed = Vec::new();
        for (root, result) in results {
            match result {
                Ok(digest) => self.image_digest = Some(digest),
                Err(ImageFormatError::Cancelled(_)) => {}
                Err(e) => {
                    error!("unable to write image under {:?}: {}", root, e);
                    failed.push(root);
                }
            }
        }
        self.evict_all(&failed, "image save failed")?;
        self.context.check_cancelled()?;
        if self.storage.iter_role(StorageRole::Image).next().is_none() {
            return Err(EngineError::NoImageStorage);
        }

        let mut failed = Vec::new();
        for dir in self.storage.iter_role(StorageRole::Edits) {
            let edits = dir.image_file(ImageFile::Edits);
            if let Err(e) = self.journal.create_edit_log_file(&edits) {
                error!("unable to create edits under {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "edits creation failed")?;

        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = self.write_dir_version(dir) {
                error!("unable to write VERSION under {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "VERSION write failed")?;
        Ok(())
    }

    /// One writer per image directory, joined before returning.
    fn save_images_parallel(
        &self,
        tree: &NamespaceTree,
        force_uncompressed: bool,
    ) -> Vec<(PathBuf, Result<ImageDigest, ImageFormatError>)> {
        let targets: Vec<(PathBuf, PathBuf)> = self
            .storage
            .iter_role(StorageRole::Image)
            .map(|d| (d.root().to_path_buf(), d.image_file(ImageFile::Image)))
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let codec = if self.config.compress_image && !force_uncompressed {
            self.config
                .compression_codec
                .as_deref()
                .and_then(|name| self.codecs.get(name))
        } else {
            None
        };
        let layout_version = self.info.layout_version;
        let namespace_id = self.info.namespace_id;
        let context = self.context.clone();

        std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .into_iter()
                .map(|(root, target)| {
                    let context = context.clone();
                    let codec = codec.clone();
                    scope.spawn(move || {
                        info!("saving image to {:?}", target);
                        let opts = SaveOptions {
                            layout_version,
                            namespace_id,
                            codec: codec.as_deref(),
                            context: &context,
                        };
                        (root, image_format::save_image(tree, &target, &opts))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("image saver panicked"))
                .collect()
        })
    }

    /// The saveNamespace protocol: quiesce the journal, stage `current`
    /// aside, write fresh images and edits, stamp versions, retire the prior
    /// checkpoint, and reopen the journal.
    pub fn save_namespace(
        &mut self,
        tree: &NamespaceTree,
        force_uncompressed: bool,
        renew_checkpoint_time: bool,
    ) -> EngineResult<()> {
        let result = self.save_namespace_inner(tree, force_uncompressed, renew_checkpoint_time);
        // The context survives the save so that a cancel requested at any
        // point before completion is observed; reset it only on the way out.
        self.context.clear();
        result
    }

    fn save_namespace_inner(
        &mut self,
        tree: &NamespaceTree,
        force_uncompressed: bool,
        renew_checkpoint_time: bool,
    ) -> EngineResult<()> {
        if self.restore_failed_storage {
            self.attempt_restore_removed_storage();
        }

        self.journal.close()?;
        if renew_checkpoint_time {
            self.renew_checkpoint_time();
        }

        // mv current -> lastcheckpoint.tmp
        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = stage_current(dir) {
                error!("unable to stage current for {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "checkpoint staging failed")?;

        self.context.set_tx_id(self.journal.last_written_tx_id());
        self.context.set_total_nodes(tree.num_nodes());

        let results = self.save_images_parallel(tree, force_uncompressed);
        let mut failed = Vec::new();
        let mut digest = None;
        for (root, result) in results {
            match result {
                Ok(d) => digest = Some(d),
                Err(ImageFormatError::Cancelled(_)) => {
                    warn!("image saver for {:?} observed cancellation", root);
                }
                Err(e) => {
                    error!("unable to write image under {:?}: {}", root, e);
                    failed.push(root);
                }
            }
        }

        if self.context.is_cancelled() {
            for root in &failed {
                self.evict(root, "image save failed");
            }
            self.revert_cancelled_checkpoint()?;
            if !self.journal.is_open() {
                self.journal.open()?;
            }
            self.context.check_cancelled()?;
        }

        self.evict_all(&failed, "image save failed")?;
        if self.storage.iter_role(StorageRole::Image).next().is_none() {
            return Err(EngineError::NoImageStorage);
        }
        self.image_digest = digest;

        // If the set mixes image-only and edits-only directories and the
        // process dies here, the image directories carry the newest state.
        // Startup repairs the edits directories from lastcheckpoint.tmp and
        // discards them by their older checkpoint time.

        let mut failed = Vec::new();
        for dir in self.storage.iter_role(StorageRole::Edits) {
            let edits = dir.image_file(ImageFile::Edits);
            if let Err(e) = self.journal.create_edit_log_file(&edits) {
                error!("unable to create edits under {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "edits creation failed")?;

        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = self.write_dir_version(dir) {
                error!("unable to write VERSION under {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "VERSION write failed")?;

        // mv lastcheckpoint.tmp -> previous.checkpoint
        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = retire_checkpoint(dir) {
                error!("unable to retire checkpoint for {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "checkpoint retirement failed")?;

        self.sync_journal();
        if !self.journal.is_open() {
            self.journal.open()?;
        }
        self.state = CheckpointState::UploadDone;
        Ok(())
    }

    /// Roll `lastcheckpoint.tmp` back over `current` in every directory
    /// after a cancelled save.
    fn revert_cancelled_checkpoint(&mut self) -> EngineResult<()> {
        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            info!("reverting checkpoint for {:?}", dir.current_dir());
            let staged = dir.last_checkpoint_tmp();
            if !staged.exists() {
                warn!(
                    "reverting checkpoint: {:?} has no staged state",
                    dir.root()
                );
                failed.push(dir.root().to_path_buf());
                continue;
            }
            let result = (|| -> std::io::Result<()> {
                let current = dir.current_dir();
                if current.exists() {
                    delete_dir(&current)?;
                }
                fs::rename(&staged, &current)
            })();
            if let Err(e) = result {
                warn!("unable to revert checkpoint for {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "checkpoint revert failed")?;
        self.sync_journal();
        Ok(())
    }

    /// Re-accept evicted directories whose paths are writable again. The
    /// caller must hold the same lock that serializes saves.
    pub fn attempt_restore_removed_storage(&mut self) {
        let restored = self.storage.attempt_restore();
        if !restored.is_empty() {
            self.sync_journal();
        }
    }

    /// Analyze and recover every storage directory, run the startup
    /// transition, and load the namespace. Returns whether the image should
    /// be re-saved.
    pub fn recover_transition_read(
        &mut self,
        tree: &mut NamespaceTree,
        startup: StartupOption,
    ) -> EngineResult<bool> {
        if startup == StartupOption::Import {
            if self.config.checkpoint_dirs.is_empty() || self.config.checkpoint_edits_dirs.is_empty()
            {
                return Err(EngineError::Config(ConfigError::Invalid {
                    reason: "import requires checkpoint and checkpoint edits directories"
                        .to_string(),
                }));
            }
        }

        let mut recovered = false;
        let mut is_formatted = false;
        let mut states = Vec::new();
        for dir in self.storage.iter_mut() {
            let state = dir.analyze();
            match state {
                StorageState::NonExistent => {
                    return Err(EngineError::Storage(StorageError::NonExistent {
                        dir: dir.root().to_path_buf(),
                    }));
                }
                StorageState::NotFormatted => {
                    dir.lock()?;
                }
                StorageState::Normal => {
                    dir.lock()?;
                }
                StorageState::NeedsRecovery => {
                    dir.lock()?;
                    recovered |= dir.recover()?;
                }
            }
            states.push((dir.root().to_path_buf(), state));
        }

        // Read and cross-check every formatted directory.
        let mut seen_info: Option<StorageInfo> = None;
        self.upgrade_finalized = true;
        for dir in self.storage.iter() {
            self.upgrade_finalized &= !dir.previous_dir().exists();
            if !dir.version_file().exists() {
                continue;
            }
            let props = dir.read_version()?;
            if startup == StartupOption::Import {
                return Err(EngineError::InconsistentStorage {
                    detail: format!(
                        "cannot import a checkpoint: {:?} already contains an image",
                        dir.root()
                    ),
                });
            }
            let info = StorageInfo {
                layout_version: props.layout_version,
                namespace_id: props.namespace_id,
                ctime: props.ctime,
            };
            match seen_info {
                None => seen_info = Some(info),
                Some(seen) if seen.namespace_id != info.namespace_id => {
                    return Err(EngineError::InconsistentStorage {
                        detail: format!(
                            "namespace id {} in {:?} does not match {}",
                            info.namespace_id,
                            dir.root(),
                            seen.namespace_id
                        ),
                    });
                }
                Some(_) => {}
            }
            if props.distributed_upgrade_state {
                self.distributed_upgrade =
                    Some(props.distributed_upgrade_version.unwrap_or(props.layout_version));
            }
            self.image_digest = props.image_digest;
            is_formatted = true;
        }

        if !is_formatted && startup != StartupOption::Rollback && startup != StartupOption::Import {
            return Err(EngineError::NotFormatted);
        }
        if let Some(info) = seen_info {
            self.info = info;
        }

        // Layout and distributed-upgrade gating.
        if startup != StartupOption::Upgrade && startup != StartupOption::Rollback {
            if is_formatted && self.info.layout_version > LAYOUT_VERSION {
                return Err(EngineError::UpgradeRequired {
                    found: self.info.layout_version,
                    current: LAYOUT_VERSION,
                });
            }
            if startup != StartupOption::Import {
                if let Some(version) = self.distributed_upgrade {
                    return Err(EngineError::UpgradeInProgress { version });
                }
            }
        }

        // Clear unformatted directories so a later save can populate them.
        for (root, state) in &states {
            if *state == StorageState::NotFormatted {
                let dir = self
                    .storage
                    .iter()
                    .find(|d| d.root() == root.as_path())
                    .expect("directory still active");
                info!("storage directory {:?} is not formatted, clearing", root);
                if !dir.is_empty()? {
                    return Err(EngineError::InconsistentStorage {
                        detail: format!("unformatted storage directory {:?} is not empty", root),
                    });
                }
                dir.clear()?;
            }
        }

        match startup {
            StartupOption::Upgrade => {
                self.do_upgrade(tree)?;
                return Ok(false);
            }
            StartupOption::Import => {
                self.do_import_checkpoint(tree)?;
                return Ok(true);
            }
            StartupOption::Rollback => {
                self.do_rollback()?;
            }
            StartupOption::Regular => {}
        }

        let mut need_to_save = self.load_namespace(tree)?;
        need_to_save |= recovered;
        need_to_save |= self.config.save_on_start;

        self.sync_journal();
        if !self.journal.is_open() {
            self.journal.open()?;
        }
        Ok(need_to_save)
    }

    /// Choose the newest image and edits, repair interrupted checkpoints,
    /// load the image, and merge the edits.
    fn load_namespace(&mut self, tree: &mut NamespaceTree) -> EngineResult<bool> {
        let mut need_to_save = false;
        let mut latest_image: Option<(PathBuf, i64)> = None;
        let mut latest_edits: Option<(PathBuf, i64)> = None;
        let mut image_dirs_scanned = Vec::new();
        let mut edits_dirs_scanned = Vec::new();
        let mut seen_time: Option<i64> = None;

        for dir in self.storage.iter() {
            if !dir.version_file().exists() {
                // Freshly cleared directory; a save will repopulate it.
                need_to_save = true;
                continue;
            }
            let time = dir.read_fstime()?;
            if time <= 0 {
                need_to_save = true;
            }
            match seen_time {
                None => seen_time = Some(time),
                Some(seen) if seen != time => need_to_save = true,
                Some(_) => {}
            }

            if dir.role().includes_image() {
                image_dirs_scanned.push(dir.root().to_path_buf());
                if dir.image_file(ImageFile::Image).exists()
                    && latest_image.as_ref().map(|(_, t)| time > *t).unwrap_or(true)
                {
                    latest_image = Some((dir.root().to_path_buf(), time));
                }
            }
            if dir.role().includes_edits() {
                edits_dirs_scanned.push(dir.root().to_path_buf());
                if dir.image_file(ImageFile::EditsNew).exists() {
                    need_to_save = true;
                }
                if dir.image_file(ImageFile::Edits).exists()
                    && latest_edits.as_ref().map(|(_, t)| time > *t).unwrap_or(true)
                {
                    latest_edits = Some((dir.root().to_path_buf(), time));
                }
            }
        }

        let (image_root, image_time) = latest_image.ok_or_else(|| {
            EngineError::InconsistentStorage {
                detail: format!("image file not found in {:?}", image_dirs_scanned),
            }
        })?;
        let (edits_root, edits_time) = latest_edits.ok_or_else(|| {
            EngineError::InconsistentStorage {
                detail: format!("edits file not found in {:?}", edits_dirs_scanned),
            }
        })?;

        let image_dir_role = self
            .storage
            .iter()
            .find(|d| d.root() == image_root)
            .map(|d| d.role())
            .expect("chosen image directory is active");
        let edits_dir_role = self
            .storage
            .iter()
            .find(|d| d.root() == edits_root)
            .map(|d| d.role())
            .expect("chosen edits directory is active");

        if image_time > edits_time {
            if image_root != edits_root
                && image_dir_role == StorageRole::Image
                && edits_dir_role == StorageRole::Edits
            {
                // A crash landed between saving images and purging edits in a
                // split image/edits configuration. The image is the latest
                // committed state; the stale edits are dropped.
                error!("this is a rare failure scenario");
                error!(
                    "image checkpoint time {} > edits checkpoint time {}",
                    image_time, edits_time
                );
                error!("treating the image as the latest namespace state; old edits are discarded");
            } else {
                return Err(EngineError::InconsistentStorage {
                    detail: format!(
                        "image and edits checkpoint times do not match: image {} edits {}",
                        image_time, edits_time
                    ),
                });
            }
        } else if image_time != edits_time {
            return Err(EngineError::InconsistentStorage {
                detail: format!(
                    "image and edits checkpoint times do not match: image {} edits {}",
                    image_time, edits_time
                ),
            });
        }

        need_to_save |= self.recover_interrupted_checkpoint(&image_root, &edits_root)?;

        let (image_file, props) = {
            let dir = self
                .storage
                .iter()
                .find(|d| d.root() == image_root)
                .expect("chosen image directory is active");
            (dir.image_file(ImageFile::Image), dir.read_version()?)
        };
        self.info = StorageInfo {
            layout_version: props.layout_version,
            namespace_id: props.namespace_id,
            ctime: props.ctime,
        };
        self.checkpoint_time = image_time;

        let loaded = {
            let journal = &self.journal;
            let clamp = |r: i16| journal.adjust_replication(r);
            image_format::load_image(
                tree,
                &image_file,
                &LoadOptions {
                    registry: &self.codecs,
                    expected_digest: props.image_digest,
                    adjust_replication: Some(&clamp),
                },
            )?
        };
        self.image_digest = Some(loaded.digest);
        self.info.layout_version = loaded.layout_version;
        self.info.namespace_id = loaded.namespace_id;
        need_to_save |= loaded.needs_resave;
        self.context.set_tx_id(loaded.image_tx_id);
        self.journal.set_start_transaction_id(loaded.image_tx_id + 1);

        if image_time > edits_time {
            // The image is already current; the old edits are discarded.
            need_to_save = true;
        } else {
            let (edits_file, edits_new_file) = {
                let dir = self
                    .storage
                    .iter()
                    .find(|d| d.root() == edits_root)
                    .expect("chosen edits directory is active");
                (
                    dir.image_file(ImageFile::Edits),
                    dir.image_file(ImageFile::EditsNew),
                )
            };
            let mut num_edits = self.journal.load_edits(&edits_file)?;
            if edits_new_file.exists()
                && fs::metadata(&edits_new_file).map_err(|e| stio(&edits_root, e))?.len() > 0
            {
                num_edits += self.journal.load_edits(&edits_new_file)?;
            }
            if num_edits > 0 {
                let period_millis = (self.config.checkpoint_period_secs as i64) * 1000;
                let time_trigger = image_time + period_millis < now_millis();
                let edits_len = fs::metadata(&edits_file)
                    .map_err(|e| stio(&edits_root, e))?
                    .len();
                let size_trigger = edits_len > self.config.checkpoint_size_bytes;
                need_to_save |= time_trigger || size_trigger;
            }
        }

        Ok(need_to_save)
    }

    /// Repair an interrupted secondary checkpoint: a leftover
    /// `fsimage.ckpt` either lost its race with the upload (delete it) or
    /// only missed the final rename (complete it).
    fn recover_interrupted_checkpoint(
        &self,
        image_root: &Path,
        edits_root: &Path,
    ) -> EngineResult<bool> {
        let image_dir = self
            .storage
            .iter()
            .find(|d| d.root() == image_root)
            .expect("chosen image directory is active");
        let edits_dir = self
            .storage
            .iter()
            .find(|d| d.root() == edits_root)
            .expect("chosen edits directory is active");

        let ckpt = image_dir.image_file(ImageFile::ImageNew);
        if !ckpt.exists() {
            return Ok(false);
        }
        if edits_dir.image_file(ImageFile::EditsNew).exists() {
            // The merged image may be partially uploaded; discard it.
            info!("discarding possibly incomplete checkpoint upload {:?}", ckpt);
            fs::remove_file(&ckpt).map_err(|e| stio(image_root, e))?;
        } else {
            // The upload finished but the rename lost power.
            info!("completing interrupted checkpoint rename {:?}", ckpt);
            rename_overwrite(&ckpt, &image_dir.image_file(ImageFile::Image))
                .map_err(|e| stio(image_root, e))?;
        }
        Ok(true)
    }

    /// Seal the edit log for a secondary merge and hand out the signature
    /// the upload must echo.
    pub fn roll_edit_log(&mut self) -> EngineResult<CheckpointSignature> {
        self.journal.roll_edit_log()?;
        self.state = CheckpointState::RolledEdits;
        self.signature()
    }

    fn signature(&self) -> EngineResult<CheckpointSignature> {
        Ok(CheckpointSignature {
            layout_version: self.info.layout_version,
            namespace_id: self.info.namespace_id,
            ctime: self.info.ctime,
            checkpoint_time: self.checkpoint_time,
            edits_mtime: self.journal.edits_mtime()?,
            image_digest: self.image_digest.unwrap_or(ImageDigest::from_bytes([0; 16])),
        })
    }

    /// Gate an incoming checkpoint upload on the signature handed out by
    /// [`roll_edit_log`].
    pub fn validate_checkpoint_upload(&mut self, sig: &CheckpointSignature) -> EngineResult<()> {
        if self.state != CheckpointState::RolledEdits {
            return Err(EngineError::ProtocolOrdering {
                operation: "validate_checkpoint_upload",
                expected: "ROLLED_EDITS",
                state: self.state,
            });
        }
        let mine = self.signature()?;
        if sig.edits_mtime != mine.edits_mtime {
            return Err(EngineError::SignatureMismatch {
                detail: format!(
                    "edit log timestamp {} does not match checkpoint {}",
                    mine.edits_mtime, sig.edits_mtime
                ),
            });
        }
        if sig.layout_version != mine.layout_version
            || sig.namespace_id != mine.namespace_id
            || sig.ctime != mine.ctime
            || sig.checkpoint_time != mine.checkpoint_time
        {
            return Err(EngineError::SignatureMismatch {
                detail: format!("signature {:?} does not match local state {:?}", sig, mine),
            });
        }
        self.state = CheckpointState::UploadStart;
        Ok(())
    }

    /// Record the digest of a completed checkpoint upload.
    pub fn checkpoint_upload_done(&mut self, digest: ImageDigest) {
        self.checkpoint_image_digest = Some(digest);
        self.state = CheckpointState::UploadDone;
    }

    /// Promote the uploaded `fsimage.ckpt` to `fsimage` and retire the
    /// sealed edits.
    pub fn roll_fs_image(&mut self, sig: &CheckpointSignature) -> EngineResult<()> {
        if self.state != CheckpointState::UploadDone {
            return Err(EngineError::ProtocolOrdering {
                operation: "roll_fs_image",
                expected: "UPLOAD_DONE",
                state: self.state,
            });
        }
        match self.checkpoint_image_digest {
            Some(recorded) if recorded == sig.image_digest => {}
            recorded => {
                return Err(EngineError::SignatureMismatch {
                    detail: format!(
                        "checkpoint image digest {:?} does not match uploaded {:?}",
                        recorded, sig.image_digest
                    ),
                });
            }
        }
        if !self.journal.exists_new() {
            return Err(EngineError::InconsistentStorage {
                detail: "new edits file does not exist".to_string(),
            });
        }
        for dir in self.storage.iter_role(StorageRole::Image) {
            let ckpt = dir.image_file(ImageFile::ImageNew);
            if !ckpt.exists() {
                return Err(EngineError::InconsistentStorage {
                    detail: format!("checkpoint file {:?} does not exist", ckpt),
                });
            }
        }

        let mut failed = Vec::new();
        for dir in self.storage.iter_role(StorageRole::Image) {
            let ckpt = dir.image_file(ImageFile::ImageNew);
            let image = dir.image_file(ImageFile::Image);
            if let Err(e) = rename_overwrite(&ckpt, &image) {
                warn!("renaming {:?} to {:?} failed: {}", ckpt, image, e);
                failed.push(dir.root().to_path_buf());
            }
        }
        for root in &failed {
            self.evict(root, "checkpoint image rename failed");
        }
        if self.storage.iter_role(StorageRole::Image).next().is_none() {
            error!(
                "no more image storage directories left, bad directories: {:?}",
                self.storage.removed().map(|d| d.root()).collect::<Vec<_>>()
            );
            return Err(EngineError::NoImageStorage);
        }

        // Renaming edits.new after the image means a failure here never
        // loses edits.
        self.journal.purge_edit_log()?;

        self.info.layout_version = LAYOUT_VERSION;
        self.renew_checkpoint_time();
        self.image_digest = Some(sig.image_digest);

        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            let result = (|| -> Result<(), StorageError> {
                // Drop artifacts that do not belong to this directory's role.
                if !dir.role().includes_edits() {
                    let stale = dir.image_file(ImageFile::Edits);
                    if stale.exists() {
                        fs::remove_file(&stale).map_err(|e| stio(dir.root(), e))?;
                    }
                }
                if !dir.role().includes_image() {
                    let stale = dir.image_file(ImageFile::Image);
                    if stale.exists() {
                        fs::remove_file(&stale).map_err(|e| stio(dir.root(), e))?;
                    }
                }
                self.write_dir_version(dir)
            })();
            if let Err(e) = result {
                error!("cannot finish checkpoint in {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "checkpoint version write failed")?;
        self.state = CheckpointState::Start;
        Ok(())
    }

    /// Move every directory to the new layout version, retaining the old
    /// state under `previous/`.
    fn do_upgrade(&mut self, tree: &mut NamespaceTree) -> EngineResult<()> {
        if self.distributed_upgrade.is_some() {
            // Only the distributed upgrade needs to continue; the layout
            // stays as it is.
            self.load_namespace(tree)?;
            self.initialize_distributed_upgrade()?;
            self.sync_journal();
            if !self.journal.is_open() {
                self.journal.open()?;
            }
            return Ok(());
        }

        for dir in self.storage.iter() {
            if dir.previous_dir().exists() {
                return Err(EngineError::PreviousStateExists {
                    dir: dir.root().to_path_buf(),
                });
            }
        }

        // A need-to-save answer is irrelevant here; the upgrade rewrites the
        // image anyway.
        self.load_namespace(tree)?;

        let old_layout = self.info.layout_version;
        let old_ctime = self.info.ctime;
        self.info.ctime = now_millis().max(old_ctime + 1);
        self.info.layout_version = LAYOUT_VERSION;
        self.renew_checkpoint_time();

        self.journal.close()?;
        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            info!(
                "upgrading {:?}: old layout {} old cTime {}; new layout {} new cTime {}",
                dir.root(),
                old_layout,
                old_ctime,
                self.info.layout_version,
                self.info.ctime
            );
            let result = (|| -> std::io::Result<()> {
                fs::rename(dir.current_dir(), dir.previous_tmp())?;
                fs::create_dir(dir.current_dir())
            })();
            if let Err(e) = result {
                error!("error upgrading {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "upgrade staging failed")?;

        self.context.clear();
        self.context.set_tx_id(self.journal.last_written_tx_id());
        self.context.set_total_nodes(tree.num_nodes());
        self.save_current_all(tree, false)?;

        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = fs::rename(dir.previous_tmp(), dir.previous_dir()) {
                error!("error upgrading {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            } else {
                info!("upgrade of {:?} is complete", dir.root());
            }
        }
        self.evict_all(&failed, "upgrade completion failed")?;
        self.upgrade_finalized = false;

        self.initialize_distributed_upgrade()?;
        self.sync_journal();
        self.journal.open()?;
        Ok(())
    }

    fn initialize_distributed_upgrade(&mut self) -> EngineResult<()> {
        let Some(manager) = self.upgrade_manager.as_mut() else {
            return Ok(());
        };
        if !manager.initialize_upgrade() {
            return Ok(());
        }
        let version = manager.upgrade_version();
        self.distributed_upgrade = Some(version);
        info!(
            "distributed upgrade for version {} to layout {} is initialized",
            version, LAYOUT_VERSION
        );
        // Persist the new upgrade state everywhere.
        let mut failed = Vec::new();
        for dir in self.storage.iter() {
            if let Err(e) = self.write_dir_version(dir) {
                error!("cannot write upgrade state to {:?}: {}", dir.root(), e);
                failed.push(dir.root().to_path_buf());
            }
        }
        self.evict_all(&failed, "upgrade state write failed")?;
        Ok(())
    }

    /// Restore `previous/` over `current/` in every directory that holds a
    /// previous state.
    fn do_rollback(&mut self) -> EngineResult<()> {
        let mut can_rollback = false;
        for dir in self.storage.iter() {
            if !dir.previous_dir().exists() {
                info!(
                    "storage directory {:?} does not contain a previous state",
                    dir.root()
                );
                continue;
            }
            let props = dir.read_version_file(&dir.previous_version_file())?;
            if props.layout_version < LAYOUT_VERSION {
                return Err(EngineError::InconsistentStorage {
                    detail: format!(
                        "previous state of {:?} has layout {} newer than this build's {}",
                        dir.root(),
                        props.layout_version,
                        LAYOUT_VERSION
                    ),
                });
            }
            can_rollback = true;
        }
        if !can_rollback {
            return Err(EngineError::CannotRollback);
        }

        for dir in self.storage.iter() {
            if !dir.previous_dir().exists() {
                continue;
            }
            info!("rolling back storage directory {:?}", dir.root());
            (|| -> std::io::Result<()> {
                let scratch = dir.removed_tmp();
                fs::rename(dir.current_dir(), &scratch)?;
                fs::rename(dir.previous_dir(), dir.current_dir())?;
                delete_dir(&scratch)
            })()
            .map_err(|e| stio(dir.root(), e))?;
            info!("rollback of {:?} is complete", dir.root());
        }
        self.upgrade_finalized = true;
        Ok(())
    }

    /// Discard the retained `previous/` state everywhere. Idempotent.
    pub fn finalize_upgrade(&mut self) -> EngineResult<()> {
        for dir in self.storage.iter() {
            let previous = dir.previous_dir();
            if !previous.exists() {
                info!("finalize upgrade for {:?} is not required", dir.root());
                continue;
            }
            info!("finalizing upgrade for storage directory {:?}", dir.root());
            (|| -> std::io::Result<()> {
                let scratch = dir.finalized_tmp();
                fs::rename(&previous, &scratch)?;
                delete_dir(&scratch)
            })()
            .map_err(|e| stio(dir.root(), e))?;
            info!("finalize upgrade for {:?} is complete", dir.root());
        }
        self.upgrade_finalized = true;
        Ok(())
    }

    /// Load an image from the configured checkpoint directories and save it
    /// through the regular protocol into the real directories.
    fn do_import_checkpoint(&mut self, tree: &mut NamespaceTree) -> EngineResult<()> {
        let ckpt_config = CheckpointConfig::new(
            self.config.checkpoint_dirs.clone(),
            self.config.checkpoint_edits_dirs.clone(),
        );
        let mut ckpt_engine =
            CheckpointEngine::new(ckpt_config, Box::new(FileEditJournal::new()))?;
        let result = ckpt_engine.recover_transition_read(tree, StartupOption::Regular);
        let imported_info = ckpt_engine.storage_info();
        ckpt_engine.close()?;
        result?;

        self.info = StorageInfo {
            layout_version: LAYOUT_VERSION,
            namespace_id: imported_info.namespace_id,
            ctime: imported_info.ctime,
        };
        self.save_namespace(tree, false, true)
    }
}

fn stage_current(dir: &StorageDirectory) -> std::io::Result<()> {
    // current moves aside only when it is well formed, that is has VERSION.
    if dir.version_file().exists() {
        fs::rename(dir.current_dir(), dir.last_checkpoint_tmp())?;
    }
    if !dir.current_dir().exists() {
        fs::create_dir(dir.current_dir())?;
    }
    Ok(())
}

fn retire_checkpoint(dir: &StorageDirectory) -> std::io::Result<()> {
    let staged = dir.last_checkpoint_tmp();
    let retired = dir.previous_checkpoint();
    if retired.exists() {
        delete_dir(&retired)?;
    }
    if staged.exists() {
        fs::rename(&staged, &retired)?;
    }
    Ok(())
}
