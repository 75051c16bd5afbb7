//! Storage Set Module
//!
//! Management of the storage directories that hold namespace images and edit
//! journals: role assignment, advisory locking, `VERSION` and `fstime` file
//! I/O, startup state analysis, crash recovery of the staging directories,
//! and eviction of failed directories.
//!
//! Every multi-file transition inside a directory writes `VERSION` last; a
//! missing or partial `VERSION` marks the directory incomplete on the next
//! startup.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::digest_stream::ImageDigest;
use crate::image_format::FEATURE_IMAGE_DIGEST;

/// Storage type recorded in `VERSION`.
pub const STORAGE_TYPE: &str = "NAME_NODE";

const CURRENT_DIR: &str = "current";
const PREVIOUS_DIR: &str = "previous";
const PREVIOUS_TMP: &str = "previous.tmp";
const REMOVED_TMP: &str = "removed.tmp";
const FINALIZED_TMP: &str = "finalized.tmp";
const LAST_CHECKPOINT_TMP: &str = "lastcheckpoint.tmp";
const PREVIOUS_CHECKPOINT: &str = "previous.checkpoint";
const VERSION_FILE: &str = "VERSION";
const LOCK_FILE: &str = "in_use.lock";

/// Errors raised by storage directory management.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error in storage directory {dir:?}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage directory {dir:?} is in an inconsistent state: {detail}")]
    InconsistentState { dir: PathBuf, detail: String },

    #[error("storage directory {dir:?} is not formatted")]
    NotFormatted { dir: PathBuf },

    #[error("storage directory {dir:?} does not exist or is not accessible")]
    NonExistent { dir: PathBuf },

    #[error("storage directory {dir:?} is locked by another process")]
    AlreadyLocked { dir: PathBuf },

    #[error("no usable storage directories left")]
    NoStorageLeft,
}

pub type StorageResult<T> = Result<T, StorageError>;

fn ioe(dir: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        dir: dir.to_path_buf(),
        source,
    }
}

/// Rename that tolerates platforms whose rename refuses to overwrite an
/// existing destination: delete the destination, then retry once.
pub fn rename_overwrite(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(first) => {
            if to.exists() {
                let removed = if to.is_dir() {
                    fs::remove_dir_all(to)
                } else {
                    fs::remove_file(to)
                };
                if removed.is_err() {
                    return Err(first);
                }
                fs::rename(from, to)
            } else {
                Err(first)
            }
        }
    }
}

/// Best-effort recursive delete with a single retry.
pub fn delete_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).or_else(|_| fs::remove_dir_all(path))
}

/// What a storage directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRole {
    Image,
    Edits,
    Both,
}

impl StorageRole {
    /// Whether this role covers the queried role. `Both` covers either.
    pub fn includes(&self, query: StorageRole) -> bool {
        match (self, query) {
            (StorageRole::Both, StorageRole::Image | StorageRole::Edits) => true,
            (role, query) => *role == query,
        }
    }

    pub fn includes_image(&self) -> bool {
        self.includes(StorageRole::Image)
    }

    pub fn includes_edits(&self) -> bool {
        self.includes(StorageRole::Edits)
    }
}

/// Classified condition of a directory at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    NonExistent,
    NotFormatted,
    Normal,
    NeedsRecovery,
}

/// Artifact files inside `current/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFile {
    Image,
    ImageNew,
    Edits,
    EditsNew,
    Time,
}

impl ImageFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            ImageFile::Image => "fsimage",
            ImageFile::ImageNew => "fsimage.ckpt",
            ImageFile::Edits => "edits",
            ImageFile::EditsNew => "edits.new",
            ImageFile::Time => "fstime",
        }
    }
}

/// Contents of a `VERSION` properties file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProperties {
    pub layout_version: i32,
    pub namespace_id: i32,
    pub ctime: i64,
    pub distributed_upgrade_state: bool,
    pub distributed_upgrade_version: Option<i32>,
    pub image_digest: Option<ImageDigest>,
}

impl VersionProperties {
    fn parse(dir: &Path, content: &str) -> StorageResult<Self> {
        let mut layout_version = None;
        let mut namespace_id = None;
        let mut ctime = None;
        let mut storage_type = None;
        let mut upgrade_state = false;
        let mut upgrade_version = None;
        let mut image_digest = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                StorageError::InconsistentState {
                    dir: dir.to_path_buf(),
                    detail: format!("malformed VERSION line {:?}", line),
                }
            })?;
            let bad = |detail: String| StorageError::InconsistentState {
                dir: dir.to_path_buf(),
                detail,
            };
            match key {
                "layoutVersion" => {
                    layout_version = Some(value.parse::<i32>().map_err(|_| {
                        bad(format!("invalid layoutVersion {:?}", value))
                    })?)
                }
                "namespaceID" => {
                    namespace_id = Some(value.parse::<i32>().map_err(|_| {
                        bad(format!("invalid namespaceID {:?}", value))
                    })?)
                }
                "cTime" => {
                    ctime = Some(value.parse::<i64>().map_err(|_| {
                        bad(format!("invalid cTime {:?}", value))
                    })?)
                }
                "storageType" => storage_type = Some(value.to_string()),
                "distributedUpgradeState" => {
                    upgrade_state = value.parse::<bool>().map_err(|_| {
                        bad(format!("invalid distributedUpgradeState {:?}", value))
                    })?
                }
                "distributedUpgradeVersion" => {
                    upgrade_version = Some(value.parse::<i32>().map_err(|_| {
                        bad(format!("invalid distributedUpgradeVersion {:?}", value))
                    })?)
                }
                "imageMD5Digest" => {
                    image_digest = Some(value.parse::<ImageDigest>().map_err(|e| {
                        bad(e.to_string())
                    })?)
                }
                // Unknown keys from newer builds are ignored.
                _ => {}
            }
        }

        let missing = |field: &str| StorageError::InconsistentState {
            dir: dir.to_path_buf(),
            detail: format!("VERSION file has no {}", field),
        };
        let layout_version = layout_version.ok_or_else(|| missing("layoutVersion"))?;
        if layout_version == 0 {
            return Err(StorageError::NotFormatted {
                dir: dir.to_path_buf(),
            });
        }
        let props = Self {
            layout_version,
            namespace_id: namespace_id.ok_or_else(|| missing("namespaceID"))?,
            ctime: ctime.ok_or_else(|| missing("cTime"))?,
            distributed_upgrade_state: upgrade_state,
            distributed_upgrade_version: upgrade_version,
            image_digest,
        };
        match storage_type.as_deref() {
            Some(STORAGE_TYPE) => {}
            other => {
                return Err(StorageError::InconsistentState {
                    dir: dir.to_path_buf(),
                    detail: format!("unexpected storageType {:?}", other),
                })
            }
        }

        // The digest key is required once the layout stores digests and must
        // be absent before that.
        if props.layout_version <= FEATURE_IMAGE_DIGEST {
            if props.image_digest.is_none() {
                return Err(StorageError::InconsistentState {
                    dir: dir.to_path_buf(),
                    detail: "VERSION file has no image digest".to_string(),
                });
            }
        } else if props.image_digest.is_some() {
            return Err(StorageError::InconsistentState {
                dir: dir.to_path_buf(),
                detail: format!(
                    "VERSION carries an image digest but layout is {}",
                    props.layout_version
                ),
            });
        }
        Ok(props)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("layoutVersion={}\n", self.layout_version));
        out.push_str(&format!("namespaceID={}\n", self.namespace_id));
        out.push_str(&format!("cTime={}\n", self.ctime));
        out.push_str(&format!("storageType={}\n", STORAGE_TYPE));
        if self.distributed_upgrade_state {
            if let Some(v) = self.distributed_upgrade_version {
                out.push_str("distributedUpgradeState=true\n");
                out.push_str(&format!("distributedUpgradeVersion={}\n", v));
            }
        }
        if let Some(digest) = &self.image_digest {
            out.push_str(&format!("imageMD5Digest={}\n", digest));
        }
        out
    }
}

/// One storage directory and its lifecycle state.
#[derive(Debug)]
pub struct StorageDirectory {
    root: PathBuf,
    role: StorageRole,
    lock: Option<File>,
}

impl StorageDirectory {
    pub fn new<P: Into<PathBuf>>(root: P, role: StorageRole) -> Self {
        Self {
            root: root.into(),
            role,
            lock: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn role(&self) -> StorageRole {
        self.role
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join(CURRENT_DIR)
    }

    pub fn previous_dir(&self) -> PathBuf {
        self.root.join(PREVIOUS_DIR)
    }

    pub fn previous_tmp(&self) -> PathBuf {
        self.root.join(PREVIOUS_TMP)
    }

    pub fn removed_tmp(&self) -> PathBuf {
        self.root.join(REMOVED_TMP)
    }

    pub fn finalized_tmp(&self) -> PathBuf {
        self.root.join(FINALIZED_TMP)
    }

    pub fn last_checkpoint_tmp(&self) -> PathBuf {
        self.root.join(LAST_CHECKPOINT_TMP)
    }

    pub fn previous_checkpoint(&self) -> PathBuf {
        self.root.join(PREVIOUS_CHECKPOINT)
    }

    pub fn version_file(&self) -> PathBuf {
        self.current_dir().join(VERSION_FILE)
    }

    pub fn previous_version_file(&self) -> PathBuf {
        self.previous_dir().join(VERSION_FILE)
    }

    /// Path of an artifact file inside `current/`.
    pub fn image_file(&self, file: ImageFile) -> PathBuf {
        self.current_dir().join(file.file_name())
    }

    /// Take the exclusive advisory lock for this directory.
    pub fn lock(&mut self) -> StorageResult<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let lock_path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .map_err(|e| ioe(&self.root, e))?;
        file.try_lock_exclusive().map_err(|_| StorageError::AlreadyLocked {
            dir: self.root.clone(),
        })?;
        self.lock = Some(file);
        Ok(())
    }

    /// Release the advisory lock, if held.
    pub fn unlock(&mut self) {
        if let Some(file) = self.lock.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!("unable to unlock storage directory {:?}: {}", self.root, e);
            }
        }
    }

    /// Whether the directory holds nothing but its lock file.
    pub fn is_empty(&self) -> StorageResult<bool> {
        for entry in fs::read_dir(&self.root).map_err(|e| ioe(&self.root, e))? {
            let entry = entry.map_err(|e| ioe(&self.root, e))?;
            if entry.file_name() != LOCK_FILE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete everything under the root (lock file excepted) and recreate an
    /// empty `current/`.
    pub fn clear(&self) -> StorageResult<()> {
        if self.root.exists() {
            for entry in fs::read_dir(&self.root).map_err(|e| ioe(&self.root, e))? {
                let entry = entry.map_err(|e| ioe(&self.root, e))?;
                if entry.file_name() == LOCK_FILE {
                    continue;
                }
                let path = entry.path();
                let removed = if path.is_dir() {
                    delete_dir(&path)
                } else {
                    fs::remove_file(&path)
                };
                removed.map_err(|e| ioe(&self.root, e))?;
            }
        } else {
            fs::create_dir_all(&self.root).map_err(|e| ioe(&self.root, e))?;
        }
        fs::create_dir(self.current_dir()).map_err(|e| ioe(&self.root, e))?;
        Ok(())
    }

    /// Classify the directory without modifying it.
    pub fn analyze(&self) -> StorageState {
        if !self.root.exists() || !self.root.is_dir() {
            return StorageState::NonExistent;
        }
        if self.previous_tmp().exists()
            || self.removed_tmp().exists()
            || self.finalized_tmp().exists()
            || self.last_checkpoint_tmp().exists()
        {
            return StorageState::NeedsRecovery;
        }
        if !self.version_file().exists() {
            return StorageState::NotFormatted;
        }
        StorageState::Normal
    }

    /// Apply the crash-recovery rules for the staging directories. Returns
    /// true when recovery replaced `current/`, which forces a fresh save.
    pub fn recover(&self) -> StorageResult<bool> {
        let mut replaced_current = false;
        let root = &self.root;

        let removed = self.removed_tmp();
        if removed.exists() {
            info!("recovering {:?}: discarding {:?}", root, removed);
            delete_dir(&removed).map_err(|e| ioe(root, e))?;
        }

        let finalized = self.finalized_tmp();
        if finalized.exists() {
            info!("recovering {:?}: discarding {:?}", root, finalized);
            delete_dir(&finalized).map_err(|e| ioe(root, e))?;
        }

        let prev_tmp = self.previous_tmp();
        if prev_tmp.exists() {
            if self.version_file().exists() {
                // Upgrade wrote a complete current; finish it.
                info!("recovering {:?}: completing interrupted upgrade", root);
                rename_overwrite(&prev_tmp, &self.previous_dir()).map_err(|e| ioe(root, e))?;
                replaced_current = true;
            } else {
                // Upgrade never finished writing current; fall back.
                info!("recovering {:?}: undoing interrupted upgrade", root);
                let current = self.current_dir();
                if current.exists() {
                    delete_dir(&current).map_err(|e| ioe(root, e))?;
                }
                fs::rename(&prev_tmp, &current).map_err(|e| ioe(root, e))?;
                replaced_current = true;
            }
        }

        let last_ckpt = self.last_checkpoint_tmp();
        if last_ckpt.exists() {
            if self.version_file().exists() {
                // The save finished; retire the staged checkpoint.
                info!("recovering {:?}: retiring completed checkpoint", root);
                let prev_ckpt = self.previous_checkpoint();
                if prev_ckpt.exists() {
                    delete_dir(&prev_ckpt).map_err(|e| ioe(root, e))?;
                }
                fs::rename(&last_ckpt, &prev_ckpt).map_err(|e| ioe(root, e))?;
            } else {
                // The save never completed; fall back to the staged state.
                info!("recovering {:?}: restoring interrupted checkpoint", root);
                let current = self.current_dir();
                if current.exists() {
                    delete_dir(&current).map_err(|e| ioe(root, e))?;
                }
                fs::rename(&last_ckpt, &current).map_err(|e| ioe(root, e))?;
                replaced_current = true;
            }
        }
        Ok(replaced_current)
    }

    /// Parse `current/VERSION`.
    pub fn read_version(&self) -> StorageResult<VersionProperties> {
        self.read_version_file(&self.version_file())
    }

    /// Parse a `VERSION` file at an explicit path (e.g. `previous/VERSION`).
    pub fn read_version_file(&self, path: &Path) -> StorageResult<VersionProperties> {
        if !path.exists() {
            return Err(StorageError::NotFormatted {
                dir: self.root.clone(),
            });
        }
        let content = fs::read_to_string(path).map_err(|e| ioe(&self.root, e))?;
        VersionProperties::parse(&self.root, &content)
    }

    /// Write `current/VERSION`. Callers must sequence this after every other
    /// file in the transition is durable.
    pub fn write_version(&self, props: &VersionProperties) -> StorageResult<()> {
        let path = self.version_file();
        let mut file = File::create(&path).map_err(|e| ioe(&self.root, e))?;
        file.write_all(props.render().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ioe(&self.root, e))
    }

    /// Read `current/fstime`; 0 when the file is missing.
    pub fn read_fstime(&self) -> StorageResult<i64> {
        let path = self.image_file(ImageFile::Time);
        if !path.exists() {
            return Ok(0);
        }
        let mut file = File::open(&path).map_err(|e| ioe(&self.root, e))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).map_err(|e| ioe(&self.root, e))?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Write `current/fstime`. Negative times are never written.
    pub fn write_fstime(&self, time: i64) -> StorageResult<()> {
        if time < 0 {
            return Ok(());
        }
        let path = self.image_file(ImageFile::Time);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| ioe(&self.root, e))?;
        }
        let mut file = File::create(&path).map_err(|e| ioe(&self.root, e))?;
        file.write_all(&time.to_be_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ioe(&self.root, e))
    }
}

/// The active set of storage directories plus those evicted for I/O errors.
#[derive(Debug, Default)]
pub struct StorageSet {
    dirs: Vec<StorageDirectory>,
    removed: Vec<StorageDirectory>,
}

impl StorageSet {
    /// Build the set from the configured image and edits directory lists.
    /// A path in both lists gets the combined role.
    pub fn configure(image_dirs: &[PathBuf], edits_dirs: &[PathBuf]) -> Self {
        let mut dirs = Vec::new();
        for image_dir in image_dirs {
            let role = if edits_dirs.contains(image_dir) {
                StorageRole::Both
            } else {
                StorageRole::Image
            };
            dirs.push(StorageDirectory::new(image_dir.clone(), role));
        }
        for edits_dir in edits_dirs {
            if !image_dirs.contains(edits_dir) {
                dirs.push(StorageDirectory::new(edits_dir.clone(), StorageRole::Edits));
            }
        }
        Self {
            dirs,
            removed: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageDirectory> {
        self.dirs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StorageDirectory> {
        self.dirs.iter_mut()
    }

    /// Directories whose role covers `role`.
    pub fn iter_role(&self, role: StorageRole) -> impl Iterator<Item = &StorageDirectory> {
        self.dirs.iter().filter(move |d| d.role.includes(role))
    }

    pub fn removed(&self) -> impl Iterator<Item = &StorageDirectory> {
        self.removed.iter()
    }

    /// Move a directory to the removed set, unlocking it. Returns its role
    /// when it was active.
    pub fn evict(&mut self, root: &Path, cause: &str) -> Option<StorageRole> {
        let index = self.dirs.iter().position(|d| d.root() == root)?;
        let mut dir = self.dirs.remove(index);
        warn!("removing storage directory {:?}: {}", root, cause);
        dir.unlock();
        let role = dir.role;
        self.removed.push(dir);
        Some(role)
    }

    /// Fail when eviction has emptied the active set.
    pub fn check_not_empty(&self) -> StorageResult<()> {
        if self.dirs.is_empty() {
            return Err(StorageError::NoStorageLeft);
        }
        Ok(())
    }

    /// Re-accept removed directories whose path is writable again. Restored
    /// directories are cleared; the next save repopulates them. Returns the
    /// restored roots.
    pub fn attempt_restore(&mut self) -> Vec<PathBuf> {
        let mut restored = Vec::new();
        let mut index = 0;
        while index < self.removed.len() {
            let writable = {
                let dir = &self.removed[index];
                dir.root().exists() && probe_writable(dir.root())
            };
            if writable {
                let mut dir = self.removed.remove(index);
                match dir.clear().and_then(|_| dir.lock()) {
                    Ok(()) => {
                        info!("restoring storage directory {:?}", dir.root());
                        restored.push(dir.root().to_path_buf());
                        self.dirs.push(dir);
                    }
                    Err(e) => {
                        warn!("failed to restore {:?}: {}", dir.root(), e);
                        dir.unlock();
                        self.removed.insert(index, dir);
                        index += 1;
                    }
                }
            } else {
                index += 1;
            }
        }
        restored
    }

    pub fn unlock_all(&mut self) {
        for dir in &mut self.dirs {
            dir.unlock();
        }
    }
}

fn probe_writable(root: &Path) -> bool {
    let probe = root.join(".probe");
    match File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn version_props() -> VersionProperties {
        VersionProperties {
            layout_version: crate::image_format::LAYOUT_VERSION,
            namespace_id: 42,
            ctime: 0,
            distributed_upgrade_state: false,
            distributed_upgrade_version: None,
            image_digest: Some(ImageDigest::of(b"image")),
        }
    }

    #[test]
    fn test_roles_include() {
        assert!(StorageRole::Both.includes(StorageRole::Image));
        assert!(StorageRole::Both.includes(StorageRole::Edits));
        assert!(StorageRole::Image.includes(StorageRole::Image));
        assert!(!StorageRole::Image.includes(StorageRole::Edits));
        assert!(!StorageRole::Edits.includes(StorageRole::Image));
    }

    #[test]
    fn test_configure_assigns_roles() {
        let a = PathBuf::from("/a");
        let b = PathBuf::from("/b");
        let c = PathBuf::from("/c");
        let set = StorageSet::configure(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);

        let roles: Vec<_> = set.iter().map(|d| (d.root().to_path_buf(), d.role())).collect();
        assert_eq!(
            roles,
            vec![
                (a, StorageRole::Image),
                (b, StorageRole::Both),
                (c, StorageRole::Edits),
            ]
        );
    }

    #[test]
    fn test_version_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();

        let props = version_props();
        dir.write_version(&props).unwrap();
        assert_eq!(dir.read_version().unwrap(), props);
    }

    #[test]
    fn test_version_requires_digest_for_new_layouts() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();

        fs::write(
            dir.version_file(),
            "layoutVersion=-37\nnamespaceID=1\ncTime=0\nstorageType=NAME_NODE\n",
        )
        .unwrap();
        assert!(matches!(
            dir.read_version(),
            Err(StorageError::InconsistentState { .. })
        ));
    }

    #[test]
    fn test_version_rejects_premature_digest() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();

        fs::write(
            dir.version_file(),
            format!(
                "layoutVersion=-20\nnamespaceID=1\ncTime=0\nstorageType=NAME_NODE\nimageMD5Digest={}\n",
                ImageDigest::of(b"x")
            ),
        )
        .unwrap();
        assert!(matches!(
            dir.read_version(),
            Err(StorageError::InconsistentState { .. })
        ));
    }

    #[test]
    fn test_fstime_round_trip_and_default() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();

        assert_eq!(dir.read_fstime().unwrap(), 0);
        dir.write_fstime(1234567).unwrap();
        assert_eq!(dir.read_fstime().unwrap(), 1234567);
    }

    #[test]
    fn test_analyze_states() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path().join("missing"), StorageRole::Image);
        assert_eq!(dir.analyze(), StorageState::NonExistent);

        let dir = StorageDirectory::new(tmp.path(), StorageRole::Image);
        dir.clear().unwrap();
        assert_eq!(dir.analyze(), StorageState::NotFormatted);

        dir.write_version(&version_props()).unwrap();
        assert_eq!(dir.analyze(), StorageState::Normal);

        fs::create_dir(dir.removed_tmp()).unwrap();
        assert_eq!(dir.analyze(), StorageState::NeedsRecovery);
    }

    #[test]
    fn test_recover_discards_scratch_dirs() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();
        dir.write_version(&version_props()).unwrap();
        fs::create_dir(dir.removed_tmp()).unwrap();
        fs::create_dir(dir.finalized_tmp()).unwrap();

        assert!(!dir.recover().unwrap());
        assert!(!dir.removed_tmp().exists());
        assert!(!dir.finalized_tmp().exists());
        assert!(dir.current_dir().exists());
    }

    #[test]
    fn test_recover_restores_interrupted_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();

        // A crash after staging current but before the new save finished:
        // lastcheckpoint.tmp holds the old state, current has no VERSION.
        fs::create_dir(dir.last_checkpoint_tmp()).unwrap();
        fs::write(dir.last_checkpoint_tmp().join("fsimage"), b"old image").unwrap();
        fs::write(dir.image_file(ImageFile::Image), b"partial").unwrap();

        assert!(dir.recover().unwrap());
        assert!(!dir.last_checkpoint_tmp().exists());
        assert_eq!(
            fs::read(dir.image_file(ImageFile::Image)).unwrap(),
            b"old image"
        );
    }

    #[test]
    fn test_recover_retires_completed_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();
        dir.write_version(&version_props()).unwrap();
        fs::create_dir(dir.last_checkpoint_tmp()).unwrap();

        assert!(!dir.recover().unwrap());
        assert!(!dir.last_checkpoint_tmp().exists());
        assert!(dir.previous_checkpoint().exists());
    }

    #[test]
    fn test_recover_completes_interrupted_upgrade() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), StorageRole::Both);
        dir.clear().unwrap();
        dir.write_version(&version_props()).unwrap();
        fs::create_dir(dir.previous_tmp()).unwrap();
        fs::write(dir.previous_tmp().join("marker"), b"old").unwrap();

        assert!(dir.recover().unwrap());
        assert!(!dir.previous_tmp().exists());
        assert!(dir.previous_dir().join("marker").exists());
    }

    #[test]
    fn test_rename_overwrite_falls_back_on_occupied_directory() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("from");
        let to = tmp.path().join("to");
        fs::create_dir(&from).unwrap();
        fs::write(from.join("kept"), b"new state").unwrap();
        // A plain rename refuses a non-empty destination; the fallback
        // deletes it and retries.
        fs::create_dir(&to).unwrap();
        fs::write(to.join("stale"), b"old state").unwrap();

        rename_overwrite(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.join("kept").exists());
        assert!(!to.join("stale").exists());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let mut first = StorageDirectory::new(tmp.path(), StorageRole::Both);
        first.clear().unwrap();
        first.lock().unwrap();

        let mut second = StorageDirectory::new(tmp.path(), StorageRole::Both);
        assert!(matches!(
            second.lock(),
            Err(StorageError::AlreadyLocked { .. })
        ));

        first.unlock();
        second.lock().unwrap();
        second.unlock();
    }

    #[test]
    fn test_evict_and_restore() {
        let tmp = TempDir::new().unwrap();
        let mut set = StorageSet::configure(&[tmp.path().to_path_buf()], &[]);
        for dir in set.iter_mut() {
            dir.clear().unwrap();
            dir.lock().unwrap();
        }

        assert!(set.evict(tmp.path(), "test failure").is_some());
        assert!(set.is_empty());
        assert!(set.check_not_empty().is_err());

        let restored = set.attempt_restore();
        assert_eq!(restored, vec![tmp.path().to_path_buf()]);
        assert_eq!(set.len(), 1);
    }
}
