//! Namespace Snapshot Module
//!
//! In-memory model of the file-system namespace tree that the checkpoint
//! engine persists: directories, files, block references, permissions, and
//! the auxiliary set of files under construction. The engine only reads the
//! tree during a save and populates it during a load; ownership stays with
//! the surrounding metadata server.

use std::fmt;
use thiserror::Error;

/// Path separator used in serialized full paths.
pub const PATH_SEPARATOR: u8 = b'/';

/// Generation stamp substituted for blocks written by layouts that predate
/// per-block generation stamps.
pub const GRANDFATHER_GENERATION_STAMP: i64 = 0;

/// Errors raised while resolving or mutating namespace paths.
#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("path {0:?} is not a directory")]
    NotADirectory(String),

    #[error("parent path {0:?} not found")]
    ParentNotFound(String),

    #[error("path {0:?} not found")]
    NotFound(String),

    #[error("lease recorded for non-file path {0:?}")]
    LeaseOnNonFile(String),
}

pub type NamespaceResult<T> = Result<T, NamespaceError>;

/// A single block reference of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub id: i64,
    pub num_bytes: i64,
    pub generation_stamp: i64,
}

impl Block {
    pub fn new(id: i64, num_bytes: i64, generation_stamp: i64) -> Self {
        Self {
            id,
            num_bytes,
            generation_stamp,
        }
    }
}

/// Owner, group and mode bits of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    pub user: String,
    pub group: String,
    pub mode: u16,
}

impl PermissionStatus {
    pub fn new<U: Into<String>, G: Into<String>>(user: U, group: G, mode: u16) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
            mode,
        }
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:o}", self.user, self.group, self.mode)
    }
}

/// A directory inode with its ordered children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    /// Local name; empty for the root.
    pub name: Vec<u8>,
    pub mtime: i64,
    pub ns_quota: i64,
    pub ds_quota: i64,
    pub permission: PermissionStatus,
    pub children: Vec<INode>,
}

impl DirectoryNode {
    pub fn new(name: Vec<u8>, mtime: i64, permission: PermissionStatus) -> Self {
        Self {
            name,
            mtime,
            ns_quota: -1,
            ds_quota: -1,
            permission,
            children: Vec::new(),
        }
    }

    /// Find a direct child by local name.
    pub fn child(&self, name: &[u8]) -> Option<&INode> {
        self.children.iter().find(|c| c.name() == name)
    }

    pub fn child_mut(&mut self, name: &[u8]) -> Option<&mut INode> {
        self.children.iter_mut().find(|c| c.name() == name)
    }
}

/// A file inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: Vec<u8>,
    pub replication: i16,
    pub mtime: i64,
    pub atime: i64,
    pub preferred_block_size: i64,
    pub blocks: Vec<Block>,
    pub permission: PermissionStatus,
}

/// One node of the namespace tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum INode {
    Directory(DirectoryNode),
    File(FileNode),
}

impl INode {
    pub fn name(&self) -> &[u8] {
        match self {
            INode::Directory(d) => &d.name,
            INode::File(f) => &f.name,
        }
    }

    pub fn set_name(&mut self, name: Vec<u8>) {
        match self {
            INode::Directory(d) => d.name = name,
            INode::File(f) => f.name = name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, INode::Directory(_))
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            INode::Directory(d) => Some(d),
            INode::File(_) => None,
        }
    }

    pub fn as_directory_mut(&mut self) -> Option<&mut DirectoryNode> {
        match self {
            INode::Directory(d) => Some(d),
            INode::File(_) => None,
        }
    }

    /// Number of inodes in this subtree, this node included.
    pub fn subtree_size(&self) -> u64 {
        match self {
            INode::File(_) => 1,
            INode::Directory(d) => 1 + d.children.iter().map(INode::subtree_size).sum::<u64>(),
        }
    }
}

/// A file that still has an open writer, retained separately so the client
/// identity survives the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUnderConstruction {
    /// Absolute path of the file within the namespace.
    pub path: String,
    pub replication: i16,
    pub mtime: i64,
    pub preferred_block_size: i64,
    pub blocks: Vec<Block>,
    pub permission: PermissionStatus,
    pub client_name: String,
    pub client_machine: String,
}

/// The rooted namespace tree together with its auxiliary persistent state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceTree {
    pub root: DirectoryNode,
    pub under_construction: Vec<FileUnderConstruction>,
    /// Highest block generation stamp handed out so far.
    pub generation_stamp: i64,
    /// Block size substituted when an old layout stored none.
    pub default_block_size: i64,
    /// Permission substituted when an old layout stored none.
    pub upgrade_permission: PermissionStatus,
}

impl NamespaceTree {
    pub fn new() -> Self {
        Self {
            root: DirectoryNode::new(Vec::new(), 0, PermissionStatus::new("root", "supergroup", 0o755)),
            under_construction: Vec::new(),
            generation_stamp: 1000,
            default_block_size: 64 * 1024 * 1024,
            upgrade_permission: PermissionStatus::new("root", "supergroup", 0o777),
        }
    }

    /// Total number of inodes, the root included.
    pub fn num_nodes(&self) -> u64 {
        1 + self.root.children.iter().map(INode::subtree_size).sum::<u64>()
    }

    /// Split an absolute path into its component byte slices. The leading
    /// empty component produced by the root separator is dropped; the root
    /// itself is the empty component sequence.
    pub fn path_components(path: &[u8]) -> Vec<&[u8]> {
        path.split(|b| *b == PATH_SEPARATOR)
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Resolve a node by path components relative to the root.
    pub fn get<'a>(&'a self, components: &[&[u8]]) -> Option<NodeRef<'a>> {
        if components.is_empty() {
            return Some(NodeRef::Root(&self.root));
        }
        let mut dir = &self.root;
        for component in &components[..components.len() - 1] {
            dir = dir.child(component)?.as_directory()?;
        }
        dir.child(components[components.len() - 1]).map(NodeRef::Node)
    }

    /// Resolve a node by an absolute byte path such as `b"/a/b"`.
    pub fn get_path<'a>(&'a self, path: &[u8]) -> Option<NodeRef<'a>> {
        self.get(&Self::path_components(path))
    }

    /// Insert a node under the directory named by `parent_components`.
    /// The parent chain must already exist.
    pub fn insert(&mut self, parent_components: &[&[u8]], node: INode) -> NamespaceResult<()> {
        self.get_dir_mut(parent_components)?.children.push(node);
        Ok(())
    }

    /// Resolve an existing directory by path components.
    pub fn get_dir_mut(&mut self, components: &[&[u8]]) -> NamespaceResult<&mut DirectoryNode> {
        let mut dir = &mut self.root;
        for component in components {
            let display = display_components(components);
            dir = dir
                .child_mut(component)
                .ok_or(NamespaceError::ParentNotFound(display.clone()))?
                .as_directory_mut()
                .ok_or(NamespaceError::NotADirectory(display))?;
        }
        Ok(dir)
    }

    /// Create any missing intermediate directories along `components`,
    /// returning a mutable reference to the final one.
    pub fn mkdirs(&mut self, components: &[&[u8]], mtime: i64) -> NamespaceResult<&mut DirectoryNode> {
        let permission = self.upgrade_permission.clone();
        let mut dir = &mut self.root;
        for component in components {
            if dir.child(component).is_none() {
                dir.children.push(INode::Directory(DirectoryNode::new(
                    component.to_vec(),
                    mtime,
                    permission.clone(),
                )));
            }
            let display = display_components(components);
            dir = dir
                .child_mut(component)
                .expect("child just inserted")
                .as_directory_mut()
                .ok_or(NamespaceError::NotADirectory(display))?;
        }
        Ok(dir)
    }

    /// Record a lease for a file that must already exist in the tree.
    pub fn add_under_construction(&mut self, fuc: FileUnderConstruction) -> NamespaceResult<()> {
        match self.get_path(fuc.path.as_bytes()) {
            Some(NodeRef::Node(INode::File(_))) => {
                self.under_construction.push(fuc);
                Ok(())
            }
            Some(_) => Err(NamespaceError::LeaseOnNonFile(fuc.path.clone())),
            None => Err(NamespaceError::NotFound(fuc.path.clone())),
        }
    }
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution result: the root is a bare directory, everything else an inode.
#[derive(Debug)]
pub enum NodeRef<'a> {
    Root(&'a DirectoryNode),
    Node(&'a INode),
}

impl<'a> NodeRef<'a> {
    pub fn is_directory(&self) -> bool {
        match self {
            NodeRef::Root(_) => true,
            NodeRef::Node(n) => n.is_directory(),
        }
    }
}

fn display_components(components: &[&[u8]]) -> String {
    let mut s = String::new();
    for c in components {
        s.push('/');
        s.push_str(&String::from_utf8_lossy(c));
    }
    if s.is_empty() {
        s.push('/');
    }
    s
}
