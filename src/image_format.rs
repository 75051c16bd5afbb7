//! Image Format Module
//!
//! Bit-exact serialization and deserialization of the namespace image across
//! every supported layout version. An image file is a self-describing,
//! uncompressed prefix followed by the inode body, raw or compressed through a
//! registered codec. All integers are big-endian and fixed-width; strings are
//! a u16 length followed by UTF-8 bytes.
//!
//! Layout versions are negative and monotonic in generation (more negative is
//! newer). A feature applies when `version <= threshold`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec_registry::{CodecRegistry, ImageCodec};
use crate::digest_stream::{DigestReader, DigestWriter, ImageDigest};
use crate::namespace::{
    Block, DirectoryNode, FileNode, FileUnderConstruction, INode, NamespaceTree,
    PermissionStatus, GRANDFATHER_GENERATION_STAMP, PATH_SEPARATOR,
};
use crate::save_context::{SaveCancelled, SaveContext};

/// Layout version written by this build.
pub const LAYOUT_VERSION: i32 = -37;

/// Oldest layout version the decoder accepts.
pub const LAST_UPGRADABLE_VERSION: i32 = -7;

/// Version at and below which the image digest is required in `VERSION`.
pub const FEATURE_IMAGE_DIGEST: i32 = -26;

const FEATURE_BLOCK_SIZE: i32 = -8;
const FEATURE_DIRECTORY_SENTINEL: i32 = -10;
const FEATURE_PERMISSIONS: i32 = -11;
const FEATURE_GENERATION_STAMP: i32 = -12;
const FEATURE_UNDER_CONSTRUCTION: i32 = -13;
const FEATURE_BLOCK_GENSTAMP: i32 = -14;
const FEATURE_NUM_FILES_LONG: i32 = -16;
const FEATURE_NS_QUOTA: i32 = -16;
const FEATURE_FILE_ACCESS_TIME: i32 = -17;
const FEATURE_DS_QUOTA: i32 = -18;
const FEATURE_COMPRESSION: i32 = -25;
const FEATURE_LOCAL_NAMES: i32 = -30;
const FEATURE_STORED_TXIDS: i32 = -37;

fn has(version: i32, threshold: i32) -> bool {
    version <= threshold
}

/// Errors raised while reading or writing an image file. Every variant names
/// the file it concerns.
#[derive(Error, Debug)]
pub enum ImageFormatError {
    #[error("I/O error on image {file:?}: {source}")]
    Io {
        file: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image {file:?} is corrupt: {detail}")]
    Corrupt { file: PathBuf, detail: String },

    #[error("image {file:?} has layout version {version}, oldest readable is {oldest}")]
    UnsupportedLayout {
        file: PathBuf,
        version: i32,
        oldest: i32,
    },

    #[error("image {file:?} names unregistered compression codec {codec:?}")]
    UnknownCodec { file: PathBuf, codec: String },

    #[error("image {file:?} digest mismatch: recorded {expected}, computed {computed}")]
    DigestMismatch {
        file: PathBuf,
        expected: ImageDigest,
        computed: ImageDigest,
    },

    #[error("layout version {version} cannot carry a compressed image")]
    CompressionUnsupported { version: i32 },

    #[error(transparent)]
    Cancelled(#[from] SaveCancelled),
}

pub type ImageFormatResult<T> = Result<T, ImageFormatError>;

fn ioe(file: &Path, source: io::Error) -> ImageFormatError {
    if source.kind() == io::ErrorKind::UnexpectedEof {
        ImageFormatError::Corrupt {
            file: file.to_path_buf(),
            detail: "unexpected end of image".to_string(),
        }
    } else {
        ImageFormatError::Io {
            file: file.to_path_buf(),
            source,
        }
    }
}

fn corrupt(file: &Path, detail: impl Into<String>) -> ImageFormatError {
    ImageFormatError::Corrupt {
        file: file.to_path_buf(),
        detail: detail.into(),
    }
}

// Wire primitives. Strings are u16 length + UTF-8; paths are byte sequences
// split on '/'.

fn write_u16<W: Write + ?Sized>(out: &mut W, v: u16) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

fn write_i16<W: Write + ?Sized>(out: &mut W, v: i16) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

fn write_i32<W: Write + ?Sized>(out: &mut W, v: i32) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

fn write_i64<W: Write + ?Sized>(out: &mut W, v: i64) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

fn write_bool<W: Write + ?Sized>(out: &mut W, v: bool) -> io::Result<()> {
    out.write_all(&[v as u8])
}

fn write_name<W: Write + ?Sized>(out: &mut W, name: &[u8]) -> io::Result<()> {
    write_u16(out, name.len() as u16)?;
    out.write_all(name)
}

fn write_string<W: Write + ?Sized>(out: &mut W, s: &str) -> io::Result<()> {
    write_name(out, s.as_bytes())
}

fn read_exact<R: Read + ?Sized, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u16<R: Read + ?Sized>(r: &mut R) -> io::Result<u16> {
    Ok(u16::from_be_bytes(read_exact(r)?))
}

fn read_i16<R: Read + ?Sized>(r: &mut R) -> io::Result<i16> {
    Ok(i16::from_be_bytes(read_exact(r)?))
}

fn read_i32<R: Read + ?Sized>(r: &mut R) -> io::Result<i32> {
    Ok(i32::from_be_bytes(read_exact(r)?))
}

fn read_i64<R: Read + ?Sized>(r: &mut R) -> io::Result<i64> {
    Ok(i64::from_be_bytes(read_exact(r)?))
}

fn read_bool<R: Read + ?Sized>(r: &mut R) -> io::Result<bool> {
    Ok(read_exact::<R, 1>(r)?[0] != 0)
}

fn read_name<R: Read + ?Sized>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string<R: Read + ?Sized>(r: &mut R, file: &Path) -> ImageFormatResult<String> {
    let bytes = read_name(r).map_err(|e| ioe(file, e))?;
    String::from_utf8(bytes).map_err(|_| corrupt(file, "string is not valid UTF-8"))
}

/// Options controlling a save.
pub struct SaveOptions<'a> {
    pub layout_version: i32,
    pub namespace_id: i32,
    pub codec: Option<&'a dyn ImageCodec>,
    pub context: &'a SaveContext,
}

/// Options controlling a load.
pub struct LoadOptions<'a> {
    pub registry: &'a CodecRegistry,
    /// Digest recorded in `VERSION`, when one exists.
    pub expected_digest: Option<ImageDigest>,
    /// Replication clamp supplied by the edit journal.
    pub adjust_replication: Option<&'a (dyn Fn(i16) -> i16 + 'a)>,
}

/// Prefix fields and the digest of a loaded image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub layout_version: i32,
    pub namespace_id: i32,
    pub image_tx_id: i64,
    pub digest: ImageDigest,
    /// True when the declared layout is older than [`LAYOUT_VERSION`].
    pub needs_resave: bool,
}

/// Stream the namespace tree into `file` at the requested layout version,
/// fsync it, and return the digest of the written bytes.
pub fn save_image(
    tree: &NamespaceTree,
    file: &Path,
    opts: &SaveOptions<'_>,
) -> ImageFormatResult<ImageDigest> {
    if opts.codec.is_some() && !has(opts.layout_version, FEATURE_COMPRESSION) {
        return Err(ImageFormatError::CompressionUnsupported {
            version: opts.layout_version,
        });
    }
    opts.context.check_cancelled()?;

    let start = std::time::Instant::now();
    let version = opts.layout_version;
    let sink = File::create(file).map_err(|e| ioe(file, e))?;
    let mut out = DigestWriter::new(BufWriter::new(sink));

    let num_nodes = tree.num_nodes();
    (|| -> io::Result<()> {
        write_i32(&mut out, version)?;
        write_i32(&mut out, opts.namespace_id)?;
        if has(version, FEATURE_NUM_FILES_LONG) {
            write_i64(&mut out, num_nodes as i64)?;
        } else {
            write_i32(&mut out, num_nodes as i32)?;
        }
        if has(version, FEATURE_GENERATION_STAMP) {
            write_i64(&mut out, tree.generation_stamp)?;
        }
        if has(version, FEATURE_STORED_TXIDS) {
            write_i64(&mut out, opts.context.tx_id())?;
        }
        if has(version, FEATURE_COMPRESSION) {
            write_bool(&mut out, opts.codec.is_some())?;
            if let Some(codec) = opts.codec {
                write_string(&mut out, codec.name())?;
            }
        }
        Ok(())
    })()
    .map_err(|e| ioe(file, e))?;

    if let Some(codec) = opts.codec {
        debug!("saving image {:?} compressed with codec {}", file, codec.name());
        let sink: &mut dyn Write = &mut out;
        let mut body = codec.encoder(sink).map_err(|e| ioe(file, e))?;
        save_body(tree, file, version, opts.context, &mut *body)?;
        body.finish().map_err(|e| ioe(file, e))?;
    } else {
        save_body(tree, file, version, opts.context, &mut out)?;
    }

    out.flush().map_err(|e| ioe(file, e))?;
    let (digest, buffered) = out.finish();
    let sink = buffered
        .into_inner()
        .map_err(|e| ioe(file, e.into_error()))?;
    sink.sync_all().map_err(|e| ioe(file, e))?;

    info!(
        "saved image {:?}: {} inodes at layout {} in {:?}",
        file,
        num_nodes,
        version,
        start.elapsed()
    );
    Ok(digest)
}

fn save_body<W: Write + ?Sized>(
    tree: &NamespaceTree,
    file: &Path,
    version: i32,
    ctx: &SaveContext,
    out: &mut W,
) -> ImageFormatResult<()> {
    let mut percent = 0u64;
    if has(version, FEATURE_LOCAL_NAMES) {
        // Root payload first, then directory records in preorder.
        write_name(out, &[]).map_err(|e| ioe(file, e))?;
        save_inode_payload(out, version, &InodeView::Directory(&tree.root)).map_err(|e| ioe(file, e))?;
        ctx.add_processed(1);

        let mut path = Vec::with_capacity(256);
        save_directory(file, version, ctx, &mut path, &tree.root, &mut percent, out)?;
    } else {
        write_string(out, "").map_err(|e| ioe(file, e))?;
        save_inode_payload(out, version, &InodeView::Directory(&tree.root)).map_err(|e| ioe(file, e))?;
        ctx.add_processed(1);

        let mut path = Vec::with_capacity(256);
        save_full_paths(file, version, ctx, &mut path, &tree.root, &mut percent, out)?;
    }

    if has(version, FEATURE_UNDER_CONSTRUCTION) {
        save_under_construction(tree, file, out)?;
    }
    Ok(())
}

fn report_saved(file: &Path, percent: &mut u64, new_percent: u64) {
    if new_percent > *percent {
        debug!("saved {}% of image {:?}", new_percent, file);
        *percent = new_percent;
    }
}

/// Local-name form: emit the directory's children, then recurse into each
/// child directory. Empty directories produce no record of their own.
fn save_directory<W: Write + ?Sized>(
    file: &Path,
    version: i32,
    ctx: &SaveContext,
    path: &mut Vec<u8>,
    dir: &DirectoryNode,
    percent: &mut u64,
    out: &mut W,
) -> ImageFormatResult<()> {
    ctx.check_cancelled()?;
    if dir.children.is_empty() {
        return Ok(());
    }

    (|| -> io::Result<()> {
        if path.is_empty() {
            write_name(out, &[PATH_SEPARATOR])?;
        } else {
            write_name(out, path)?;
        }
        write_i32(out, dir.children.len() as i32)?;
        Ok(())
    })()
    .map_err(|e| ioe(file, e))?;

    for child in &dir.children {
        write_name(out, child.name()).map_err(|e| ioe(file, e))?;
        save_inode_payload(out, version, &InodeView::from(child)).map_err(|e| ioe(file, e))?;
        report_saved(file, percent, ctx.add_processed(1));
    }

    let prefix_len = path.len();
    for child in &dir.children {
        if let INode::Directory(sub) = child {
            ctx.check_cancelled()?;
            path.push(PATH_SEPARATOR);
            path.extend_from_slice(&sub.name);
            save_directory(file, version, ctx, path, sub, percent, out)?;
            path.truncate(prefix_len);
        }
    }
    Ok(())
}

/// Full-path form: every inode is a length-prefixed absolute path followed by
/// its payload, parents emitted before children.
fn save_full_paths<W: Write + ?Sized>(
    file: &Path,
    version: i32,
    ctx: &SaveContext,
    path: &mut Vec<u8>,
    dir: &DirectoryNode,
    percent: &mut u64,
    out: &mut W,
) -> ImageFormatResult<()> {
    ctx.check_cancelled()?;
    let prefix_len = path.len();
    for child in &dir.children {
        path.push(PATH_SEPARATOR);
        path.extend_from_slice(child.name());
        write_name(out, path).map_err(|e| ioe(file, e))?;
        save_inode_payload(out, version, &InodeView::from(child)).map_err(|e| ioe(file, e))?;
        report_saved(file, percent, ctx.add_processed(1));
        if let INode::Directory(sub) = child {
            save_full_paths(file, version, ctx, path, sub, percent, out)?;
        }
        path.truncate(prefix_len);
    }
    Ok(())
}

fn save_under_construction<W: Write + ?Sized>(
    tree: &NamespaceTree,
    file: &Path,
    out: &mut W,
) -> ImageFormatResult<()> {
    (|| -> io::Result<()> {
        write_i32(out, tree.under_construction.len() as i32)?;
        for fuc in &tree.under_construction {
            write_string(out, &fuc.path)?;
            write_i16(out, fuc.replication)?;
            write_i64(out, fuc.mtime)?;
            write_i64(out, fuc.preferred_block_size)?;
            write_i32(out, fuc.blocks.len() as i32)?;
            for block in &fuc.blocks {
                write_i64(out, block.id)?;
                write_i64(out, block.num_bytes)?;
                write_i64(out, block.generation_stamp)?;
            }
            write_permission(out, &fuc.permission)?;
            write_string(out, &fuc.client_name)?;
            write_string(out, &fuc.client_machine)?;
            // Block locations are never persisted.
            write_i32(out, 0)?;
        }
        Ok(())
    })()
    .map_err(|e| ioe(file, e))
}

/// Borrowed view over either inode shape, so the root directory can share the
/// payload writer with tree nodes.
enum InodeView<'a> {
    Directory(&'a DirectoryNode),
    File(&'a FileNode),
}

impl<'a> From<&'a INode> for InodeView<'a> {
    fn from(node: &'a INode) -> Self {
        match node {
            INode::Directory(d) => InodeView::Directory(d),
            INode::File(f) => InodeView::File(f),
        }
    }
}

fn write_permission<W: Write + ?Sized>(out: &mut W, p: &PermissionStatus) -> io::Result<()> {
    write_string(out, &p.user)?;
    write_string(out, &p.group)?;
    write_u16(out, p.mode)
}

fn save_inode_payload<W: Write + ?Sized>(
    out: &mut W,
    version: i32,
    node: &InodeView<'_>,
) -> io::Result<()> {
    match node {
        InodeView::File(f) => {
            write_i16(out, f.replication)?;
            write_i64(out, f.mtime)?;
            if has(version, FEATURE_FILE_ACCESS_TIME) {
                write_i64(out, f.atime)?;
            }
            if has(version, FEATURE_BLOCK_SIZE) {
                write_i64(out, f.preferred_block_size)?;
            }
            write_i32(out, f.blocks.len() as i32)?;
            for block in &f.blocks {
                write_i64(out, block.id)?;
                write_i64(out, block.num_bytes)?;
                if has(version, FEATURE_BLOCK_GENSTAMP) {
                    write_i64(out, block.generation_stamp)?;
                }
            }
            if has(version, FEATURE_PERMISSIONS) {
                write_permission(out, &f.permission)?;
            }
        }
        InodeView::Directory(d) => {
            write_i16(out, 0)?;
            write_i64(out, d.mtime)?;
            if has(version, FEATURE_FILE_ACCESS_TIME) {
                write_i64(out, 0)?;
            }
            if has(version, FEATURE_BLOCK_SIZE) {
                write_i64(out, 0)?;
            }
            // Layouts older than the directory sentinel mark directories with
            // an empty block list instead of -1.
            if has(version, FEATURE_DIRECTORY_SENTINEL) {
                write_i32(out, -1)?;
            } else {
                write_i32(out, 0)?;
            }
            if has(version, FEATURE_NS_QUOTA) {
                write_i64(out, d.ns_quota)?;
            }
            if has(version, FEATURE_DS_QUOTA) {
                write_i64(out, d.ds_quota)?;
            }
            if has(version, FEATURE_PERMISSIONS) {
                write_permission(out, &d.permission)?;
            }
        }
    }
    Ok(())
}

/// Load an image into `tree`, verifying the digest when one is expected.
/// The tree's root attributes are replaced; loaded inodes are inserted under
/// it. Any trailing bytes after the final section are fatal.
pub fn load_image(
    tree: &mut NamespaceTree,
    file: &Path,
    opts: &LoadOptions<'_>,
) -> ImageFormatResult<LoadedImage> {
    let start = std::time::Instant::now();
    let source = File::open(file).map_err(|e| ioe(file, e))?;
    let mut reader = DigestReader::new(BufReader::new(source));

    let version = read_i32(&mut reader).map_err(|e| ioe(file, e))?;
    if version >= 0 {
        return Err(corrupt(file, format!("non-negative layout version {}", version)));
    }
    if version < LAYOUT_VERSION {
        return Err(corrupt(
            file,
            format!("layout version {} is newer than supported {}", version, LAYOUT_VERSION),
        ));
    }
    if version > LAST_UPGRADABLE_VERSION {
        return Err(ImageFormatError::UnsupportedLayout {
            file: file.to_path_buf(),
            version,
            oldest: LAST_UPGRADABLE_VERSION,
        });
    }

    let namespace_id = read_i32(&mut reader).map_err(|e| ioe(file, e))?;
    let num_files = if has(version, FEATURE_NUM_FILES_LONG) {
        read_i64(&mut reader).map_err(|e| ioe(file, e))?
    } else {
        read_i32(&mut reader).map_err(|e| ioe(file, e))? as i64
    };
    if num_files < 1 {
        return Err(corrupt(file, format!("image declares {} inodes", num_files)));
    }
    if has(version, FEATURE_GENERATION_STAMP) {
        tree.generation_stamp = read_i64(&mut reader).map_err(|e| ioe(file, e))?;
    }
    let image_tx_id = if has(version, FEATURE_STORED_TXIDS) {
        read_i64(&mut reader).map_err(|e| ioe(file, e))?
    } else {
        -1
    };

    let mut codec: Option<std::sync::Arc<dyn ImageCodec>> = None;
    if has(version, FEATURE_COMPRESSION) && read_bool(&mut reader).map_err(|e| ioe(file, e))? {
        let name = read_string(&mut reader, file)?;
        match opts.registry.get(&name) {
            Some(c) => {
                debug!("loading image {:?} compressed with codec {}", file, name);
                codec = Some(c);
            }
            None => {
                return Err(ImageFormatError::UnknownCodec {
                    file: file.to_path_buf(),
                    codec: name,
                })
            }
        }
    }

    {
        let mut body: Box<dyn Read + '_> = match &codec {
            Some(c) => {
                let source: &mut dyn Read = &mut reader;
                c.decoder(source).map_err(|e| ioe(file, e))?
            }
            None => Box::new(&mut reader),
        };

        if has(version, FEATURE_LOCAL_NAMES) {
            load_local_name_inodes(tree, file, version, num_files, opts, &mut *body)?;
        } else {
            load_full_name_inodes(tree, file, version, num_files, opts, &mut *body)?;
        }
        if has(version, FEATURE_UNDER_CONSTRUCTION) {
            load_under_construction(tree, file, &mut *body)?;
        }

        // Anything after the final section is corruption.
        let mut probe = [0u8; 1];
        let n = body.read(&mut probe).map_err(|e| ioe(file, e))?;
        if n != 0 {
            return Err(corrupt(file, "trailing bytes after end of image"));
        }
    }

    let computed = reader.finish();
    if let Some(expected) = opts.expected_digest {
        if expected != computed {
            return Err(ImageFormatError::DigestMismatch {
                file: file.to_path_buf(),
                expected,
                computed,
            });
        }
    }

    info!(
        "loaded image {:?}: {} inodes at layout {} in {:?}",
        file,
        num_files,
        version,
        start.elapsed()
    );
    Ok(LoadedImage {
        layout_version: version,
        namespace_id,
        image_tx_id,
        digest: computed,
        needs_resave: version != LAYOUT_VERSION,
    })
}

/// Payload of one inode, name attached by the caller.
enum LoadedInode {
    Directory {
        mtime: i64,
        ns_quota: i64,
        ds_quota: i64,
        permission: PermissionStatus,
    },
    File(FileNode),
}

fn load_inode<R: Read + ?Sized>(
    tree: &NamespaceTree,
    file: &Path,
    version: i32,
    opts: &LoadOptions<'_>,
    r: &mut R,
) -> ImageFormatResult<LoadedInode> {
    let mut replication = read_i16(r).map_err(|e| ioe(file, e))?;
    if let Some(clamp) = opts.adjust_replication {
        replication = clamp(replication);
    }
    let mtime = read_i64(r).map_err(|e| ioe(file, e))?;
    let atime = if has(version, FEATURE_FILE_ACCESS_TIME) {
        read_i64(r).map_err(|e| ioe(file, e))?
    } else {
        0
    };
    let mut block_size = if has(version, FEATURE_BLOCK_SIZE) {
        read_i64(r).map_err(|e| ioe(file, e))?
    } else {
        0
    };
    let num_blocks = read_i32(r).map_err(|e| ioe(file, e))?;
    if num_blocks < -1 {
        return Err(corrupt(file, format!("inode declares {} blocks", num_blocks)));
    }

    // Older layouts mark directories with an empty block list; newer ones
    // use -1 and allow files with zero blocks.
    let is_file = if has(version, FEATURE_DIRECTORY_SENTINEL) {
        num_blocks >= 0
    } else {
        num_blocks > 0
    };

    if is_file {
        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            let id = read_i64(r).map_err(|e| ioe(file, e))?;
            let num_bytes = read_i64(r).map_err(|e| ioe(file, e))?;
            let generation_stamp = if has(version, FEATURE_BLOCK_GENSTAMP) {
                read_i64(r).map_err(|e| ioe(file, e))?
            } else {
                GRANDFATHER_GENERATION_STAMP
            };
            blocks.push(Block::new(id, num_bytes, generation_stamp));
        }
        // Layouts at or before the block-size threshold may still carry a
        // zero: infer from the first block, falling back to the default.
        if version >= FEATURE_BLOCK_SIZE && block_size == 0 {
            block_size = if blocks.len() > 1 {
                blocks[0].num_bytes
            } else {
                let first = blocks.first().map(|b| b.num_bytes).unwrap_or(0);
                tree.default_block_size.max(first)
            };
        }
        let permission = if has(version, FEATURE_PERMISSIONS) {
            read_permission(r, file)?
        } else {
            tree.upgrade_permission.clone()
        };
        Ok(LoadedInode::File(FileNode {
            name: Vec::new(),
            replication,
            mtime,
            atime,
            preferred_block_size: block_size,
            blocks,
            permission,
        }))
    } else {
        let ns_quota = if has(version, FEATURE_NS_QUOTA) {
            read_i64(r).map_err(|e| ioe(file, e))?
        } else {
            -1
        };
        let ds_quota = if has(version, FEATURE_DS_QUOTA) {
            read_i64(r).map_err(|e| ioe(file, e))?
        } else {
            -1
        };
        let permission = if has(version, FEATURE_PERMISSIONS) {
            read_permission(r, file)?
        } else {
            tree.upgrade_permission.clone()
        };
        Ok(LoadedInode::Directory {
            mtime,
            ns_quota,
            ds_quota,
            permission,
        })
    }
}

fn read_permission<R: Read + ?Sized>(r: &mut R, file: &Path) -> ImageFormatResult<PermissionStatus> {
    let user = read_string(r, file)?;
    let group = read_string(r, file)?;
    let mode = read_u16(r).map_err(|e| ioe(file, e))?;
    Ok(PermissionStatus { user, group, mode })
}

/// Apply a root record's attributes to the existing root instead of
/// allocating a new node. Quotas of -1 leave the current values alone.
fn apply_root_attrs(tree: &mut NamespaceTree, file: &Path, inode: LoadedInode) -> ImageFormatResult<()> {
    match inode {
        LoadedInode::Directory {
            mtime,
            ns_quota,
            ds_quota,
            permission,
        } => {
            if ns_quota != -1 {
                tree.root.ns_quota = ns_quota;
            }
            if ds_quota != -1 {
                tree.root.ds_quota = ds_quota;
            }
            tree.root.mtime = mtime;
            tree.root.permission = permission;
            Ok(())
        }
        LoadedInode::File(_) => Err(corrupt(file, "root inode is not a directory")),
    }
}

fn into_inode(name: Vec<u8>, payload: LoadedInode) -> INode {
    match payload {
        LoadedInode::File(mut f) => {
            f.name = name;
            INode::File(f)
        }
        LoadedInode::Directory {
            mtime,
            ns_quota,
            ds_quota,
            permission,
        } => {
            let mut dir = DirectoryNode::new(name, mtime, permission);
            dir.ns_quota = ns_quota;
            dir.ds_quota = ds_quota;
            INode::Directory(dir)
        }
    }
}

fn load_local_name_inodes<R: Read + ?Sized>(
    tree: &mut NamespaceTree,
    file: &Path,
    version: i32,
    num_files: i64,
    opts: &LoadOptions<'_>,
    r: &mut R,
) -> ImageFormatResult<()> {
    // The first record is the root, signalled by a zero-length name.
    let root_name = read_name(r).map_err(|e| ioe(file, e))?;
    if !root_name.is_empty() {
        return Err(corrupt(file, "first inode record is not the root"));
    }
    let root = load_inode(tree, file, version, opts, r)?;
    apply_root_attrs(tree, file, root)?;

    let mut loaded: i64 = 1;
    let mut percent = 0;
    while loaded < num_files {
        loaded += load_directory_record(tree, file, version, opts, r)? as i64;
        let new_percent = (loaded as u64) * 100 / (num_files as u64);
        if new_percent > percent {
            debug!("loaded {}% of image {:?}", new_percent, file);
            percent = new_percent;
        }
    }
    if loaded != num_files {
        return Err(corrupt(
            file,
            format!("read {} inodes, image declares {}", loaded, num_files),
        ));
    }
    Ok(())
}

/// One directory record of the local-name form: parent path, child count,
/// then the children in order. Returns the number of children read.
fn load_directory_record<R: Read + ?Sized>(
    tree: &mut NamespaceTree,
    file: &Path,
    version: i32,
    opts: &LoadOptions<'_>,
    r: &mut R,
) -> ImageFormatResult<u32> {
    let parent_name = read_name(r).map_err(|e| ioe(file, e))?;
    let num_children = read_i32(r).map_err(|e| ioe(file, e))?;
    if num_children < 0 {
        return Err(corrupt(
            file,
            format!("directory record declares {} children", num_children),
        ));
    }

    let mut children = Vec::with_capacity(num_children as usize);
    for _ in 0..num_children {
        let name = read_name(r).map_err(|e| ioe(file, e))?;
        let payload = load_inode(tree, file, version, opts, r)?;
        children.push(into_inode(name, payload));
    }

    let components = NamespaceTree::path_components(&parent_name);
    let parent = tree.get_dir_mut(&components).map_err(|_| {
        corrupt(
            file,
            format!(
                "parent path {:?} is not a directory in the image",
                String::from_utf8_lossy(&parent_name)
            ),
        )
    })?;
    parent.children.extend(children);
    Ok(num_children as u32)
}

fn load_full_name_inodes<R: Read + ?Sized>(
    tree: &mut NamespaceTree,
    file: &Path,
    version: i32,
    num_files: i64,
    opts: &LoadOptions<'_>,
    r: &mut R,
) -> ImageFormatResult<()> {
    // Entries arrive parent-before-child; consecutive entries usually share a
    // parent, so the resolved parent path rides along as a cursor.
    let mut parent_path: Vec<Vec<u8>> = Vec::new();
    for i in 0..num_files {
        let path = read_name(r).map_err(|e| ioe(file, e))?;
        let payload = load_inode(tree, file, version, opts, r)?;
        let components: Vec<Vec<u8>> =
            NamespaceTree::path_components(&path).iter().map(|c| c.to_vec()).collect();

        if components.is_empty() {
            if i != 0 {
                return Err(corrupt(file, "root entry is not the first record"));
            }
            apply_root_attrs(tree, file, payload)?;
            continue;
        }

        let (name, parent) = components.split_last().expect("non-empty components");
        if parent != parent_path.as_slice() {
            parent_path = parent.to_vec();
        }
        let parent_refs: Vec<&[u8]> = parent_path.iter().map(|c| c.as_slice()).collect();
        let node = into_inode(name.clone(), payload);
        tree.insert(&parent_refs, node).map_err(|_| {
            corrupt(
                file,
                format!(
                    "parent of {:?} not found in the image",
                    String::from_utf8_lossy(&path)
                ),
            )
        })?;
    }
    Ok(())
}

fn load_under_construction<R: Read + ?Sized>(
    tree: &mut NamespaceTree,
    file: &Path,
    r: &mut R,
) -> ImageFormatResult<()> {
    let count = read_i32(r).map_err(|e| ioe(file, e))?;
    if count < 0 {
        return Err(corrupt(
            file,
            format!("image declares {} files under construction", count),
        ));
    }
    debug!("loading {} files under construction from {:?}", count, file);

    for _ in 0..count {
        let path = read_string(r, file)?;
        let replication = read_i16(r).map_err(|e| ioe(file, e))?;
        let mtime = read_i64(r).map_err(|e| ioe(file, e))?;
        let preferred_block_size = read_i64(r).map_err(|e| ioe(file, e))?;
        let num_blocks = read_i32(r).map_err(|e| ioe(file, e))?;
        if num_blocks < 0 {
            return Err(corrupt(
                file,
                format!("lease record declares {} blocks", num_blocks),
            ));
        }
        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            blocks.push(Block::new(
                read_i64(r).map_err(|e| ioe(file, e))?,
                read_i64(r).map_err(|e| ioe(file, e))?,
                read_i64(r).map_err(|e| ioe(file, e))?,
            ));
        }
        let permission = read_permission(r, file)?;
        let client_name = read_string(r, file)?;
        let client_machine = read_string(r, file)?;
        let num_locations = read_i32(r).map_err(|e| ioe(file, e))?;
        if num_locations != 0 {
            return Err(corrupt(
                file,
                format!("lease record carries {} block locations", num_locations),
            ));
        }

        tree.add_under_construction(FileUnderConstruction {
            path: path.clone(),
            replication,
            mtime,
            preferred_block_size,
            blocks,
            permission,
            client_name,
            client_machine,
        })
        .map_err(|e| corrupt(file, format!("invalid lease: {}", e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceError;
    use tempfile::TempDir;

    fn perm(user: &str) -> PermissionStatus {
        PermissionStatus::new(user, "staff", 0o644)
    }

    fn sample_tree() -> NamespaceTree {
        let mut tree = NamespaceTree::new();
        tree.root.mtime = 777;
        tree.mkdirs(&[b"data", b"warm"], 10).unwrap();
        tree.insert(
            &[b"data"],
            INode::File(FileNode {
                name: b"metrics.log".to_vec(),
                replication: 3,
                mtime: 20,
                atime: 21,
                preferred_block_size: 4096,
                blocks: vec![Block::new(9, 4096, 1001), Block::new(10, 512, 1002)],
                permission: perm("alice"),
            }),
        )
        .unwrap();
        tree.insert(
            &[b"data", b"warm"],
            INode::File(FileNode {
                name: b"empty".to_vec(),
                replication: 1,
                mtime: 30,
                atime: 31,
                preferred_block_size: 1024,
                blocks: Vec::new(),
                permission: perm("bob"),
            }),
        )
        .unwrap();
        tree
    }

    fn save_load(tree: &NamespaceTree, version: i32) -> NamespaceTree {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("fsimage");
        let ctx = SaveContext::new();
        let digest = save_image(
            tree,
            &image,
            &SaveOptions {
                layout_version: version,
                namespace_id: 4711,
                codec: None,
                context: &ctx,
            },
        )
        .unwrap();

        let registry = CodecRegistry::with_defaults();
        let mut loaded = NamespaceTree::new();
        loaded.default_block_size = tree.default_block_size;
        loaded.upgrade_permission = tree.upgrade_permission.clone();
        let info = load_image(
            &mut loaded,
            &image,
            &LoadOptions {
                registry: &registry,
                expected_digest: Some(digest),
                adjust_replication: None,
            },
        )
        .unwrap();
        assert_eq!(info.layout_version, version);
        assert_eq!(info.namespace_id, 4711);
        loaded
    }

    #[test]
    fn test_round_trip_current_layout() {
        let tree = sample_tree();
        let loaded = save_load(&tree, LAYOUT_VERSION);
        assert_eq!(loaded.root, tree.root);
        assert_eq!(loaded.generation_stamp, tree.generation_stamp);
    }

    #[test]
    fn test_round_trip_full_path_layout() {
        let tree = sample_tree();
        // -26 predates local names, so the full-path body form is used.
        let loaded = save_load(&tree, -26);
        assert_eq!(loaded.root, tree.root);
    }

    #[test]
    fn test_trailing_bytes_are_fatal() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("fsimage");
        let tree = sample_tree();
        let ctx = SaveContext::new();
        save_image(
            &tree,
            &image,
            &SaveOptions {
                layout_version: LAYOUT_VERSION,
                namespace_id: 1,
                codec: None,
                context: &ctx,
            },
        )
        .unwrap();

        use std::io::Write as _;
        let mut f = std::fs::OpenOptions::new().append(true).open(&image).unwrap();
        f.write_all(&[0u8]).unwrap();

        let registry = CodecRegistry::with_defaults();
        let mut loaded = NamespaceTree::new();
        let err = load_image(
            &mut loaded,
            &image,
            &LoadOptions {
                registry: &registry,
                expected_digest: None,
                adjust_replication: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ImageFormatError::Corrupt { .. }), "{err}");
    }

    #[test]
    fn test_replication_clamp_applies() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("fsimage");
        let tree = sample_tree();
        let ctx = SaveContext::new();
        save_image(
            &tree,
            &image,
            &SaveOptions {
                layout_version: LAYOUT_VERSION,
                namespace_id: 1,
                codec: None,
                context: &ctx,
            },
        )
        .unwrap();

        let registry = CodecRegistry::with_defaults();
        let mut loaded = NamespaceTree::new();
        let clamp = |r: i16| r.min(2);
        load_image(
            &mut loaded,
            &image,
            &LoadOptions {
                registry: &registry,
                expected_digest: None,
                adjust_replication: Some(&clamp),
            },
        )
        .unwrap();

        match loaded.get_path(b"/data/metrics.log").unwrap() {
            crate::namespace::NodeRef::Node(INode::File(f)) => assert_eq!(f.replication, 2),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_lease_for_missing_file_is_corrupt() {
        let mut tree = NamespaceTree::new();
        let err = tree
            .add_under_construction(FileUnderConstruction {
                path: "/gone".to_string(),
                replication: 1,
                mtime: 0,
                preferred_block_size: 0,
                blocks: Vec::new(),
                permission: perm("x"),
                client_name: "c".to_string(),
                client_machine: "m".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound(_)));
    }
}
