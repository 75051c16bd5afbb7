//! Integration tests for the image wire format.
//!
//! Round-trips across layout versions and body forms, the boundary trees
//! from the format contract, and the corruption signals a loader must raise.

use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

use namekeeper::codec_registry::CodecRegistry;
use namekeeper::image_format::{
    load_image, save_image, ImageFormatError, LoadOptions, SaveOptions, LAYOUT_VERSION,
};
use namekeeper::namespace::{
    Block, FileNode, FileUnderConstruction, INode, NamespaceTree, NodeRef, PermissionStatus,
    GRANDFATHER_GENERATION_STAMP,
};
use namekeeper::SaveContext;

fn perm(user: &str) -> PermissionStatus {
    PermissionStatus::new(user, "staff", 0o644)
}

fn file(name: &str, blocks: Vec<Block>) -> INode {
    INode::File(FileNode {
        name: name.as_bytes().to_vec(),
        replication: 2,
        mtime: 300,
        atime: 301,
        preferred_block_size: 8192,
        blocks,
        permission: perm("carol"),
    })
}

/// A tree whose fields are all representable at the given layout version,
/// so that decode(encode(tree, version), version) is an identity. Fields a
/// layout cannot carry are pinned to the values its decoder substitutes.
fn tree_for_version(version: i32) -> NamespaceTree {
    let mut tree = NamespaceTree::new();
    tree.root.mtime = 11;
    if version > -11 {
        // Permissions are not stored; the decoder substitutes the default.
        tree.root.permission = tree.upgrade_permission.clone();
    }
    tree.mkdirs(&[b"a"], 12).unwrap();
    tree.mkdirs(&[b"a", b"deep"], 13).unwrap();
    tree.mkdirs(&[b"empty"], 14).unwrap();

    let genstamp = |g: i64| {
        if version <= -14 {
            g
        } else {
            GRANDFATHER_GENERATION_STAMP
        }
    };
    let blocks = vec![
        Block::new(1, 8192, genstamp(2001)),
        Block::new(2, 100, genstamp(2002)),
    ];
    let one_block = vec![Block::new(3, 8192, genstamp(2003))];

    if version <= -16 {
        if let Some(INode::Directory(d)) = tree.root.children.first_mut() {
            d.ns_quota = 1000;
            if version <= -18 {
                d.ds_quota = 1 << 40;
            }
        }
    }

    let default_block_size = tree.default_block_size;
    let upgrade_permission = tree.upgrade_permission.clone();
    let adjust = |node: INode, single_block: bool| -> INode {
        match node {
            INode::File(mut f) => {
                if version > -17 {
                    f.atime = 0;
                }
                if version > -11 {
                    f.permission = upgrade_permission.clone();
                }
                if version > -8 {
                    // Without a stored block size the decoder infers one.
                    f.preferred_block_size = if single_block {
                        default_block_size.max(f.blocks[0].num_bytes)
                    } else {
                        f.blocks[0].num_bytes
                    };
                }
                INode::File(f)
            }
            other => other,
        }
    };

    tree.insert(&[b"a"], adjust(file("two-blocks", blocks), false))
        .unwrap();
    tree.insert(&[b"a", b"deep"], adjust(file("one-block", one_block), true))
        .unwrap();
    if version <= -10 {
        // Older layouts cannot represent a file without blocks.
        tree.insert(&[b"a"], adjust(file("no-blocks", Vec::new()), false))
            .unwrap();
    }
    tree
}

fn round_trip_at(version: i32) {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let tree = tree_for_version(version);

    let ctx = SaveContext::new();
    let digest = save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: version,
            namespace_id: 7,
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
    assert_eq!(info.needs_resave, version != LAYOUT_VERSION);
    assert_eq!(loaded.root, tree.root, "layout {}", version);
    assert_eq!(loaded.under_construction, tree.under_construction);
}

#[test]
fn test_round_trip_across_layout_versions() {
    // Current, the local-name threshold, the digest and compression
    // generation, both quota generations, and the oldest readable layouts.
    for version in [-37, -30, -29, -26, -25, -18, -16, -13, -11, -10, -8, -7] {
        round_trip_at(version);
    }
}

#[test]
fn test_round_trip_with_files_under_construction() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let mut tree = tree_for_version(LAYOUT_VERSION);
    tree.add_under_construction(FileUnderConstruction {
        path: "/a/two-blocks".to_string(),
        replication: 2,
        mtime: 300,
        preferred_block_size: 8192,
        blocks: vec![Block::new(9, 55, 2009)],
        permission: perm("carol"),
        client_name: "DFSClient_attempt_1".to_string(),
        client_machine: "worker-17".to_string(),
    })
    .unwrap();

    let ctx = SaveContext::new();
    let digest = save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let registry = CodecRegistry::with_defaults();
    let mut loaded = NamespaceTree::new();
    load_image(
        &mut loaded,
        &image,
        &LoadOptions {
            registry: &registry,
            expected_digest: Some(digest),
            adjust_replication: None,
        },
    )
    .unwrap();
    assert_eq!(loaded.under_construction, tree.under_construction);
}

fn compressed_round_trip(codec_name: &str) {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let tree = tree_for_version(LAYOUT_VERSION);

    let registry = CodecRegistry::with_defaults();
    let codec = registry.get(codec_name).unwrap();
    let ctx = SaveContext::new();
    let digest = save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: Some(codec.as_ref()),
            context: &ctx,
        },
    )
    .unwrap();

    let mut loaded = NamespaceTree::new();
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
    assert_eq!(info.digest, digest);
    assert_eq!(loaded.root, tree.root);
}

#[test]
fn test_zstd_compressed_image() {
    compressed_round_trip("zstd");
}

#[test]
fn test_lz4_compressed_image() {
    compressed_round_trip("lz4");
}

#[test]
fn test_empty_namespace_has_one_inode() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let tree = NamespaceTree::new();

    let ctx = SaveContext::new();
    save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let bytes = fs::read(&image).unwrap();
    let num_files = i64::from_be_bytes(bytes[8..16].try_into().unwrap());
    assert_eq!(num_files, 1);

    let registry = CodecRegistry::with_defaults();
    let mut loaded = NamespaceTree::new();
    load_image(
        &mut loaded,
        &image,
        &LoadOptions {
            registry: &registry,
            expected_digest: None,
            adjust_replication: None,
        },
    )
    .unwrap();
    assert_eq!(loaded.num_nodes(), 1);
}

#[test]
fn test_wide_directory_uses_i32_child_count() {
    // More children than fit a signed 16-bit count.
    let count = (1usize << 15) + 50;
    let mut tree = NamespaceTree::new();
    tree.mkdirs(&[b"wide"], 1).unwrap();
    for i in 0..count {
        tree.insert(
            &[b"wide"],
            file(&format!("f{:05}", i), vec![Block::new(i as i64, 1, 1000)]),
        )
        .unwrap();
    }

    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let ctx = SaveContext::new();
    let digest = save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let registry = CodecRegistry::with_defaults();
    let mut loaded = NamespaceTree::new();
    load_image(
        &mut loaded,
        &image,
        &LoadOptions {
            registry: &registry,
            expected_digest: Some(digest),
            adjust_replication: None,
        },
    )
    .unwrap();
    match loaded.get_path(b"/wide").unwrap() {
        NodeRef::Node(INode::Directory(d)) => assert_eq!(d.children.len(), count),
        other => panic!("unexpected node {:?}", other),
    }
}

#[test]
fn test_block_size_inferred_from_first_block() {
    // At the block-size threshold a stored zero is backfilled from block 0.
    let version = -8;
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");

    let mut tree = NamespaceTree::new();
    let node = FileNode {
        name: b"legacy".to_vec(),
        replication: 1,
        mtime: 5,
        atime: 0,
        preferred_block_size: 0,
        blocks: vec![
            Block::new(1, 4096, GRANDFATHER_GENERATION_STAMP),
            Block::new(2, 512, GRANDFATHER_GENERATION_STAMP),
        ],
        permission: tree.upgrade_permission.clone(),
    };
    tree.root.children.push(INode::File(node));

    let ctx = SaveContext::new();
    save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: version,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let registry = CodecRegistry::with_defaults();
    let mut loaded = NamespaceTree::new();
    loaded.default_block_size = tree.default_block_size;
    load_image(
        &mut loaded,
        &image,
        &LoadOptions {
            registry: &registry,
            expected_digest: None,
            adjust_replication: None,
        },
    )
    .unwrap();

    match loaded.get_path(b"/legacy").unwrap() {
        NodeRef::Node(INode::File(f)) => assert_eq!(f.preferred_block_size, 4096),
        other => panic!("unexpected node {:?}", other),
    }
}

#[test]
fn test_digest_mismatch_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let tree = tree_for_version(LAYOUT_VERSION);

    let ctx = SaveContext::new();
    save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let registry = CodecRegistry::with_defaults();
    let mut loaded = NamespaceTree::new();
    let err = load_image(
        &mut loaded,
        &image,
        &LoadOptions {
            registry: &registry,
            expected_digest: Some(namekeeper::ImageDigest::of(b"not this image")),
            adjust_replication: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImageFormatError::DigestMismatch { .. }), "{err}");
}

#[test]
fn test_truncated_image_is_corrupt() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let tree = tree_for_version(LAYOUT_VERSION);

    let ctx = SaveContext::new();
    save_image(
        &tree,
        &image,
        &SaveOptions {
            layout_version: LAYOUT_VERSION,
            namespace_id: 7,
            codec: None,
            context: &ctx,
        },
    )
    .unwrap();

    let full = fs::read(&image).unwrap();
    fs::write(&image, &full[..full.len() - 10]).unwrap();

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

fn write_prefix(image: &Path, compressed: bool, codec_name: &str) {
    let mut out = Vec::new();
    out.extend_from_slice(&LAYOUT_VERSION.to_be_bytes());
    out.extend_from_slice(&7i32.to_be_bytes());
    out.extend_from_slice(&1i64.to_be_bytes()); // inode count
    out.extend_from_slice(&1000i64.to_be_bytes()); // generation stamp
    out.extend_from_slice(&(-1i64).to_be_bytes()); // image tx id
    out.push(compressed as u8);
    if compressed {
        out.extend_from_slice(&(codec_name.len() as u16).to_be_bytes());
        out.extend_from_slice(codec_name.as_bytes());
    }
    let mut f = fs::File::create(image).unwrap();
    f.write_all(&out).unwrap();
}

#[test]
fn test_unknown_codec_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    write_prefix(&image, true, "snappy");

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
    match err {
        ImageFormatError::UnknownCodec { codec, .. } => assert_eq!(codec, "snappy"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_future_layout_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let mut out = Vec::new();
    out.extend_from_slice(&(LAYOUT_VERSION - 1).to_be_bytes());
    out.extend_from_slice(&7i32.to_be_bytes());
    fs::write(&image, &out).unwrap();

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
fn test_prehistoric_layout_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("fsimage");
    let mut out = Vec::new();
    out.extend_from_slice(&(-3i32).to_be_bytes());
    out.extend_from_slice(&7i32.to_be_bytes());
    fs::write(&image, &out).unwrap();

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
    assert!(matches!(err, ImageFormatError::UnsupportedLayout { .. }), "{err}");
}
