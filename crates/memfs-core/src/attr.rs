// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute synthesis. Nothing here is cached; every call recomputes from
//! the node as it is now.

use crate::store::Node;
use crate::Attributes;

pub const BLOCK_SIZE: u32 = 4096;

/// Reported size of every directory. Synthetic, not a storage figure.
pub const DIRECTORY_SIZE: u64 = 4096;

const SECTOR_SIZE: u64 = 512;

pub(crate) fn synthesize(node: &Node) -> Attributes {
    let size = match node.content() {
        Some(content) => content.len() as u64,
        None => DIRECTORY_SIZE,
    };

    Attributes {
        ino: node.id,
        kind: node.file_kind(),
        mode: node.mode,
        nlink: 1,
        size,
        atime: node.mtime,
        mtime: node.mtime,
        ctime: node.mtime,
        blksize: BLOCK_SIZE,
        blocks: size.div_ceil(SECTOR_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileKind, NodeId};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn file_size_tracks_content() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut node = Node::file(NodeId(2), "f", 0o644, mtime);
        node.content_mut().unwrap().extend_from_slice(&[7u8; 513]);

        let attr = synthesize(&node);
        assert_eq!(attr.ino, NodeId(2));
        assert_eq!(attr.kind, FileKind::File);
        assert_eq!(attr.size, 513);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.atime, mtime);
        assert_eq!(attr.ctime, mtime);
    }

    #[test]
    fn empty_file_has_no_blocks() {
        let node = Node::file(NodeId(2), "f", 0o644, UNIX_EPOCH);
        let attr = synthesize(&node);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.blocks, 0);
    }

    #[test]
    fn directory_reports_fixed_size() {
        let node = Node::directory(NodeId(3), "d", 0o755, UNIX_EPOCH);
        let attr = synthesize(&node);
        assert!(attr.is_dir());
        assert_eq!(attr.size, DIRECTORY_SIZE);
        assert_eq!(attr.blocks, 8);
        assert_eq!(attr.perm(), 0o755);
    }
}
