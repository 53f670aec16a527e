// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node store: owns every node and hands out identifiers
//!
//! Identifiers come from a counter that only moves forward, so an id is never
//! handed out twice, even after its node is removed. Lookups by ids that
//! arrive from a caller return `NotFound`; lookups by ids read out of a
//! children map go through [`NodeStore::node`], which panics, because a
//! missing node at that point means the table is corrupt.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use crate::error::{FsError, FsResult};
use crate::{FileKind, NodeId, ROOT_ID};

pub(crate) const PERM_MASK: u32 = 0o7777;

/// Filesystem node types
#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    File { content: Vec<u8> },
    Directory { children: BTreeMap<String, NodeId> },
}

/// Filesystem node
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    /// Last path component, informational only
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub mtime: SystemTime,
    /// Back-reference kept in step with the parent's children map by the tree
    /// operations. `None` for the root and for nodes not yet linked.
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn file(id: NodeId, name: &str, perm: u32, mtime: SystemTime) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: NodeKind::File {
                content: Vec::new(),
            },
            mode: libc::S_IFREG as u32 | (perm & PERM_MASK),
            mtime,
            parent: None,
        }
    }

    pub fn directory(id: NodeId, name: &str, perm: u32, mtime: SystemTime) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
            mode: libc::S_IFDIR as u32 | (perm & PERM_MASK),
            mtime,
            parent: None,
        }
    }

    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            NodeKind::File { .. } => FileKind::File,
            NodeKind::Directory { .. } => FileKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, NodeId>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn content(&self) -> Option<&Vec<u8>> {
        match &self.kind {
            NodeKind::File { content } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn content_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.kind {
            NodeKind::File { content } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Replace the permission bits, keeping the type bits.
    pub fn set_perm(&mut self, perm: u32) {
        self.mode = (self.mode & !PERM_MASK) | (perm & PERM_MASK);
    }
}

/// Node table
#[derive(Debug)]
pub(crate) struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl NodeStore {
    /// Create a table holding only the root directory.
    pub fn new(root_perm: u32, now: SystemTime) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, Node::directory(ROOT_ID, "/", root_perm, now));
        Self {
            nodes,
            next_id: ROOT_ID.0 + 1,
        }
    }

    pub fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Next identifier `allocate` will return
    pub fn peek_next_id(&self) -> u64 {
        self.next_id
    }

    pub fn get(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    /// Fetch a node the table itself references.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(&id) {
            Some(node) => node,
            None => panic!("node table corrupt: referenced node {id} is missing"),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => panic!("node table corrupt: referenced node {id} is missing"),
        }
    }

    pub fn insert(&mut self, node: Node) {
        assert!(
            node.id.0 < self.next_id,
            "node {} inserted without being allocated",
            node.id
        );
        let id = node.id;
        if self.nodes.insert(id, node).is_some() {
            panic!("node {id} inserted twice");
        }
    }

    /// Remove an unlinked node. Removing the root or a node still present in
    /// a children map is a programming error.
    pub fn remove(&mut self, id: NodeId) -> Node {
        assert!(!id.is_root(), "attempted to remove the root node");
        let node = match self.nodes.remove(&id) {
            Some(node) => node,
            None => panic!("attempted to remove missing node {id}"),
        };
        assert!(
            node.parent.is_none(),
            "node {id} removed while still linked under {:?}",
            node.parent
        );
        debug_assert!(
            !self
                .nodes
                .values()
                .filter_map(Node::children)
                .any(|children| children.values().any(|child| *child == id)),
            "node {id} removed while a children map still names it"
        );
        node
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}
