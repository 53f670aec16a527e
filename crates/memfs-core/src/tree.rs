// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory tree operations layered over the node table's children maps

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{FsError, FsResult};
use crate::store::{Node, NodeStore};
use crate::{NodeId, ROOT_ID};

impl NodeStore {
    /// Children map of `id`, or `NotFound` / `NotADirectory`.
    pub fn directory(&self, id: NodeId) -> FsResult<&BTreeMap<String, NodeId>> {
        self.get(id)?.children().ok_or(FsError::NotADirectory)
    }

    pub fn resolve(&self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        self.directory(parent)?.get(name).copied().ok_or(FsError::NotFound)
    }

    pub fn link(&mut self, parent: NodeId, name: &str, child: NodeId) -> FsResult<()> {
        let children = self.get_mut(parent)?.children_mut().ok_or(FsError::NotADirectory)?;
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        children.insert(name.to_string(), child);

        let node = self.node_mut(child);
        assert!(node.parent.is_none(), "node {child} linked under two parents");
        node.parent = Some(parent);
        Ok(())
    }

    /// Insert a freshly allocated node and link it under its own name in one
    /// step. Nothing is inserted when the parent check or the name check fails.
    pub fn attach(&mut self, parent: NodeId, node: Node) -> FsResult<NodeId> {
        if self.directory(parent)?.contains_key(&node.name) {
            return Err(FsError::AlreadyExists);
        }
        let id = node.id;
        let name = node.name.clone();
        self.insert(node);
        self.link(parent, &name, id)?;
        Ok(id)
    }

    /// Drop the `name` entry of `parent`. The node itself stays in the table.
    pub fn unlink(&mut self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let children = self.get_mut(parent)?.children_mut().ok_or(FsError::NotADirectory)?;
        let child = children.remove(name).ok_or(FsError::NotFound)?;
        self.node_mut(child).parent = None;
        Ok(child)
    }

    /// Move an entry between (possibly identical) directories. Every check
    /// runs before the first map is touched, so the move either happens
    /// completely or not at all.
    pub fn move_entry(
        &mut self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<NodeId> {
        let child = self.resolve(old_parent, old_name)?;
        let target = self.directory(new_parent)?;
        if target.contains_key(new_name) {
            return Err(FsError::AlreadyExists);
        }
        if self.node(child).is_dir() && self.is_ancestor_or_self(child, new_parent) {
            return Err(FsError::InvalidArgument);
        }

        if let Some(children) = self.node_mut(old_parent).children_mut() {
            children.remove(old_name);
        }
        if let Some(children) = self.node_mut(new_parent).children_mut() {
            children.insert(new_name.to_string(), child);
        }
        let node = self.node_mut(child);
        node.parent = Some(new_parent);
        node.name = new_name.to_string();
        Ok(child)
    }

    /// Whether `ancestor` lies on the parent chain of `node` (or is `node`).
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.node(id).parent;
        }
        false
    }

    /// Walk the whole table and describe every structural invariant that does
    /// not hold. An empty list means the table is consistent.
    pub fn audit(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.get(ROOT_ID) {
            Ok(root) => {
                if !root.is_dir() {
                    problems.push("root is not a directory".to_string());
                }
                if root.parent.is_some() {
                    problems.push("root has a parent".to_string());
                }
            }
            Err(_) => {
                problems.push("root is missing".to_string());
                return problems;
            }
        }

        let mut references: HashMap<NodeId, usize> = HashMap::new();
        for node in self.iter() {
            if node.id.0 >= self.peek_next_id() {
                problems.push(format!("node {} was never allocated", node.id));
            }
            let Some(children) = node.children() else {
                continue;
            };
            for (name, child) in children {
                *references.entry(*child).or_default() += 1;
                let Ok(target) = self.get(*child) else {
                    problems.push(format!("{}/{name} points at missing node {child}", node.id));
                    continue;
                };
                if target.parent != Some(node.id) {
                    problems.push(format!(
                        "node {child} is listed under {} but records parent {:?}",
                        node.id, target.parent
                    ));
                }
                if &target.name != name {
                    problems.push(format!(
                        "node {child} is listed as {name:?} but named {:?}",
                        target.name
                    ));
                }
            }
        }

        for node in self.iter().filter(|n| !n.id.is_root()) {
            match references.get(&node.id).copied().unwrap_or(0) {
                1 => {}
                0 => problems.push(format!("node {} is unreachable", node.id)),
                n => problems.push(format!("node {} has {n} parents", node.id)),
            }
        }

        let mut seen = HashSet::new();
        let mut stack = vec![ROOT_ID];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                problems.push(format!("cycle through node {id}"));
                continue;
            }
            if let Ok(children) = self.directory(id) {
                stack.extend(children.values().copied().filter(|c| self.contains(*c)));
            }
        }
        if seen.len() != self.len() {
            problems.push(format!(
                "{} of {} nodes reachable from root",
                seen.len(),
                self.len()
            ));
        }

        problems
    }
}
