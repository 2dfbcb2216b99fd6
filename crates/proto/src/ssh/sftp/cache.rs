//! Stat cache.
//!
//! Attributes are kept in a tree keyed by path segment, so dropping a
//! directory drops everything cached beneath it in one step.

use super::types::FileAttributes;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    stat: Option<FileAttributes>,
    lstat: Option<FileAttributes>,
    children: HashMap<String, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.stat.is_none() && self.lstat.is_none() && self.children.is_empty()
    }
}

/// Which lookup a cached snapshot answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Symlinks followed
    Stat,
    /// Symlinks not followed
    Lstat,
}

/// Cached attributes for absolute, normalized paths.
#[derive(Debug, Default)]
pub struct StatCache {
    root: Node,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl StatCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, path: &str) -> Option<&Node> {
        segments(path).try_fold(&self.root, |node, seg| node.children.get(seg))
    }

    fn node_mut(&mut self, path: &str) -> &mut Node {
        segments(path).fold(&mut self.root, |node, seg| {
            node.children.entry(seg.to_string()).or_default()
        })
    }

    /// Cached snapshot, if any.
    pub fn get(&self, path: &str, kind: StatKind) -> Option<&FileAttributes> {
        let node = self.node(path)?;
        match kind {
            StatKind::Stat => node.stat.as_ref(),
            StatKind::Lstat => node.lstat.as_ref(),
        }
    }

    /// Stores a snapshot.
    pub fn put(&mut self, path: &str, kind: StatKind, attrs: FileAttributes) {
        let node = self.node_mut(path);
        match kind {
            StatKind::Stat => node.stat = Some(attrs),
            StatKind::Lstat => node.lstat = Some(attrs),
        }
    }

    /// Drops `path`, its subtree, and the snapshots of its parent
    /// directory, whose size and times change with its contents.
    pub fn invalidate(&mut self, path: &str) {
        let parts: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = parts.split_last() else {
            self.clear();
            return;
        };

        let mut node = &mut self.root;
        for seg in parents {
            match node.children.get_mut(*seg) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.stat = None;
        node.lstat = None;
        node.children.remove(*last);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.root = Node::default();
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(size: u64) -> FileAttributes {
        FileAttributes {
            size: Some(size),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_and_get() {
        let mut cache = StatCache::new();
        cache.put("/a/b", StatKind::Stat, attrs(1));
        assert_eq!(cache.get("/a/b", StatKind::Stat), Some(&attrs(1)));
        assert_eq!(cache.get("/a//b/", StatKind::Stat), Some(&attrs(1)));
        assert!(cache.get("/a/b", StatKind::Lstat).is_none());
        assert!(cache.get("/a", StatKind::Stat).is_none());
    }

    #[test]
    fn test_invalidate_drops_subtree_and_parent() {
        let mut cache = StatCache::new();
        cache.put("/a", StatKind::Stat, attrs(4096));
        cache.put("/a/b", StatKind::Stat, attrs(1));
        cache.put("/a/b/c", StatKind::Lstat, attrs(2));
        cache.put("/a/d", StatKind::Stat, attrs(3));

        cache.invalidate("/a/b");
        assert!(cache.get("/a/b", StatKind::Stat).is_none());
        assert!(cache.get("/a/b/c", StatKind::Lstat).is_none());
        assert!(cache.get("/a", StatKind::Stat).is_none());
        assert_eq!(cache.get("/a/d", StatKind::Stat), Some(&attrs(3)));
    }

    #[test]
    fn test_invalidate_unknown_path_is_noop() {
        let mut cache = StatCache::new();
        cache.put("/x", StatKind::Stat, attrs(1));
        cache.invalidate("/y/z");
        assert_eq!(cache.get("/x", StatKind::Stat), Some(&attrs(1)));
    }

    #[test]
    fn test_clear() {
        let mut cache = StatCache::new();
        cache.put("/x", StatKind::Stat, attrs(1));
        cache.invalidate("/");
        assert!(cache.is_empty());
    }
}
