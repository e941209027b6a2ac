//! Inode number mapping to virtual paths.

use std::collections::HashMap;

use mirrorfs_common::VirtualPath;

/// Inode of the mount root.
pub const ROOT_INODE: u64 = 1;

/// Bidirectional path/inode table.
///
/// Inodes are handed out on first sight of a path and stay stable until the
/// path is removed.
pub struct InodeMap {
    path_to_inode: HashMap<VirtualPath, u64>,
    inode_to_path: HashMap<u64, VirtualPath>,
    next_inode: u64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut map = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        map.path_to_inode.insert(VirtualPath::root(), ROOT_INODE);
        map.inode_to_path.insert(ROOT_INODE, VirtualPath::root());
        map
    }

    pub fn get_or_create_inode(&mut self, path: &VirtualPath) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.clone(), ino);
        self.inode_to_path.insert(ino, path.clone());
        ino
    }

    pub fn get_path(&self, inode: u64) -> Option<&VirtualPath> {
        self.inode_to_path.get(&inode)
    }

    /// Drop a path and everything underneath it.
    pub fn remove(&mut self, path: &VirtualPath) {
        if path.is_root() {
            return;
        }
        let gone: Vec<VirtualPath> = self
            .path_to_inode
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&ino);
            }
        }
    }

    /// Move a path and its descendants, keeping their inode numbers.
    pub fn rename(&mut self, from: &VirtualPath, to: &VirtualPath) {
        if from == to {
            return;
        }
        self.remove(to);
        let moved: Vec<(VirtualPath, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            self.path_to_inode.remove(&old);
            if let Some(new) = old.rebase(from, to) {
                self.path_to_inode.insert(new.clone(), ino);
                self.inode_to_path.insert(ino, new);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}
