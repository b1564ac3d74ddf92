//! Directory entries: the in-memory name tree used by path resolution.

use rustc_hash::FxHashMap;

use crate::sync::{Arc, Mutex, Weak};
use crate::vfs::inode::Inode;

/// A name-to-inode binding within a parent directory.
///
/// The parent edge is weak; children hold their entries strongly, so a
/// dentry lives as long as a path walk or its parent keeps it reachable.
pub struct Dentry {
    name: String,
    inode: Arc<Inode>,
    parent: Weak<Dentry>,
    children: Mutex<FxHashMap<String, Arc<Dentry>>>,
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &self.name)
            .field("ino", &self.inode.ino())
            .finish_non_exhaustive()
    }
}

impl Dentry {
    /// The root dentry of a mount: no name, no parent.
    #[must_use]
    pub fn new_root(inode: Arc<Inode>) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            inode,
            parent: Weak::new(),
            children: Mutex::new(FxHashMap::default()),
        })
    }

    /// A child entry under `parent`. The caller still has to attach it with
    /// [`Dentry::add_child`].
    #[must_use]
    pub fn new(name: &str, inode: Arc<Inode>, parent: &Arc<Dentry>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            inode,
            parent: Arc::downgrade(parent),
            children: Mutex::new(FxHashMap::default()),
        })
    }

    /// Entry name within its parent. Empty for a mount root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound inode.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The parent dentry, if this is not a root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.upgrade()
    }

    /// Look up a cached child by name.
    #[must_use]
    pub fn lookup_child(&self, name: &str) -> Option<Arc<Dentry>> {
        crate::sync::lock(&self.children).get(name).cloned()
    }

    /// Attach a child, replacing any existing entry of the same name.
    pub fn add_child(&self, child: Arc<Dentry>) {
        crate::sync::lock(&self.children).insert(child.name.clone(), child);
    }

    /// Detach a child by name.
    pub fn remove_child(&self, name: &str) {
        crate::sync::lock(&self.children).remove(name);
    }

    /// All currently cached children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Dentry>> {
        crate::sync::lock(&self.children).values().cloned().collect()
    }

    /// Full path from the mount root: the parent's path joined with this
    /// name by `/`.
    #[must_use]
    pub fn path(&self) -> String {
        match self.parent.upgrade() {
            None => "/".to_owned(),
            Some(parent) => {
                let prefix = parent.path();
                if prefix == "/" {
                    format!("/{}", self.name)
                } else {
                    format!("{prefix}/{}", self.name)
                }
            }
        }
    }
}
