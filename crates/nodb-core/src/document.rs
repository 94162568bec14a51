//! Documents
//!
//! A [`Document`] is the root handle onto one backing file. The in-memory
//! tree it exposes lives in a [`SharedDocument`], of which there is exactly
//! one per canonical path while any handle on that path is open: every
//! `Document` opened on the same path is a view of the same tree, the same
//! dirty flag, and the same [`Storage`].
//!
//! Top-level keys are fixed bindings. They are reached with
//! [`Document::get`] (which creates a missing key as an empty mapping), and
//! everything beneath them is read and written through [`Node`] views.
//!
//! ## Auto-commit
//!
//! Unless the `manual` option is set, every mutation flushes the whole
//! document before the mutating call returns.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::codec::Object;
use crate::config::Config;
use crate::node::{Node, ViewIndex};
use crate::registry::RegistryInner;
use crate::storage::error::{Error, Result};
use crate::storage::Storage;

pub(crate) struct Tree {
    pub(crate) root: Object,
    pub(crate) dirty: bool,
}

/// The single in-memory tree for one canonical path
pub(crate) struct SharedDocument {
    pub(crate) storage: Storage,
    tree: Mutex<Tree>,
    /// Live `Node` views over this tree, from every handle
    views: ViewIndex,
    /// Open `Document`s over this tree
    handles: AtomicUsize,
}

impl SharedDocument {
    /// Read the backing file into a fresh tree
    pub(crate) fn load(storage: Storage, config: &Config) -> Result<Self> {
        let root = storage.read(config)?;
        Ok(Self {
            storage,
            tree: Mutex::new(Tree { root, dirty: false }),
            views: ViewIndex::default(),
            handles: AtomicUsize::new(0),
        })
    }
}

pub(crate) struct DocumentInner {
    id: u64,
    shared: Arc<SharedDocument>,
    config: Config,
    open: AtomicBool,
    registry: Weak<RegistryInner>,
}

impl DocumentInner {
    pub(crate) fn new(
        id: u64,
        shared: Arc<SharedDocument>,
        config: Config,
        registry: Weak<RegistryInner>,
    ) -> Self {
        shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            id,
            shared,
            config,
            open: AtomicBool::new(true),
            registry,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        self.shared.storage.path()
    }

    pub(crate) fn views(&self) -> &ViewIndex {
        &self.shared.views
    }

    pub(crate) fn shares_tree_with(&self, other: &DocumentInner) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.shared.storage.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::UseAfterClose {
                path: self.path().to_path_buf(),
            });
        }
        Ok(())
    }

    /// Run `f` against the live tree
    pub(crate) fn with_tree<R>(&self, f: impl FnOnce(&mut Tree) -> R) -> Result<R> {
        self.ensure_open()?;
        let mut tree = self.shared.tree.lock();
        Ok(f(&mut *tree))
    }

    /// Record a mutation at `path`, flushing right away unless `manual`
    pub(crate) fn mark_dirty(&self, path: &str) -> Result<()> {
        self.with_tree(|tree| tree.dirty = true)?;
        debug!(target: "nodb::document", file = ?self.path(), path, "Marked dirty");
        if !self.config.manual() {
            self.flush(&Config::new())?;
        }
        Ok(())
    }

    pub(crate) fn flush(&self, overrides: &Config) -> Result<()> {
        self.ensure_open()?;
        let config = self.config.merge(overrides);
        let mut tree = self.shared.tree.lock();
        if tree.dirty || config.force() {
            self.shared.storage.write(&tree.root, &config)?;
            tree.dirty = false;
        }
        Ok(())
    }

    pub(crate) fn close(&self, overrides: &Config) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        // A sibling handle destroyed the file; there is nothing left to flush to
        if !self.shared.storage.is_closed() {
            self.flush(overrides)?;
        }
        self.detach();
        info!(target: "nodb::document", path = ?self.path(), "Closed document");
        Ok(())
    }

    pub(crate) fn destroy(&self, overrides: &Config) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::UseAfterClose {
                path: self.path().to_path_buf(),
            });
        }
        if self.shared.storage.is_closed() {
            self.detach();
            return Ok(());
        }

        let config = self.config.merge(overrides);
        if !config.is_unsafe() {
            self.flush(overrides)?;
        }
        let result = self.shared.storage.destroy(&config);
        self.detach();
        result
    }

    /// Close without flushing
    ///
    /// Fails with `UnsavedDataDiscarded` when this was the last open handle
    /// on a dirty tree, since its changes can no longer reach the file.
    pub(crate) fn discard(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let unsaved = !self.shared.storage.is_closed()
            && self.shared.handles.load(Ordering::Acquire) == 1
            && self.shared.tree.lock().dirty;
        self.detach();

        if unsaved {
            return Err(Error::UnsavedDataDiscarded {
                path: self.path().to_path_buf(),
            });
        }
        Ok(())
    }

    /// Mark closed, close the storage if this was its last handle, and
    /// leave the registry
    fn detach(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.storage.close(&self.config);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

/// Handle onto an open document
///
/// Obtained from [`Registry::open`](crate::Registry::open). Dropping a handle
/// whose changes were never flushed is a programming error: it is logged,
/// and in debug builds it panics.
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    pub(crate) fn from_inner(inner: Arc<DocumentInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<DocumentInner> {
        &self.inner
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Effective configuration of this handle
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether the tree has changes not yet written to the file
    pub fn is_dirty(&self) -> bool {
        self.inner.shared.tree.lock().dirty
    }

    /// View of the top-level binding `key`, created as `{}` if missing
    pub fn get(&self, key: &str) -> Result<Node> {
        let created = self.inner.with_tree(|tree| {
            if tree.root.contains_key(key) {
                false
            } else {
                tree.root.insert(key.to_string(), Value::Object(Object::new()));
                true
            }
        })?;
        if created {
            self.inner.mark_dirty(key)?;
        }
        Ok(Node::top_level(&self.inner, key))
    }

    /// Top-level bindings cannot be assigned; always fails with `ImmutableRoot`
    pub fn set(&self, key: &str, _value: impl Into<Value>) -> Result<()> {
        Err(Error::ImmutableRoot {
            key: key.to_string(),
        })
    }

    /// Top-level bindings cannot be removed; always fails with `ImmutableRoot`
    pub fn delete(&self, key: &str) -> Result<()> {
        Err(Error::ImmutableRoot {
            key: key.to_string(),
        })
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.inner.with_tree(|tree| tree.root.contains_key(key))
    }

    /// Top-level keys, in the tree's order
    pub fn keys(&self) -> Result<Vec<String>> {
        self.inner.with_tree(|tree| tree.root.keys().cloned().collect())
    }

    /// Snapshot of the whole tree
    pub fn value(&self) -> Result<Object> {
        self.inner.with_tree(|tree| tree.root.clone())
    }

    /// Write the tree if dirty, or unconditionally with `force`
    pub fn flush(&self, overrides: &Config) -> Result<()> {
        self.inner.flush(overrides)
    }

    /// Flush, then release this handle. Idempotent.
    pub fn close(&self, overrides: &Config) -> Result<()> {
        self.inner.close(overrides)
    }

    /// Flush (unless `unsafe`), then delete the backing file
    ///
    /// Deletion only happens for an empty document, or with `force`;
    /// otherwise this fails with `NotEmpty`. The handle is closed either way.
    pub fn destroy(&self, overrides: &Config) -> Result<()> {
        self.inner.destroy(overrides)
    }

    /// Release this handle without flushing
    pub fn discard(&self) -> Result<()> {
        self.inner.discard()
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if let Err(e) = self.inner.discard() {
            error!(target: "nodb::document", path = ?self.inner.path(), "{e}");
            if cfg!(debug_assertions) && !std::thread::panicking() {
                panic!("{e}");
            }
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("path", &self.path())
            .field("open", &self.is_open())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn setup(defaults: Config) -> (TempDir, Registry) {
        let temp_dir = TempDir::new().unwrap();
        let registry = Registry::new(temp_dir.path(), defaults.with_create(true)).unwrap();
        (temp_dir, registry)
    }

    fn on_disk(doc: &Document) -> serde_json::Value {
        serde_json::from_slice(&fs::read(doc.path()).unwrap()).unwrap()
    }

    #[test]
    fn test_open_reads_file() {
        let (temp_dir, registry) = setup(Config::new());
        fs::write(temp_dir.path().join("test.json"), r#"{"a": {"b": 1}}"#).unwrap();

        let doc = registry.open("test", &Config::new()).unwrap();
        assert_eq!(doc.keys().unwrap(), vec!["a".to_string()]);
        assert!(!doc.is_dirty());
        assert_eq!(doc.get("a").unwrap().get("b").unwrap(), json!(1));
    }

    #[test]
    fn test_get_vivifies_top_level_key() {
        let (_temp_dir, registry) = setup(Config::new());
        let doc = registry.open("test", &Config::new()).unwrap();

        assert!(!doc.contains_key("main").unwrap());
        let main = doc.get("main").unwrap();
        assert_eq!(main, json!({}));
        assert!(doc.contains_key("main").unwrap());

        // Auto-commit already wrote the new binding
        assert!(!doc.is_dirty());
        assert_eq!(on_disk(&doc), json!({"main": {}}));
    }

    #[test]
    fn test_root_bindings_are_immutable() {
        let (_temp_dir, registry) = setup(Config::new());
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("main").unwrap();

        assert!(matches!(doc.set("main", 1), Err(Error::ImmutableRoot { .. })));
        assert!(matches!(doc.delete("main"), Err(Error::ImmutableRoot { .. })));
        assert_eq!(doc.get("main").unwrap(), json!({}));
    }

    #[test]
    fn test_manual_mode_defers_writes() {
        let (_temp_dir, registry) = setup(Config::new());
        let doc = registry.open("test", &Config::new().with_manual(true)).unwrap();

        doc.get("t").unwrap().set("x", 1).unwrap();
        assert!(doc.is_dirty());
        assert_eq!(on_disk(&doc), json!({}));

        doc.flush(&Config::new()).unwrap();
        assert!(!doc.is_dirty());
        assert_eq!(on_disk(&doc), json!({"t": {"x": 1}}));
    }

    #[test]
    fn test_forced_flush_rewrites_clean_document() {
        let (temp_dir, registry) = setup(Config::new());
        let path = temp_dir.path().join("test.json");
        fs::write(&path, r#"{ "a" : 1 }"#).unwrap();

        let doc = registry.open("test", &Config::new()).unwrap();
        doc.flush(&Config::new()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{ "a" : 1 }"#);

        doc.flush(&Config::new().with_force(true)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_close_flushes_and_releases() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let doc = registry.open("test", &Config::new()).unwrap();
        let node = doc.get("t").unwrap();
        node.set("x", "y").unwrap();

        doc.close(&Config::new()).unwrap();
        doc.close(&Config::new()).unwrap();
        assert!(!doc.is_open());
        assert_eq!(on_disk(&doc), json!({"t": {"x": "y"}}));

        assert!(matches!(doc.get("t"), Err(Error::UseAfterClose { .. })));
        assert!(matches!(node.value(), Err(Error::UseAfterClose { .. })));
        assert!(matches!(doc.flush(&Config::new()), Err(Error::UseAfterClose { .. })));
    }

    #[test]
    fn test_discard_dirty_document_fails() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("t").unwrap().set("x", 1).unwrap();

        let err = doc.discard().unwrap_err();
        assert!(matches!(err, Error::UnsavedDataDiscarded { .. }));
        assert!(!doc.is_open());
        assert_eq!(on_disk(&doc), json!({}));
    }

    #[test]
    fn test_discard_clean_document() {
        let (_temp_dir, registry) = setup(Config::new());
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("t").unwrap().set("x", 1).unwrap();

        doc.discard().unwrap();
        assert!(!doc.is_open());
    }

    #[test]
    #[should_panic(expected = "Unsaved changes")]
    fn test_dropping_dirty_document_panics() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("t").unwrap().set("x", 1).unwrap();
        drop(doc);
    }

    #[test]
    fn test_dirty_shared_tree_survives_one_discard() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let first = registry.open("test", &Config::new()).unwrap();
        let second = registry.open("test", &Config::new()).unwrap();
        first.get("t").unwrap().set("x", 1).unwrap();

        // The other handle can still persist the change
        first.discard().unwrap();
        assert!(second.is_dirty());
        second.close(&Config::new()).unwrap();
        assert_eq!(on_disk(&second), json!({"t": {"x": 1}}));
    }

    #[test]
    fn test_destroy_empty_document() {
        let (_temp_dir, registry) = setup(Config::new());
        let doc = registry.open("test", &Config::new()).unwrap();
        let path = doc.path().to_path_buf();

        doc.destroy(&Config::new()).unwrap();
        assert!(!path.exists());
        assert!(!doc.is_open());
    }

    #[test]
    fn test_destroy_flushes_first() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("t").unwrap();

        // The pending vivification reaches disk, so the document is not empty
        let err = doc.destroy(&Config::new()).unwrap_err();
        assert!(matches!(err, Error::NotEmpty { .. }));
        assert_eq!(on_disk(&doc), json!({"t": {}}));
        assert!(!doc.is_open());
    }

    #[test]
    fn test_unsafe_destroy_skips_flush() {
        let (_temp_dir, registry) = setup(Config::new().with_manual(true));
        let doc = registry.open("test", &Config::new()).unwrap();
        doc.get("t").unwrap();
        let path = doc.path().to_path_buf();

        doc.destroy(&Config::new().with_unsafe(true)).unwrap();
        assert!(!path.exists());
    }
}
