//! Open-document registry
//!
//! The `Registry` is the entry point. It resolves document names against a
//! base directory, keeps at most one live [`Storage`] (and in-memory tree)
//! per canonical path, and tracks every open [`Document`] so that flush,
//! close, and destroy can be broadcast to all of them.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = Registry::new(".", Config::new().with_create(true))?;
//! let doc = registry.open("test", &Config::new())?;
//! doc.get("table1")?.set("one", 3)?;
//! registry.close(Some(&doc), &Config::new())?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::document::{Document, DocumentInner, SharedDocument};
use crate::storage::error::{Error, Result};
use crate::storage::{persistence, Storage};

#[derive(Default)]
struct RegistryState {
    /// Canonical path -> the one live tree for that path
    shared: HashMap<PathBuf, Weak<SharedDocument>>,
    /// Open documents by id
    documents: BTreeMap<u64, Weak<DocumentInner>>,
    next_id: u64,
}

pub(crate) struct RegistryInner {
    base_dir: PathBuf,
    defaults: Config,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    pub(crate) fn unregister(&self, id: u64) {
        self.state.lock().documents.remove(&id);
    }

    /// Drop the table entry for `path` once its storage has closed
    fn forget_storage(&self, path: &Path) {
        let mut state = self.state.lock();
        let closed = state.shared.get(path).map_or(false, |weak| {
            weak.upgrade()
                .map_or(true, |shared| shared.storage.is_closed())
        });
        if closed {
            state.shared.remove(path);
            debug!(target: "nodb::registry", ?path, "Forgot closed storage");
        }
    }

    fn open_documents(&self) -> Vec<Arc<DocumentInner>> {
        let mut state = self.state.lock();
        state.documents.retain(|_, doc| doc.strong_count() > 0);
        state.documents.values().filter_map(Weak::upgrade).collect()
    }

    /// Canonical form of `name` under the base directory, `.json` appended
    fn resolve(&self, name: &Path) -> Result<PathBuf> {
        let joined = persistence::with_extension(self.base_dir.join(name));
        if joined.exists() {
            return joined
                .canonicalize()
                .map_err(|e| Error::from_io(e, joined.clone()));
        }

        // Not created yet: canonicalize the directory it will live in
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(file_name)) => parent
                .canonicalize()
                .map(|dir| dir.join(file_name))
                .map_err(|e| Error::from_io(e, parent.to_path_buf())),
            _ => Ok(joined),
        }
    }
}

/// Table of open documents rooted at a base directory
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry for documents under `base_dir`
    ///
    /// A relative `base_dir` is taken relative to the working directory.
    /// `defaults` underlies every configuration passed to later calls.
    pub fn new(base_dir: impl AsRef<Path>, defaults: Config) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        let base_dir = base_dir
            .canonicalize()
            .map_err(|e| Error::from_io(e, base_dir.to_path_buf()))?;
        debug!(target: "nodb::registry", ?base_dir, ?defaults, "Created registry");

        Ok(Self {
            inner: Arc::new(RegistryInner {
                base_dir,
                defaults,
                state: Mutex::new(RegistryState::default()),
            }),
        })
    }

    /// Create a registry rooted at the working directory
    pub fn in_current_dir(defaults: Config) -> Result<Self> {
        Self::new(".", defaults)
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn defaults(&self) -> &Config {
        &self.inner.defaults
    }

    /// Number of open documents
    ///
    /// Handles whose tree was destroyed through a sibling handle no longer
    /// count, even before they are closed.
    pub fn open_documents(&self) -> usize {
        self.inner
            .open_documents()
            .iter()
            .filter(|doc| doc.is_open())
            .count()
    }

    /// Canonical path `name` resolves to
    pub fn resolve(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        self.inner.resolve(name.as_ref())
    }

    /// Open the document `name`
    ///
    /// Handles opened on the same canonical path share one storage and one
    /// in-memory tree. The file is read only when no handle on it is open.
    pub fn open(&self, name: impl AsRef<Path>, overrides: &Config) -> Result<Document> {
        let path = self.inner.resolve(name.as_ref())?;
        let config = self.inner.defaults.merge(overrides);

        // Hold the lock for the whole open so concurrent opens of one path
        // cannot each load their own tree
        let mut state = self.inner.state.lock();
        state.shared.retain(|_, shared| shared.strong_count() > 0);

        let existing = state
            .shared
            .get(&path)
            .and_then(Weak::upgrade)
            .filter(|shared| !shared.storage.is_closed());
        let shared = match existing {
            Some(shared) => {
                debug!(target: "nodb::registry", ?path, "Sharing already open document");
                shared
            }
            None => {
                let registry = Arc::downgrade(&self.inner);
                let storage = Storage::with_close_hook(&path, move |closed| {
                    if let Some(registry) = registry.upgrade() {
                        registry.forget_storage(closed);
                    }
                });
                let shared = Arc::new(SharedDocument::load(storage, &config)?);
                state.shared.insert(path.clone(), Arc::downgrade(&shared));
                shared
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        let inner = Arc::new(DocumentInner::new(
            id,
            shared,
            config,
            Arc::downgrade(&self.inner),
        ));
        state.documents.insert(id, Arc::downgrade(&inner));
        info!(target: "nodb::registry", ?path, id, "Opened document");

        Ok(Document::from_inner(inner))
    }

    /// Open `name`, run `f`, and close the document on every exit path
    ///
    /// An error from `f` takes precedence over an error from closing.
    pub fn with_document<R>(
        &self,
        name: impl AsRef<Path>,
        overrides: &Config,
        f: impl FnOnce(&Document) -> Result<R>,
    ) -> Result<R> {
        let doc = self.open(name, overrides)?;
        let result = f(&doc);
        let closed = doc.close(overrides);
        if let Err(close_err) = &closed {
            warn!(target: "nodb::registry", path = ?doc.path(), error = %close_err, "Failed to close scoped document");
            // The close error is reported instead of the discard one
            if let Err(discard_err) = doc.discard() {
                warn!(target: "nodb::registry", path = ?doc.path(), error = %discard_err, "Discarded scoped document");
            }
        }
        let value = result?;
        closed.map(|()| value)
    }

    /// Flush `document`, or every open document if `None`
    pub fn flush(&self, document: Option<&Document>, overrides: &Config) -> Result<()> {
        match document {
            Some(doc) => doc.flush(overrides),
            None => self.broadcast("flush", |doc| doc.flush(overrides)),
        }
    }

    /// Close `document`, or every open document if `None`
    pub fn close(&self, document: Option<&Document>, overrides: &Config) -> Result<()> {
        match document {
            Some(doc) => doc.close(overrides),
            None => self.broadcast("close", |doc| doc.close(overrides)),
        }
    }

    /// Destroy `document`, or every open document if `None`
    pub fn destroy(&self, document: Option<&Document>, overrides: &Config) -> Result<()> {
        match document {
            Some(doc) => doc.destroy(overrides),
            None => {
                let docs = self.inner.open_documents();
                let mut first_error = None;
                for (i, doc) in docs.iter().enumerate() {
                    // Handles sharing a tree go away with the first one destroyed
                    let shared_earlier = docs[..i].iter().any(|prev| prev.shares_tree_with(doc));
                    let result = if shared_earlier {
                        doc.close(overrides)
                    } else {
                        doc.destroy(overrides)
                    };
                    record(&mut first_error, "destroy", doc, result);
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Destroy the document `name`, opening it first
    pub fn destroy_path(&self, name: impl AsRef<Path>, overrides: &Config) -> Result<()> {
        let doc = self.open(name, overrides)?;
        doc.destroy(overrides)
    }

    /// Apply `op` to every open document, returning the first failure
    fn broadcast(&self, what: &str, op: impl Fn(&DocumentInner) -> Result<()>) -> Result<()> {
        let mut first_error = None;
        for doc in self.inner.open_documents() {
            let result = op(&*doc);
            record(&mut first_error, what, &doc, result);
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn record(first_error: &mut Option<Error>, what: &str, doc: &DocumentInner, result: Result<()>) {
    if let Err(e) = result {
        warn!(target: "nodb::registry", path = ?doc.path(), error = %e, "Failed to {what} document");
        first_error.get_or_insert(e);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("base_dir", &self.inner.base_dir)
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}
