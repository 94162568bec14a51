//! Document file persistence
//!
//! A [`Storage`] owns one canonical file path and moves whole documents
//! between that file and memory. Writes are atomic (write to temp file,
//! then rename) and serialized through an exclusive lock on a sibling
//! lock file.
//!
//! Files, for a document named `test`:
//! - `test.json` - The document
//! - `test.json.tmp` - Transient, exists only during a write
//! - `test.json.lock` - Lock file, never renamed so every writer contends
//!   on the same inode

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::codec::{self, Object};
use crate::config::Config;
use crate::lock::ExclusiveFileLock;
use crate::storage::error::{Error, Result};

/// Extension every document file carries
pub const EXTENSION: &str = "json";

const TEMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";

type CloseHook = Box<dyn FnOnce(&Path) + Send>;

/// Persistence unit for one document file
///
/// `Open -> Closed` is one-way: once closed, reads and writes fail with
/// `UseAfterClose`.
pub struct Storage {
    path: PathBuf,
    closed: AtomicBool,
    lock: ExclusiveFileLock,
    on_close: Mutex<Option<CloseHook>>,
}

impl Storage {
    /// Create a storage for `path`, appending the `.json` extension if missing
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = with_extension(path.into());
        let lock = ExclusiveFileLock::new(sibling(&path, LOCK_SUFFIX));
        Self {
            path,
            closed: AtomicBool::new(false),
            lock,
            on_close: Mutex::new(None),
        }
    }

    /// Create a storage that runs `hook` with its path when it closes
    pub(crate) fn with_close_hook(
        path: impl Into<PathBuf>,
        hook: impl FnOnce(&Path) + Send + 'static,
    ) -> Self {
        let storage = Self::new(path);
        *storage.on_close.lock() = Some(Box::new(hook));
        storage
    }

    /// Path of the document file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check if the document file exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the whole document
    ///
    /// With `create`, a missing file is first created holding `{}`. Creation
    /// is best-effort: another process may create the file between our
    /// existence check and our exclusive create. The loser's create fails
    /// with `AlreadyExists`, which is ignored, and the read below then sees
    /// whichever content won.
    pub fn read(&self, config: &Config) -> Result<Object> {
        self.ensure_open()?;

        if config.create() && !self.exists() {
            match create_empty(&self.path, !config.is_unsafe()) {
                Ok(()) => {
                    info!(target: "nodb::storage", path = ?self.path, "Created empty document");
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(target: "nodb::storage", path = ?self.path, "Lost create race, reading existing document");
                }
                Err(e) => return Err(Error::from_io(e, self.path.clone())),
            }
        }

        let bytes = fs::read(&self.path).map_err(|e| Error::from_io(e, self.path.clone()))?;
        let object = codec::decode(&bytes, &self.path)?;
        debug!(target: "nodb::storage", path = ?self.path, keys = object.len(), "Read document");
        Ok(object)
    }

    /// Replace the document on disk with `object`
    ///
    /// The write holds the exclusive lock for its whole duration and lands
    /// through a rename, so a concurrent reader sees either the old or the
    /// new document, never a partial one. Unless `unsafe` is set, the temp
    /// file is synced before the rename.
    pub fn write(&self, object: &Object, config: &Config) -> Result<()> {
        self.ensure_open()?;

        let _guard = self.lock.acquire()?;
        // Closed (or destroyed) while we waited for the lock
        self.ensure_open()?;
        atomic_write(&self.path, &codec::encode(object), !config.is_unsafe())?;
        debug!(target: "nodb::storage", path = ?self.path, keys = object.len(), "Wrote document");
        Ok(())
    }

    /// Mark closed and run the close hook. Idempotent.
    pub fn close(&self, _config: &Config) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(target: "nodb::storage", path = ?self.path, "Closed storage");
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook(&self.path);
        }
    }

    /// Close, then delete the file if the document is empty or `force` is set
    ///
    /// A non-empty document without `force` fails with `NotEmpty` and the
    /// file is left untouched.
    pub fn destroy(&self, config: &Config) -> Result<()> {
        let content = self.read(&Config::new())?;
        self.close(config);

        if !content.is_empty() && !config.force() {
            return Err(Error::NotEmpty {
                path: self.path.clone(),
            });
        }

        let _guard = self.lock.acquire()?;
        fs::remove_file(&self.path).map_err(|e| Error::from_io(e, self.path.clone()))?;
        remove_if_exists(self.lock.path())?;
        info!(target: "nodb::storage", path = ?self.path, forced = !content.is_empty(), "Destroyed document");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::UseAfterClose {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Append the document extension unless the path already ends with it
pub fn with_extension(path: PathBuf) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == EXTENSION) {
        path
    } else {
        sibling(&path, &format!(".{EXTENSION}"))
    }
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Create `path` holding an empty document, failing if it already exists
fn create_empty(path: &Path, sync: bool) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(&codec::encode(&Object::new()))?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::from_io(e, path.to_path_buf())),
        _ => Ok(()),
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk (unless `sync` is false)
/// 3. Rename the temp file to the target path
///
/// This ensures the target file is never left in a partially-written state.
fn atomic_write(path: &Path, data: &[u8], sync: bool) -> Result<()> {
    let temp_path = sibling(path, TEMP_SUFFIX);

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(data)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::from_io(e, temp_path));
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        Error::AtomicWriteFailed {
            from: temp_path.clone(),
            to: path.to_path_buf(),
            source,
        }
    })
}
