//! NoDB Core Library
//!
//! This crate is not a database. It is a JSON object store with live views:
//! each document is a single JSON file holding one object, loaded whole into
//! memory and rewritten whole, atomically, on every flush.
//!
//! # Architecture
//!
//! - **Registry**: resolves names to canonical paths and deduplicates open
//!   documents, so every handle on one file shares one in-memory tree
//! - **Document**: root handle, owns the dirty state and flush policy
//! - **Node**: lazily created view onto a subtree; mutations made through it
//!   mark the document dirty, and views of replaced subtrees go stale
//! - **Storage**: atomic temp-file-and-rename writes under an advisory lock
//!
//! # Quick Start
//!
//! ```text
//! let registry = Registry::new(".", Config::new().with_create(true))?;
//! let doc = registry.open("test", &Config::new())?;
//!
//! let table = doc.get("table1")?;
//! table.set("one", 3)?;
//! table.get_or_insert("two", json!({}))?.set("three", 4)?;
//!
//! registry.close(Some(&doc), &Config::new())?;
//! ```
//!
//! # Modules
//!
//! - `registry`: Entry point, open-document table
//! - `document`: Root handle and persistence lifecycle
//! - `node`: Subtree views
//! - `storage`: File persistence and errors
//! - `lock`: Reentrant advisory file lock
//! - `codec`: JSON encoding of whole documents
//! - `config`: Option flags

pub mod codec;
pub mod config;
pub mod document;
pub mod lock;
pub mod node;
pub mod registry;
pub mod storage;

pub use codec::Object;
pub use config::Config;
pub use document::Document;
pub use lock::ExclusiveFileLock;
pub use node::Node;
pub use registry::Registry;
pub use storage::{Error, Result, Storage};
