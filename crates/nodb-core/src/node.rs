//! Views onto subtrees
//!
//! A [`Node`] never holds a copy of its value. It holds the key path from
//! the document root and a non-owning reference to the document, and every
//! access resolves that path against the live tree. Two views of the same
//! path therefore always observe the same value, and compare equal, while
//! remaining distinct objects.
//!
//! Each node keeps a cache of the child views it handed out, and every view
//! over a tree is recorded in that tree's [`ViewIndex`]. Replacing or
//! removing anything beneath a path invalidates every live view below it,
//! whichever view (or document handle) made the change, and an invalidated
//! view rejects all further use with `StaleView`.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{self, Object};
use crate::document::DocumentInner;
use crate::storage::error::{Error, Result};

struct Link {
    valid: bool,
    /// Keeps ancestors, and with them the caches that reach this node, alive
    parent: Option<Arc<NodeInner>>,
    children: HashMap<String, Weak<NodeInner>>,
}

struct NodeInner {
    document: Weak<DocumentInner>,
    file: PathBuf,
    path: Vec<String>,
    link: Mutex<Link>,
}

impl NodeInner {
    fn invalidate(&self) {
        let (parent, children) = {
            let mut link = self.link.lock();
            link.valid = false;
            (link.parent.take(), std::mem::take(&mut link.children))
        };
        drop(parent);
        for child in children.values().filter_map(Weak::upgrade) {
            child.invalidate();
        }
    }
}

/// Every live view over one tree, keyed by path
#[derive(Default)]
pub(crate) struct ViewIndex {
    views: Mutex<HashMap<Vec<String>, Vec<Weak<NodeInner>>>>,
}

impl ViewIndex {
    fn register(&self, node: &Arc<NodeInner>) {
        let mut views = self.views.lock();
        let entry = views.entry(node.path.clone()).or_default();
        entry.retain(|view| view.strong_count() > 0);
        entry.push(Arc::downgrade(node));
    }

    /// Invalidate every view below `prefix`, and with `inclusive` the views
    /// at `prefix` too
    fn invalidate(&self, prefix: &[String], inclusive: bool) {
        let stale = {
            let mut views = self.views.lock();
            let mut stale = Vec::new();
            views.retain(|path, entry| {
                entry.retain(|view| view.strong_count() > 0);
                if path.starts_with(prefix) && (inclusive || path.len() > prefix.len()) {
                    stale.extend(entry.drain(..).filter_map(|view| view.upgrade()));
                }
                !entry.is_empty()
            });
            stale
        };
        for view in stale {
            view.invalidate();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.views.lock().values().map(Vec::len).sum()
    }
}

/// View onto one subtree of a document
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub(crate) fn top_level(document: &Arc<DocumentInner>, key: &str) -> Self {
        let inner = Arc::new(NodeInner {
            document: Arc::downgrade(document),
            file: document.path().to_path_buf(),
            path: vec![key.to_string()],
            link: Mutex::new(Link {
                valid: true,
                parent: None,
                children: HashMap::new(),
            }),
        });
        document.views().register(&inner);
        Self { inner }
    }

    /// Key of this node within its parent
    pub fn key(&self) -> &str {
        self.inner.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Dotted path from the document root
    pub fn path(&self) -> String {
        self.inner.path.join(".")
    }

    /// View this node was reached through; `None` for top-level bindings
    /// and invalidated views
    pub fn parent(&self) -> Option<Node> {
        self.inner
            .link
            .lock()
            .parent
            .as_ref()
            .map(|inner| Node {
                inner: Arc::clone(inner),
            })
    }

    pub fn is_valid(&self) -> bool {
        self.inner.link.lock().valid
    }

    /// Whether `self` and `other` are the same view object
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy of the current value
    pub fn value(&self) -> Result<Value> {
        self.read(|value| Ok(value.clone()))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.read(|value| Ok(self.as_object(value)?.contains_key(key)))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.read(|value| Ok(self.as_object(value)?.keys().cloned().collect()))
    }

    /// Truthiness of the current value: null, false, zero, and empty
    /// strings, arrays, or mappings are false
    pub fn is_truthy(&self) -> Result<bool> {
        self.read(|value| {
            Ok(match value {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
            })
        })
    }

    /// View of the child at `key`; fails with `KeyNotFound` if it is missing
    pub fn get(&self, key: &str) -> Result<Node> {
        self.read(|value| {
            if self.as_object(value)?.contains_key(key) {
                Ok(())
            } else {
                Err(self.key_not_found(key))
            }
        })?;
        self.child(key)
    }

    /// View of the child at `key`, inserting `default` first if it is missing
    pub fn get_or_insert(&self, key: &str, default: impl Into<Value>) -> Result<Node> {
        let (document, inserted) = self.write(|object| {
            if object.contains_key(key) {
                false
            } else {
                object.insert(key.to_string(), default.into());
                true
            }
        })?;
        if inserted {
            document.mark_dirty(&self.child_path(key))?;
        }
        self.child(key)
    }

    /// Assign `value` at `key`
    ///
    /// Assigning a value equal to the current one changes nothing and marks
    /// nothing dirty.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let (document, changed) = self.write(|object| {
            if object.get(key) == Some(&value) {
                false
            } else {
                object.insert(key.to_string(), value);
                true
            }
        })?;
        if changed {
            self.notify(&document, key)?;
        }
        Ok(())
    }

    /// Remove `key`; removing a missing key is a no-op
    pub fn delete(&self, key: &str) -> Result<()> {
        let (document, removed) = self.write(|object| object.remove(key).is_some())?;
        if removed {
            self.notify(&document, key)?;
        }
        Ok(())
    }

    /// Remove this node from its parent mapping
    ///
    /// This is how a top-level binding leaves the document. Every view of
    /// this path, and every view beneath it, is invalidated.
    pub fn remove(&self) -> Result<()> {
        let document = self.document()?;
        let removed = document.with_tree(|tree| -> Result<bool> {
            let (key, parents) = match self.inner.path.split_last() {
                Some(split) => split,
                None => return Ok(false),
            };
            let container = if parents.is_empty() {
                &mut tree.root
            } else {
                match lookup_mut(&mut tree.root, parents)? {
                    Value::Object(object) => object,
                    other => return Err(not_a_mapping(parents, other)),
                }
            };
            Ok(container.remove(key).is_some())
        })??;
        document.views().invalidate(&self.inner.path, true);
        if removed {
            document.mark_dirty(&self.path())?;
        }
        Ok(())
    }

    /// Replace this node's value with `f(current)`
    ///
    /// The result is stored back into the parent mapping at this node's key,
    /// so in-place edits (appending to a list, bumping a counter) go through
    /// the same dirty tracking as [`Node::set`]. Views beneath this one are
    /// invalidated; this view itself stays valid.
    ///
    /// `f` runs with the tree locked and must not use the document.
    pub fn apply(&self, f: impl FnOnce(Value) -> Value) -> Result<()> {
        let document = self.document()?;
        let changed = document.with_tree(|tree| -> Result<bool> {
            let slot = lookup_mut(&mut tree.root, &self.inner.path)?;
            let next = f(slot.clone());
            if next == *slot {
                return Ok(false);
            }
            *slot = next;
            Ok(true)
        })??;
        if changed {
            document.views().invalidate(&self.inner.path, false);
            document.mark_dirty(&self.path())?;
        }
        Ok(())
    }

    /// Invalidate every view beneath this one, then record a change at `key`
    fn notify(&self, document: &DocumentInner, key: &str) -> Result<()> {
        document.views().invalidate(&self.inner.path, false);
        document.mark_dirty(&self.child_path(key))
    }

    /// Cached view of `key`, or a new one
    fn child(&self, key: &str) -> Result<Node> {
        let document = self.document()?;
        let mut link = self.inner.link.lock();
        if !link.valid {
            return Err(self.stale());
        }
        let cached = link
            .children
            .get(key)
            .and_then(Weak::upgrade)
            .filter(|child| child.link.lock().valid);
        if let Some(inner) = cached {
            return Ok(Node { inner });
        }

        link.children.retain(|_, child| child.strong_count() > 0);
        let mut path = self.inner.path.clone();
        path.push(key.to_string());
        let inner = Arc::new(NodeInner {
            document: self.inner.document.clone(),
            file: self.inner.file.clone(),
            path,
            link: Mutex::new(Link {
                valid: true,
                parent: Some(Arc::clone(&self.inner)),
                children: HashMap::new(),
            }),
        });
        link.children.insert(key.to_string(), Arc::downgrade(&inner));
        document.views().register(&inner);
        Ok(Node { inner })
    }

    fn document(&self) -> Result<Arc<DocumentInner>> {
        if !self.is_valid() {
            return Err(self.stale());
        }
        self.inner
            .document
            .upgrade()
            .ok_or_else(|| Error::UseAfterClose {
                path: self.inner.file.clone(),
            })
    }

    fn read<R>(&self, f: impl FnOnce(&Value) -> Result<R>) -> Result<R> {
        let document = self.document()?;
        document.with_tree(|tree| f(lookup(&tree.root, &self.inner.path)?))?
    }

    /// Mutate this node's mapping; returns the document for dirty marking
    fn write<R>(&self, f: impl FnOnce(&mut Object) -> R) -> Result<(Arc<DocumentInner>, R)> {
        let document = self.document()?;
        let result = document.with_tree(|tree| {
            let value = lookup_mut(&mut tree.root, &self.inner.path)?;
            match value {
                Value::Object(object) => Ok(f(object)),
                other => Err(not_a_mapping(&self.inner.path, other)),
            }
        })??;
        Ok((document, result))
    }

    fn as_object<'a>(&self, value: &'a Value) -> Result<&'a Object> {
        value
            .as_object()
            .ok_or_else(|| not_a_mapping(&self.inner.path, value))
    }

    fn child_path(&self, key: &str) -> String {
        format!("{}.{}", self.path(), key)
    }

    fn key_not_found(&self, key: &str) -> Error {
        Error::KeyNotFound {
            path: self.child_path(key),
        }
    }

    fn stale(&self) -> Error {
        Error::StaleView { path: self.path() }
    }
}

fn lookup<'a>(root: &'a Object, path: &[String]) -> Result<&'a Value> {
    let mut object = root;
    for (depth, key) in path.iter().enumerate() {
        let value = object.get(key).ok_or_else(|| Error::KeyNotFound {
            path: path[..=depth].join("."),
        })?;
        if depth + 1 == path.len() {
            return Ok(value);
        }
        object = value
            .as_object()
            .ok_or_else(|| not_a_mapping(&path[..=depth], value))?;
    }
    Err(Error::KeyNotFound {
        path: String::new(),
    })
}

fn lookup_mut<'a>(root: &'a mut Object, path: &[String]) -> Result<&'a mut Value> {
    let (last, parents) = path.split_last().ok_or_else(|| Error::KeyNotFound {
        path: String::new(),
    })?;
    let mut object = root;
    for (depth, key) in parents.iter().enumerate() {
        let value = object.get_mut(key).ok_or_else(|| Error::KeyNotFound {
            path: path[..=depth].join("."),
        })?;
        object = match value {
            Value::Object(inner) => inner,
            other => return Err(not_a_mapping(&path[..=depth], other)),
        };
    }
    object.get_mut(last).ok_or_else(|| Error::KeyNotFound {
        path: path.join("."),
    })
}

fn not_a_mapping(path: &[String], value: &Value) -> Error {
    Error::NotAMapping {
        path: format!("{} ({})", path.join("."), codec::kind(value)),
    }
}

/// Views compare by current value. A view that cannot produce a value
/// (stale, or its document closed) is equal to nothing, itself included.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self.value(), other.value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq<Value> for Node {
    fn eq(&self, other: &Value) -> bool {
        self.value().is_ok_and(|value| value == *other)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Map keys serialize sorted, so equal values hash alike
        self.value().ok().map(|value| value.to_string()).hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Ok(value) => write!(f, "{value}"),
            Err(e) => write!(f, "<{e}>"),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path())
            .field("value", &self.value().ok())
            .finish()
    }
}
