//! Config store: the canonical configuration tree and its commit log.
//!
//! Readers take an `Arc` snapshot and never block writers for longer than
//! a pointer swap. Writers are serialized by the commit lock; each mutation
//! is applied to a private copy, normalized, offered to the commit listener
//! (the instance manager), and only then published. Subscribers receive
//! every published commit under their prefix, in commit order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::data::syntax::{self, entry_key, leaf_literal};
use crate::data::{ConfigTree, Found, Node};
use crate::error::{ConfigError, Result};
use crate::path::{self, Bound, BoundPath};
use crate::schema::{softwire, Mode, Schema, SchemaNode};


// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Set,
    Add,
    Remove,
}

impl Mutation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutation::Set => "set",
            Mutation::Add => "add",
            Mutation::Remove => "remove",
        }
    }
}


/// One published change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub seq: u64,
    pub verb: Mutation,
    pub path: BoundPath,
    pub value: Option<String>,
}


/// Veto point consulted before a mutation is published.
///
/// Returning an error rolls the mutation back.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, old: &ConfigTree, new: &ConfigTree) -> Result<()>;
}


struct Subscriber {
    prefix: BoundPath,
    tx: Sender<Commit>,
}

#[derive(Default)]
struct CommitLog {
    seq: u64,
    subscribers: Vec<Subscriber>,
}


// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

pub struct ConfigStore {
    schema: &'static Schema,
    current: RwLock<Arc<ConfigTree>>,
    log: Mutex<CommitLog>,
    listener: RwLock<Option<Arc<dyn CommitListener>>>,
}

impl ConfigStore {
    /// Wrap an already validated canonical tree.
    pub fn new(tree: ConfigTree) -> Self {
        ConfigStore {
            schema: softwire::schema(),
            current: RwLock::new(Arc::new(tree)),
            log: Mutex::new(CommitLog::default()),
            listener: RwLock::new(None),
        }
    }

    /// Parse and validate a configuration document.
    pub fn from_text(text: &str) -> Result<Self> {
        let tree = syntax::parse_document(&softwire::schema().root, text)?;
        Ok(ConfigStore::new(tree))
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn set_listener(&self, listener: Arc<dyn CommitListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn snapshot(&self) -> Arc<ConfigTree> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current commit sequence number (0 before the first mutation).
    pub fn seq(&self) -> u64 {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).seq
    }

    /// Read a configuration node, rendered as text.
    pub fn get(&self, path: &str) -> Result<String> {
        let bound = path::resolve::bind_str(self.schema, path, Mode::Config)?;
        let tree = self.snapshot();
        let found = tree.lookup(&bound.path)?;
        Ok(render(bound.node, found))
    }

    pub fn set(&self, path: &str, value: &str) -> Result<u64> {
        let bound = path::resolve::bind_str(self.schema, path, Mode::Config)?;
        let root = &self.schema.root;
        self.transact(Mutation::Set, bound.path.clone(), Some(value.trim()), |tree| {
            apply_set(root, tree, &bound, value)
        })
    }

    pub fn add(&self, path: &str, value: &str) -> Result<u64> {
        let bound = path::resolve::bind_str(self.schema, path, Mode::Config)?;
        self.transact(Mutation::Add, bound.path.clone(), Some(value.trim()), |tree| {
            apply_add(tree, &bound, value)
        })
    }

    pub fn remove(&self, path: &str) -> Result<u64> {
        let bound = path::resolve::bind_str(self.schema, path, Mode::Config)?;
        self.transact(Mutation::Remove, bound.path.clone(), None, |tree| {
            apply_remove(tree, &bound)
        })
    }

    /// Replace the whole configuration with a validated document.
    pub fn replace_all(&self, tree: ConfigTree) -> Result<u64> {
        self.transact(Mutation::Set, BoundPath::root(), None, move |slot| {
            *slot = tree;
            Ok(())
        })
    }

    /// Subscribe to commits at or beneath `prefix`.
    pub fn subscribe(&self, prefix: BoundPath) -> Receiver<Commit> {
        let (tx, rx) = mpsc::channel();
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(prefix = %prefix, "commit subscriber added");
        log.subscribers.push(Subscriber { prefix, tx });
        rx
    }

    /// Apply `edit` to a copy of the current tree and publish the result.
    ///
    /// Nothing becomes visible unless the edit, normalization and the
    /// commit listener all succeed.
    pub fn transact<F>(
        &self,
        verb: Mutation,
        path: BoundPath,
        value: Option<&str>,
        edit: F,
    ) -> Result<u64>
    where
        F: FnOnce(&mut ConfigTree) -> Result<()>,
    {
        self.commit(path, edit, |_, _| (verb, value.map(str::to_string)))
    }

    /// Like [`transact`](Self::transact), but the commit describes the
    /// post-edit contents of `path`: a `set` carrying the rendered subtree,
    /// or a `remove` if the edit deleted it.
    pub fn transact_rendered<F>(&self, path: BoundPath, edit: F) -> Result<u64>
    where
        F: FnOnce(&mut ConfigTree) -> Result<()>,
    {
        let schema = self.schema;
        self.commit(path, edit, move |next, path| {
            let names: Vec<&str> = path.steps.iter().map(|s| s.name.as_str()).collect();
            let rendered = schema
                .node_at(&names)
                .and_then(|node| next.lookup(path).ok().map(|found| render(node, found)));
            match rendered {
                Some(text) => (Mutation::Set, Some(text)),
                None => (Mutation::Remove, None),
            }
        })
    }

    fn commit<F, D>(&self, path: BoundPath, edit: F, describe: D) -> Result<u64>
    where
        F: FnOnce(&mut ConfigTree) -> Result<()>,
        D: FnOnce(&ConfigTree, &BoundPath) -> (Mutation, Option<String>),
    {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let old = self.snapshot();
        let mut next = (*old).clone();
        edit(&mut next)?;
        syntax::normalize(&self.schema.root, &mut next, "/")?;
        let (verb, value) = describe(&next, &path);

        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            if let Err(e) = listener.on_commit(&old, &next) {
                warn!(verb = verb.as_str(), path = %path, error = %e, "commit rolled back");
                return Err(e);
            }
        }

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        log.seq += 1;
        let commit = Commit {
            seq: log.seq,
            verb,
            path,
            value,
        };
        info!(seq = commit.seq, verb = verb.as_str(), path = %commit.path, "committed");

        log.subscribers.retain(|sub| {
            if !sub.prefix.covers(&commit.path) && !commit.path.covers(&sub.prefix) {
                return true;
            }
            sub.tx.send(commit.clone()).is_ok()
        });
        Ok(commit.seq)
    }
}


// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render a looked-up node: bare literal for leaves, data syntax otherwise.
pub fn render(node: &SchemaNode, found: Found<'_>) -> String {
    match found {
        Found::Leaf(v) => v.to_string(),
        Found::Container(c) | Found::Entry(_, c) => syntax::print_container(node, c),
        Found::List(l) => syntax::print_list(node, l),
    }
}


// ---------------------------------------------------------------------------
// Tree edits
// ---------------------------------------------------------------------------

fn is_key_leaf(bound: &Bound<'_>) -> bool {
    bound.node.is_leaf() && bound.parent.keys().contains(&bound.node.name)
}


/// Overwrite an existing leaf, container or list entry.
///
/// Optional leaves may be assigned inside an existing parent; list entries
/// are never created and must keep their key.
pub fn apply_set(root: &SchemaNode, tree: &mut ConfigTree, bound: &Bound<'_>, value: &str) -> Result<()> {
    let at = bound.path.to_string();
    if bound.path.is_root() {
        *tree = syntax::parse_container(root, "/", value)?;
        return Ok(());
    }
    if bound.is_whole_list() {
        return Err(ConfigError::invalid("set", &at, "cannot set a whole list; use add or remove"));
    }
    if is_key_leaf(bound) {
        return Err(ConfigError::invalid("set", &at, "cannot change a list key"));
    }
    let name = bound.node.name;

    if let Some(spec) = bound.node.leaf() {
        let parsed = spec.ty.parse(name, &leaf_literal(value))?;
        tree.parent_mut(&bound.path)?.set_leaf(name, parsed);
        return Ok(());
    }

    let mut fresh = syntax::parse_container(bound.node, &at, value)?;
    if bound.is_entry() {
        let step = bound.path.last().and_then(|s| s.key.clone()).unwrap_or_default();
        for (key_name, key_value) in bound.node.keys().iter().zip(step.iter()) {
            if fresh.get(key_name).is_none() {
                fresh.set_leaf(key_name, key_value.clone());
            }
        }
        if entry_key(bound.node, &fresh)? != step {
            return Err(ConfigError::invalid("set", &at, "an entry must keep its key"));
        }
        let parent = tree.parent_mut(&bound.path)?;
        let list = match parent.get_mut(name) {
            Some(Node::List(list)) if list.contains(&step) => list,
            _ => return Err(ConfigError::NoSuchEntry { path: at }),
        };
        list.replace(step, fresh);
    } else {
        tree.parent_mut(&bound.path)?.insert(name, Node::Container(fresh));
    }
    Ok(())
}


/// Add one entry to the list named by `bound`.
pub fn apply_add(tree: &mut ConfigTree, bound: &Bound<'_>, value: &str) -> Result<()> {
    let at = bound.path.to_string();
    if !bound.is_whole_list() {
        return Err(ConfigError::invalid("add", &at, "add needs a path naming a list"));
    }
    let entry = syntax::parse_container(bound.node, &at, value)?;
    let key = entry_key(bound.node, &entry)?;
    let list = tree.parent_mut(&bound.path)?.list_mut(bound.node.name);
    list.insert_new(key, entry).map_err(|key| ConfigError::DuplicateKey {
        list: at.clone(),
        key: crate::data::format_key(bound.node.keys(), &key),
    })
}


/// Remove a list entry or an optional leaf.
pub fn apply_remove(tree: &mut ConfigTree, bound: &Bound<'_>) -> Result<()> {
    let at = bound.path.to_string();
    let name = bound.node.name;
    if bound.is_entry() {
        let key = bound.path.last().and_then(|s| s.key.clone()).unwrap_or_default();
        let removed = match tree.parent_mut(&bound.path)?.get_mut(name) {
            Some(Node::List(list)) => list.remove(&key),
            _ => None,
        };
        return removed
            .map(|_| ())
            .ok_or(ConfigError::NoSuchEntry { path: at });
    }
    match bound.node.leaf() {
        Some(spec) if spec.mandatory || is_key_leaf(bound) => {
            Err(ConfigError::invalid("remove", &at, "leaf is mandatory"))
        }
        Some(_) => tree
            .parent_mut(&bound.path)?
            .remove(name)
            .map(|_| ())
            .ok_or(ConfigError::NoSuchEntry { path: at }),
        None => Err(ConfigError::invalid(
            "remove",
            &at,
            "remove applies to list entries and leaves",
        )),
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
