//! Typed configuration/state tree.
//!
//! A tree is a [`Container`] of named [`Node`]s. Leaves hold a typed
//! [`Value`]; lists hold entries keyed by the tuple of their key leaves.
//! Entries are kept in key order, and every entry container also holds its
//! own key leaves so that printing an entry shows them.

pub mod syntax;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{ConfigError, Result};
use crate::path::{BoundPath, BoundStep};


// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("expected 6 octets in '{}'", s));
        }
        let mut out = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 {
                return Err(format!("bad octet '{}' in '{}'", part, s));
            }
            out[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad octet '{}' in '{}'", part, s))?;
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}


/// A leaf value in its canonical typed form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Uint(u64),
    Bool(bool),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac(MacAddr),
    Str(String),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Ipv4(a) => write!(f, "{}", a),
            Value::Ipv6(a) => write!(f, "{}", a),
            Value::Mac(m) => write!(f, "{}", m),
            Value::Str(s) => f.write_str(s),
        }
    }
}


/// The key tuple of a list entry, in the list's declared key order.
pub type Key = Vec<Value>;

pub fn format_key(names: &[&str], key: &Key) -> String {
    names
        .iter()
        .zip(key.iter())
        .map(|(n, v)| format!("[{}={}]", n, v))
        .collect()
}


// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Value),
    Container(Container),
    List(List),
}


#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    children: BTreeMap<String, Node>,
}


#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct List {
    entries: BTreeMap<Key, Container>,
}


/// A whole configuration or state document.
pub type ConfigTree = Container;


/// The result of looking a bound path up in a tree.
#[derive(Debug, Clone, Copy)]
pub enum Found<'t> {
    Leaf(&'t Value),
    Container(&'t Container),
    List(&'t List),
    Entry(&'t Key, &'t Container),
}


impl Container {
    pub fn new() -> Self {
        Container::default()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.get_mut(name)
    }

    pub fn insert(&mut self, name: &str, node: Node) -> Option<Node> {
        self.children.insert(name.to_string(), node)
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.children.iter()
    }

    pub fn leaf(&self, name: &str) -> Option<&Value> {
        match self.children.get(name) {
            Some(Node::Leaf(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_leaf(&mut self, name: &str, value: Value) {
        self.children.insert(name.to_string(), Node::Leaf(value));
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        match self.children.get(name) {
            Some(Node::Container(c)) => Some(c),
            _ => None,
        }
    }

    /// Get a child container, creating an empty one if absent.
    pub fn container_mut(&mut self, name: &str) -> &mut Container {
        let slot = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Node::Container(Container::new()));
        if !matches!(slot, Node::Container(_)) {
            *slot = Node::Container(Container::new());
        }
        match slot {
            Node::Container(c) => c,
            _ => unreachable!("slot was just made a container"),
        }
    }

    pub fn list(&self, name: &str) -> Option<&List> {
        match self.children.get(name) {
            Some(Node::List(l)) => Some(l),
            _ => None,
        }
    }

    /// Get a child list, creating an empty one if absent.
    pub fn list_mut(&mut self, name: &str) -> &mut List {
        let slot = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Node::List(List::new()));
        if !matches!(slot, Node::List(_)) {
            *slot = Node::List(List::new());
        }
        match slot {
            Node::List(l) => l,
            _ => unreachable!("slot was just made a list"),
        }
    }

    /// Follow a container path of plain names (no list steps).
    pub fn descend(&self, names: &[&str]) -> Option<&Container> {
        let mut cur = self;
        for name in names {
            cur = cur.container(name)?;
        }
        Some(cur)
    }

    /// Look a bound path up in this tree.
    pub fn lookup(&self, path: &BoundPath) -> Result<Found<'_>> {
        let mut found = Found::Container(self);
        for (depth, step) in path.steps.iter().enumerate() {
            let parent = match found {
                Found::Container(c) | Found::Entry(_, c) => c,
                _ => return Err(missing(path, depth + 1)),
            };
            let node = parent.get(&step.name).ok_or_else(|| missing(path, depth + 1))?;
            found = match (node, &step.key) {
                (Node::List(list), Some(key)) => {
                    let (k, entry) = list
                        .entries
                        .get_key_value(key)
                        .ok_or_else(|| missing(path, depth + 1))?;
                    Found::Entry(k, entry)
                }
                (Node::List(list), None) => Found::List(list),
                (Node::Container(c), _) => Found::Container(c),
                (Node::Leaf(v), _) => Found::Leaf(v),
            };
        }
        Ok(found)
    }

    /// Mutable access to the container that holds the final step of `path`.
    ///
    /// Every intermediate step must already exist.
    pub fn parent_mut(&mut self, path: &BoundPath) -> Result<&mut Container> {
        let n = path.steps.len();
        if n == 0 {
            return Err(ConfigError::invalid("modify", "/", "the root has no parent"));
        }
        let mut cur = self;
        for (depth, step) in path.steps[..n - 1].iter().enumerate() {
            cur = step_into_mut(cur, step).ok_or_else(|| missing(path, depth + 1))?;
        }
        Ok(cur)
    }
}


fn step_into_mut<'a>(cur: &'a mut Container, step: &BoundStep) -> Option<&'a mut Container> {
    match (cur.children.get_mut(&step.name)?, &step.key) {
        (Node::Container(c), _) => Some(c),
        (Node::List(list), Some(key)) => list.entries.get_mut(key),
        _ => None,
    }
}


fn missing(path: &BoundPath, depth: usize) -> ConfigError {
    ConfigError::NoSuchEntry {
        path: path.prefix(depth).to_string(),
    }
}


impl List {
    pub fn new() -> Self {
        List::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Container> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Container> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, refusing to overwrite an existing key.
    pub fn insert_new(&mut self, key: Key, entry: Container) -> std::result::Result<(), Key> {
        if self.entries.contains_key(&key) {
            return Err(key);
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn replace(&mut self, key: Key, entry: Container) -> Option<Container> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Container> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Container)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Key, &mut Container)> {
        self.entries.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
