//! Binding parsed paths against a schema.

use super::{BoundPath, BoundStep, PathExpr};
use crate::data::Key;
use crate::error::{ConfigError, Result};
use crate::schema::{Mode, Schema, SchemaNode};


/// A path bound to a schema: the typed path plus the schema node it
/// addresses.
#[derive(Debug, Clone)]
pub struct Bound<'s> {
    pub path: BoundPath,
    pub node: &'s SchemaNode,
    /// The schema node of the parent step (the root for one-step paths).
    pub parent: &'s SchemaNode,
}

impl Bound<'_> {
    /// True if the path names a whole list rather than one entry.
    pub fn is_whole_list(&self) -> bool {
        self.node.is_list() && self.path.last().map_or(false, |s| s.key.is_none())
    }

    pub fn is_entry(&self) -> bool {
        self.node.is_list() && self.path.last().map_or(false, |s| s.key.is_some())
    }
}


/// Bind `expr` against `schema` as seen in `mode`.
///
/// Fails `UnknownNode` for names that do not exist (or are not visible in
/// this mode), `KeyMismatch` when predicates do not supply exactly the
/// declared keys or a keyless list step appears mid-path, and
/// `TypeMismatch` when a key literal does not parse.
pub fn bind<'s>(schema: &'s Schema, expr: &PathExpr, mode: Mode) -> Result<Bound<'s>> {
    let mut node = &schema.root;
    let mut parent = &schema.root;
    let mut path = BoundPath::root();

    for step in &expr.steps {
        if node.is_list() && path.last().map_or(false, |s| s.key.is_none()) {
            return Err(ConfigError::KeyMismatch {
                list: path.to_string(),
                expected: node.keys().join(" "),
                got: String::new(),
            });
        }
        let child = node
            .child(&step.name)
            .filter(|c| node.child_visible(c, mode))
            .ok_or_else(|| ConfigError::UnknownNode {
                parent: path.to_string(),
                name: step.name.clone(),
            })?;

        let bound = if child.is_list() && !step.predicates.is_empty() {
            BoundStep::keyed(child.name, child.keys(), bind_key(child, &step.predicates)?)
        } else if !step.predicates.is_empty() {
            return Err(ConfigError::KeyMismatch {
                list: child.name.to_string(),
                expected: String::new(),
                got: predicate_names(&step.predicates),
            });
        } else {
            BoundStep::plain(child.name)
        };

        path.steps.push(bound);
        parent = node;
        node = child;
    }

    Ok(Bound { path, node, parent })
}


/// Parse and bind in one go.
pub fn bind_str<'s>(schema: &'s Schema, path: &str, mode: Mode) -> Result<Bound<'s>> {
    bind(schema, &PathExpr::parse(path)?, mode)
}


fn predicate_names(predicates: &[(String, String)]) -> String {
    predicates
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}


/// Turn `[k=v]` predicates into a typed key tuple in declared key order.
fn bind_key(list: &SchemaNode, predicates: &[(String, String)]) -> Result<Key> {
    let keys = list.keys();
    let arity_ok = predicates.len() == keys.len()
        && keys
            .iter()
            .all(|k| predicates.iter().filter(|(p, _)| p == k).count() == 1);
    if !arity_ok {
        return Err(ConfigError::KeyMismatch {
            list: list.name.to_string(),
            expected: keys.join(" "),
            got: predicate_names(predicates),
        });
    }

    let mut key = Vec::with_capacity(keys.len());
    for name in keys {
        let literal = predicates
            .iter()
            .find(|(p, _)| p == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default();
        let spec = list
            .child(name)
            .and_then(|c| c.leaf())
            .ok_or_else(|| ConfigError::UnknownNode {
                parent: list.name.to_string(),
                name: name.to_string(),
            })?;
        key.push(spec.ty.parse(name, literal)?);
    }
    Ok(key)
}
