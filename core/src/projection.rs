//! Schema projection between `snabb-softwire-v2` and `ietf-softwire-br`.
//!
//! Only the canonical tree is stored. Reads through the ietf schema
//! materialize the ietf view from a canonical snapshot; writes are applied
//! to that view, and the difference between the old and new view is
//! replayed onto the canonical tree inside one store transaction.
//!
//! The ietf binding table is keyed by B4 address while the canonical one is
//! keyed by `(ipv4, psid)`. When several softwires share a B4 address the
//! view shows the one with the greatest canonical key.

use std::collections::BTreeMap;

use tracing::debug;

use crate::data::syntax;
use crate::data::{ConfigTree, Container, Key, Value};
use crate::error::{ConfigError, Result};
use crate::path::resolve::{bind, bind_str, Bound};
use crate::path::{BoundPath, BoundStep, PathExpr};
use crate::schema::ietf::{self, BR_INSTANCE_ID, TRAFFIC_STAT};
use crate::schema::{softwire, Mode, SchemaName};
use crate::store::{self, ConfigStore, Mutation};


/// `(leaf path inside binding-entry, leaf path inside softwire)`.
pub const ENTRY_LEAVES: &[(&[&str], &[&str])] = &[
    (&["binding-ipv6info"], &["b4-ipv6"]),
    (&["binding-ipv4-addr"], &["ipv4"]),
    (&["br-ipv6-addr"], &["br-address"]),
    (&["port-set", "psid"], &["psid"]),
    (&["port-set", "psid-len"], &["port-set", "psid-length"]),
    (&["port-set", "psid-offset"], &["port-set", "reserved-ports-bit-count"]),
];

const BR_INSTANCES: &[&str] = &["softwire-config", "binding", "br", "br-instances"];
const BINDING_TABLE: &[&str] = &["softwire-config", "binding-table"];


// ---------------------------------------------------------------------------
// Public entry points, selected by schema
// ---------------------------------------------------------------------------

/// Read a configuration node through `schema`.
pub fn read_config(schema: SchemaName, canonical: &ConfigTree, path: &str) -> Result<String> {
    match schema {
        SchemaName::SoftwireV2 => {
            let bound = bind_str(softwire::schema(), path, Mode::Config)?;
            Ok(store::render(bound.node, canonical.lookup(&bound.path)?))
        }
        SchemaName::IetfSoftwireBr => {
            let bound = bind_ietf(canonical, path, Mode::Config)?;
            let view = from_canonical(canonical);
            Ok(store::render(bound.node, view.lookup(&bound.path)?))
        }
    }
}


/// Read a state node through `schema`. `state` is the canonical state tree.
pub fn read_state(
    schema: SchemaName,
    canonical: &ConfigTree,
    state: &ConfigTree,
    path: &str,
) -> Result<String> {
    match schema {
        SchemaName::SoftwireV2 => {
            let bound = bind_str(softwire::schema(), path, Mode::State)?;
            Ok(store::render(bound.node, state.lookup(&bound.path)?))
        }
        SchemaName::IetfSoftwireBr => {
            let bound = bind_ietf(canonical, path, Mode::State)?;
            let view = state_from_canonical(state);
            Ok(store::render(bound.node, view.lookup(&bound.path)?))
        }
    }
}


/// Apply a mutation expressed in `schema` to the store.
pub fn write(
    store: &ConfigStore,
    schema: SchemaName,
    verb: Mutation,
    path: &str,
    value: Option<&str>,
) -> Result<u64> {
    let value_text = value.unwrap_or("");
    match (schema, verb) {
        (SchemaName::SoftwireV2, Mutation::Set) => store.set(path, value_text),
        (SchemaName::SoftwireV2, Mutation::Add) => store.add(path, value_text),
        (SchemaName::SoftwireV2, Mutation::Remove) => store.remove(path),
        (SchemaName::IetfSoftwireBr, _) => write_ietf(store, verb, path, value),
    }
}


/// The canonical prefix a `listen` on `path` subscribes to.
pub fn listen_prefix(schema: SchemaName, canonical: &ConfigTree, path: &str) -> Result<BoundPath> {
    match schema {
        SchemaName::SoftwireV2 => Ok(bind_str(softwire::schema(), path, Mode::Config)?.path),
        SchemaName::IetfSoftwireBr => {
            let bound = bind_ietf(canonical, path, Mode::Config)?;
            Ok(canonical_target(&bound.path))
        }
    }
}


// ---------------------------------------------------------------------------
// Path handling
// ---------------------------------------------------------------------------

fn configured_name(canonical: &ConfigTree) -> Option<String> {
    canonical
        .descend(&["softwire-config"])
        .and_then(|c| c.leaf("name"))
        .map(|v| v.to_string())
}


/// Rewrite `br-instance[name=X]` to `br-instance[id=1]` and reject ids
/// other than the one exposed instance.
pub fn canonicalize_br_instance(expr: &PathExpr, configured: Option<&str>) -> Result<PathExpr> {
    let mut out = expr.clone();
    for step in out.steps.iter_mut().filter(|s| s.name == "br-instance") {
        let by_name = match step.predicates.as_slice() {
            [(k, v)] if k == "name" => {
                if configured != Some(v.as_str()) {
                    return Err(ConfigError::SchemaMismatch(format!(
                        "br-instance name does not match: '{}' (configured: '{}')",
                        v,
                        configured.unwrap_or("")
                    )));
                }
                true
            }
            [(k, v)] if k == "id" => {
                if v.trim().parse::<u64>().ok() != Some(BR_INSTANCE_ID) {
                    return Err(ConfigError::SchemaMismatch(format!(
                        "br-instance id does not match: {} (only {} exists)",
                        v, BR_INSTANCE_ID
                    )));
                }
                false
            }
            _ => false,
        };
        if by_name {
            step.predicates = vec![("id".to_string(), BR_INSTANCE_ID.to_string())];
        }
    }
    Ok(out)
}


fn bind_ietf(canonical: &ConfigTree, path: &str, mode: Mode) -> Result<Bound<'static>> {
    let expr = PathExpr::parse(path)?;
    let name = configured_name(canonical);
    let expr = canonicalize_br_instance(&expr, name.as_deref())?;
    bind(ietf::schema(), &expr, mode)
}


fn plain_path(names: &[&str]) -> BoundPath {
    BoundPath {
        steps: names.iter().map(|n| BoundStep::plain(n)).collect(),
    }
}


/// The canonical node an ietf path maps onto, for notification routing.
fn canonical_target(ietf_path: &BoundPath) -> BoundPath {
    let names: Vec<&str> = ietf_path.steps.iter().map(|s| s.name.as_str()).collect();
    match names.get(BR_INSTANCES.len() + 1..) {
        Some(["name"]) => plain_path(&["softwire-config", "name"]),
        Some(["binding-table", ..]) => {
            plain_path(&["softwire-config", "binding-table", "softwire"])
        }
        _ => plain_path(&["softwire-config"]),
    }
}


// ---------------------------------------------------------------------------
// Tree translation
// ---------------------------------------------------------------------------

fn leaf_at<'c>(c: &'c Container, path: &[&str]) -> Option<&'c Value> {
    let (last, dirs) = path.split_last()?;
    c.descend(dirs)?.leaf(last)
}


fn set_leaf_at(c: &mut Container, path: &[&str], value: Value) {
    if let Some((last, dirs)) = path.split_last() {
        let mut cur = c;
        for d in dirs {
            cur = cur.container_mut(d);
        }
        cur.set_leaf(last, value);
    }
}


/// Translate a canonical softwire entry into an ietf binding-entry.
pub fn softwire_to_entry(sw: &Container) -> Container {
    let mut entry = Container::new();
    for (ietf_path, canonical_path) in ENTRY_LEAVES {
        if let Some(v) = leaf_at(sw, canonical_path) {
            set_leaf_at(&mut entry, ietf_path, v.clone());
        }
    }
    entry
}


/// Translate an ietf binding-entry into a canonical softwire entry.
pub fn entry_to_softwire(entry: &Container) -> Container {
    let mut sw = Container::new();
    for (ietf_path, canonical_path) in ENTRY_LEAVES {
        if let Some(v) = leaf_at(entry, ietf_path) {
            set_leaf_at(&mut sw, canonical_path, v.clone());
        }
    }
    sw
}


fn b4_of(sw: &Container) -> Option<&Value> {
    sw.leaf("b4-ipv6")
}


fn softwire_key(sw: &Container) -> Result<Key> {
    let node = softwire::schema()
        .node_at(&["softwire-config", "binding-table", "softwire"])
        .ok_or_else(|| ConfigError::SchemaMismatch("softwire list missing from schema".into()))?;
    syntax::entry_key(node, sw)
}


/// Materialize the ietf configuration view of a canonical tree.
pub fn from_canonical(canonical: &ConfigTree) -> ConfigTree {
    let mut br = Container::new();
    br.set_leaf("id", Value::Uint(BR_INSTANCE_ID));
    if let Some(name) = canonical.descend(&["softwire-config"]).and_then(|c| c.leaf("name")) {
        br.set_leaf("name", name.clone());
    }
    let entries = br.container_mut("binding-table").list_mut("binding-entry");
    if let Some(list) = canonical.descend(BINDING_TABLE).and_then(|c| c.list("softwire")) {
        for (_, sw) in list.iter() {
            if let Some(b4) = b4_of(sw) {
                entries.replace(vec![b4.clone()], softwire_to_entry(sw));
            }
        }
    }

    let mut view = ConfigTree::new();
    let mut cur = &mut view;
    for name in BR_INSTANCES {
        cur = cur.container_mut(name);
    }
    cur.list_mut("br-instance")
        .replace(vec![Value::Uint(BR_INSTANCE_ID)], br);
    view
}


/// Materialize the ietf state view from the canonical state tree.
pub fn state_from_canonical(state: &ConfigTree) -> ConfigTree {
    let mut br = Container::new();
    br.set_leaf("id", Value::Uint(BR_INSTANCE_ID));
    if let Some(totals) = state.container("softwire-state") {
        let stats = br.container_mut("traffic-stat");
        for (ietf_name, canonical_name) in TRAFFIC_STAT {
            if let Some(v) = totals.leaf(canonical_name) {
                stats.set_leaf(ietf_name, v.clone());
            }
        }
    }
    let mut view = ConfigTree::new();
    let mut cur = &mut view;
    for name in BR_INSTANCES {
        cur = cur.container_mut(name);
    }
    cur.list_mut("br-instance")
        .replace(vec![Value::Uint(BR_INSTANCE_ID)], br);
    view
}


// ---------------------------------------------------------------------------
// ietf writes
// ---------------------------------------------------------------------------

fn view_entries(view: &ConfigTree) -> BTreeMap<Key, Container> {
    view.descend(BR_INSTANCES)
        .and_then(|c| c.list("br-instance"))
        .and_then(|l| l.get(&vec![Value::Uint(BR_INSTANCE_ID)]))
        .and_then(|br| br.descend(&["binding-table"]))
        .and_then(|bt| bt.list("binding-entry"))
        .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}


fn view_instance(view: &ConfigTree) -> Result<&Container> {
    let list = view
        .descend(BR_INSTANCES)
        .and_then(|c| c.list("br-instance"))
        .ok_or_else(|| ConfigError::invalid("modify", "/softwire-config/binding/br/br-instances", "br-instance cannot be removed"))?;
    for key in list.keys() {
        if key != &vec![Value::Uint(BR_INSTANCE_ID)] {
            return Err(ConfigError::SchemaMismatch(format!(
                "br-instance id does not match: {} (only {} exists)",
                key.first().map(|v| v.to_string()).unwrap_or_default(),
                BR_INSTANCE_ID
            )));
        }
    }
    list.get(&vec![Value::Uint(BR_INSTANCE_ID)]).ok_or_else(|| {
        ConfigError::invalid(
            "remove",
            "/softwire-config/binding/br/br-instances/br-instance[id=1]",
            "br-instance cannot be removed",
        )
    })
}


fn write_ietf(store: &ConfigStore, verb: Mutation, path: &str, value: Option<&str>) -> Result<u64> {
    let snapshot = store.snapshot();
    let bound = bind_ietf(&snapshot, path, Mode::Config)?;
    let target = canonical_target(&bound.path);
    let ietf_root = &ietf::schema().root;
    let value_text = value.unwrap_or("");

    // Listeners see the canonical result, not the ietf fragment.
    store.transact_rendered(target, |tree| {
        let old_view = from_canonical(tree);
        let mut new_view = old_view.clone();
        match verb {
            Mutation::Set => store::apply_set(ietf_root, &mut new_view, &bound, value_text)?,
            Mutation::Add => store::apply_add(&mut new_view, &bound, value_text)?,
            Mutation::Remove => store::apply_remove(&mut new_view, &bound)?,
        }
        syntax::normalize(ietf_root, &mut new_view, "/")?;
        let new_br = view_instance(&new_view)?;
        debug!(verb = verb.as_str(), path = %bound.path, "replaying ietf edit");
        replay(tree, &old_view, &new_view, new_br)
    })
}


/// Apply the difference between two ietf views to the canonical tree.
fn replay(
    tree: &mut ConfigTree,
    old_view: &ConfigTree,
    new_view: &ConfigTree,
    new_br: &Container,
) -> Result<()> {
    let config = tree.container_mut("softwire-config");
    match new_br.leaf("name") {
        Some(name) => config.set_leaf("name", name.clone()),
        None => {
            config.remove("name");
        }
    }

    let old_entries = view_entries(old_view);
    let new_entries = view_entries(new_view);
    let list = config.container_mut("binding-table").list_mut("softwire");

    for (b4, old_entry) in &old_entries {
        match new_entries.get(b4) {
            None => {
                let doomed: Vec<Key> = list
                    .iter()
                    .filter(|(_, sw)| b4_of(sw) == b4.first())
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    list.remove(&key);
                }
            }
            Some(new_entry) if new_entry != old_entry => {
                let old_key = softwire_key(&entry_to_softwire(old_entry))?;
                list.remove(&old_key);
            }
            Some(_) => {}
        }
    }

    for (b4, new_entry) in &new_entries {
        if old_entries.get(b4) == Some(new_entry) {
            continue;
        }
        let sw = entry_to_softwire(new_entry);
        let key = softwire_key(&sw)?;
        if let Err(key) = list.insert_new(key, sw) {
            return Err(ConfigError::DuplicateKey {
                list: "/softwire-config/binding-table/softwire".into(),
                key: crate::data::format_key(&["ipv4", "psid"], &key),
            });
        }
    }
    Ok(())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
