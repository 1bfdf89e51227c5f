//! Operational state: per-instance counters and their aggregate.
//!
//! Workers own their counters and publish snapshots into a shared slot;
//! nothing here caches totals. Every read rebuilds the state tree from the
//! latest published snapshots, so the aggregate always equals the sum of
//! the per-instance values it was built from.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::{ConfigTree, Container, Value};
use crate::error::Result;
use crate::instance::InstanceId;
use crate::projection;
use crate::schema::softwire::{COUNTERS, NON_SUMMABLE};
use crate::schema::SchemaName;


// ---------------------------------------------------------------------------
// CounterSet
// ---------------------------------------------------------------------------

/// Counter name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSet {
    values: BTreeMap<String, u64>,
}

impl CounterSet {
    /// Every known counter, set to zero.
    pub fn zeroed() -> Self {
        CounterSet {
            values: COUNTERS.iter().map(|c| (c.to_string(), 0)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: u64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn bump(&mut self, name: &str, delta: u64) {
        let slot = self.values.entry(name.to_string()).or_insert(0);
        *slot = slot.saturating_add(delta);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Fold `other` into this set: sums, except point-in-time counters
    /// which keep the most recent (largest) value.
    pub fn accumulate(&mut self, other: &CounterSet) {
        for (name, value) in other.iter() {
            if NON_SUMMABLE.contains(&name) {
                let slot = self.values.entry(name.to_string()).or_insert(0);
                *slot = (*slot).max(value);
            } else {
                self.bump(name, value);
            }
        }
    }

    fn to_container(&self) -> Container {
        let mut c = Container::new();
        for (name, value) in self.iter() {
            c.set_leaf(name, Value::Uint(value));
        }
        c
    }
}


/// Sum a collection of counter sets.
pub fn aggregate<'a>(sets: impl IntoIterator<Item = &'a CounterSet>) -> CounterSet {
    let mut total = CounterSet::zeroed();
    for set in sets {
        total.accumulate(set);
    }
    total
}


// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Anything that can report the latest counters of each live instance.
pub trait CounterSource: Send + Sync {
    fn counters(&self) -> Vec<(InstanceId, CounterSet)>;
}


/// Build the canonical state tree: the aggregate under `softwire-state`
/// and each instance's own counters under
/// `softwire-config/instance[device]/queue[id]/softwire-state`.
pub fn state_tree(per_instance: &[(InstanceId, CounterSet)]) -> ConfigTree {
    let mut tree = ConfigTree::new();
    let total = aggregate(per_instance.iter().map(|(_, c)| c));
    tree.insert("softwire-state", crate::data::Node::Container(total.to_container()));

    let instances = tree.container_mut("softwire-config").list_mut("instance");
    for (id, counters) in per_instance {
        let device_key = vec![Value::Str(id.device.clone())];
        if !instances.contains(&device_key) {
            let mut entry = Container::new();
            entry.set_leaf("device", Value::Str(id.device.clone()));
            instances.replace(device_key.clone(), entry);
        }
        if let Some(entry) = instances.get_mut(&device_key) {
            let mut queue = Container::new();
            queue.set_leaf("id", Value::Uint(u64::from(id.queue)));
            queue.insert("softwire-state", crate::data::Node::Container(counters.to_container()));
            entry
                .list_mut("queue")
                .replace(vec![Value::Uint(u64::from(id.queue))], queue);
        }
    }
    tree
}


pub struct StateAggregator {
    source: Arc<dyn CounterSource>,
}

impl StateAggregator {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        StateAggregator { source }
    }

    pub fn state_tree(&self) -> ConfigTree {
        state_tree(&self.source.counters())
    }

    /// Aggregated counters across every live instance.
    pub fn totals(&self) -> CounterSet {
        let per_instance = self.source.counters();
        aggregate(per_instance.iter().map(|(_, c)| c))
    }

    /// Read a state path through `schema`.
    pub fn get_state(&self, schema: SchemaName, canonical: &ConfigTree, path: &str) -> Result<String> {
        projection::read_state(schema, canonical, &self.state_tree(), path)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
