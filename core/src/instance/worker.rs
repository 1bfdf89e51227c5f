//! Worker thread body and the data-plane seam.
//!
//! A worker owns one [`Dataplane`] and runs it in "breaths": each breath
//! moves traffic and bumps the worker's private counters. Counter snapshots
//! are copied into the shared slot every `publish_interval`, which is the
//! only place the aggregator ever reads from.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use super::{InstanceId, InstanceState};
use crate::data::{Container, Node, Value};
use crate::error::{ConfigError, Result};
use crate::state::CounterSet;


// ---------------------------------------------------------------------------
// Dataplane
// ---------------------------------------------------------------------------

/// The packet path behind one instance.
pub trait Dataplane: Send {
    /// Load (or reload) this instance's configuration slice.
    fn configure(&mut self, slice: &Container) -> Result<()>;

    /// Run one breath, adding whatever traffic moved to `counters`.
    fn breathe(&mut self, counters: &mut CounterSet) -> Result<()>;
}


/// Creates a data plane for a newly configured instance.
pub trait DataplaneFactory: Send + Sync {
    fn create(&self, id: &InstanceId, slice: &Container) -> Result<Box<dyn Dataplane>>;
}


/// Deterministic stand-in for the packet path.
///
/// Every breath each softwire exchanges one packet in each direction;
/// with hairpinning enabled one extra packet per breath is hairpinned.
#[derive(Debug, Default)]
pub struct SyntheticDataplane {
    softwires: u64,
    hairpinning: bool,
    mtu: u64,
}

const IPV4_PACKET_BYTES: u64 = 84;
const IPV6_OVERHEAD_BYTES: u64 = 40;

impl Dataplane for SyntheticDataplane {
    fn configure(&mut self, slice: &Container) -> Result<()> {
        self.softwires = slice
            .descend(&["binding-table"])
            .and_then(|bt| bt.list("softwire"))
            .map_or(0, |l| l.len() as u64);
        self.hairpinning = matches!(
            slice.descend(&["internal-interface"]).and_then(|c| c.leaf("hairpinning")),
            Some(Value::Bool(true))
        );
        self.mtu = slice
            .descend(&["external-interface"])
            .and_then(|c| c.leaf("mtu"))
            .and_then(Value::as_uint)
            .unwrap_or(1460);
        Ok(())
    }

    fn breathe(&mut self, counters: &mut CounterSet) -> Result<()> {
        let n = self.softwires;
        if n == 0 {
            return Ok(());
        }
        let v4 = IPV4_PACKET_BYTES.min(self.mtu);
        let v6 = v4 + IPV6_OVERHEAD_BYTES;
        counters.bump("in-ipv4-packets", n);
        counters.bump("in-ipv4-bytes", n * v4);
        counters.bump("out-ipv6-packets", n);
        counters.bump("out-ipv6-bytes", n * v6);
        counters.bump("in-ipv6-packets", n);
        counters.bump("in-ipv6-bytes", n * v6);
        counters.bump("out-ipv4-packets", n);
        counters.bump("out-ipv4-bytes", n * v4);
        if self.hairpinning {
            counters.bump("hairpin-ipv4-packets", 1);
            counters.bump("hairpin-ipv4-bytes", v4);
        }
        Ok(())
    }
}


#[derive(Debug, Default)]
pub struct SyntheticFactory;

impl DataplaneFactory for SyntheticFactory {
    fn create(&self, _id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
        Ok(Box::new(SyntheticDataplane::default()))
    }
}


// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerCommand {
    /// Replace the worker's configuration slice.
    Reconfigure(Arc<Container>),
    Stop,
}


#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub breath_interval: Duration,
    pub publish_interval: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        WorkerTiming {
            breath_interval: Duration::from_millis(10),
            publish_interval: Duration::from_millis(100),
        }
    }
}


/// Shared slots a worker writes and the manager reads.
#[derive(Clone)]
pub struct WorkerSlots {
    pub state: Arc<Mutex<InstanceState>>,
    pub counters: Arc<Mutex<CounterSet>>,
}

impl WorkerSlots {
    pub fn new() -> Self {
        WorkerSlots {
            state: Arc::new(Mutex::new(InstanceState::Starting)),
            counters: Arc::new(Mutex::new(CounterSet::zeroed())),
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_state(&self, state: InstanceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn counters(&self) -> CounterSet {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, local: &CounterSet) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = local.clone();
    }

    fn fail(&self, id: &InstanceId, e: &ConfigError) {
        error!(instance = %id, error = %e, "worker failed");
        self.set_state(InstanceState::Failed(e.to_string()));
    }
}

impl Default for WorkerSlots {
    fn default() -> Self {
        WorkerSlots::new()
    }
}


fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}


/// Worker thread body. Returns when told to stop, when the manager drops
/// the control channel, or when the data plane fails.
pub fn run(
    id: InstanceId,
    mut dataplane: Box<dyn Dataplane>,
    slice: Arc<Container>,
    control: Receiver<WorkerCommand>,
    slots: WorkerSlots,
    timing: WorkerTiming,
) {
    let mut local = CounterSet::zeroed();
    if let Err(e) = dataplane.configure(&slice) {
        slots.fail(&id, &e);
        return;
    }
    local.set("discontinuity-time", unix_seconds());
    slots.publish(&local);
    {
        let mut state = slots.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InstanceState::Starting {
            *state = InstanceState::Running;
        }
    }
    info!(instance = %id, "worker running");

    let mut last_publish = Instant::now();
    loop {
        match control.recv_timeout(timing.breath_interval) {
            Ok(WorkerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(WorkerCommand::Reconfigure(slice)) => {
                debug!(instance = %id, "reconfiguring");
                if let Err(e) = dataplane.configure(&slice) {
                    slots.fail(&id, &e);
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if let Err(e) = dataplane.breathe(&mut local) {
            slots.publish(&local);
            slots.fail(&id, &e);
            return;
        }
        if last_publish.elapsed() >= timing.publish_interval {
            slots.publish(&local);
            last_publish = Instant::now();
        }
    }

    slots.publish(&local);
    slots.set_state(InstanceState::Stopped);
    info!(instance = %id, "worker stopped");
}


/// Build an instance's configuration slice: the shared interface settings
/// with its queue's overrides laid over them, plus the binding table.
pub fn slice_for(config: &Container, queue: &Container) -> Container {
    let mut slice = Container::new();
    if let Some(name) = config.leaf("name") {
        slice.set_leaf("name", name.clone());
    }
    for iface in ["external-interface", "internal-interface"] {
        let mut merged = config.container(iface).cloned().unwrap_or_default();
        if let Some(over) = queue.container(iface) {
            overlay(&mut merged, over);
        }
        slice.insert(iface, Node::Container(merged));
    }
    if let Some(bt) = config.container("binding-table") {
        slice.insert("binding-table", Node::Container(bt.clone()));
    }
    slice
}


fn overlay(base: &mut Container, over: &Container) {
    for (name, node) in over.iter() {
        match node {
            Node::Container(inner) => overlay(base.container_mut(name), inner),
            other => {
                base.insert(name, other.clone());
            }
        }
    }
}
