//! Instance manager: one worker thread per configured `(device, queue)`.
//!
//! The manager keeps an explicit registry of workers and drives it toward
//! the set of device/queue entries in the committed configuration. It is
//! consulted by the config store before every commit (see
//! [`CommitListener`]); a refusal rolls the commit back.
//!
//! Workers start and stop asynchronously. `reconcile` only requests the
//! transition; the live set converges within the convergence window.

pub mod worker;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::data::{ConfigTree, Container, Value};
use crate::error::{ConfigError, Result};
use crate::state::{CounterSet, CounterSource};
use crate::store::CommitListener;

pub use worker::{
    Dataplane, DataplaneFactory, SyntheticDataplane, SyntheticFactory, WorkerCommand, WorkerSlots,
    WorkerTiming,
};


// ---------------------------------------------------------------------------
// Identity and lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId {
    pub device: String,
    pub queue: u8,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.queue)
    }
}


/// Lifecycle of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Thread spawned, data plane not yet configured.
    Starting,
    /// Breathing and publishing counters.
    Running,
    /// Stop requested, thread still winding down.
    Stopping,
    /// Thread has exited cleanly.
    Stopped,
    /// The data plane reported an error or the thread died; the worker is
    /// gone.
    Failed(String),
}

impl InstanceState {
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }
}


fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}


struct Handle {
    slots: WorkerSlots,
    control: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
    slice: Arc<Container>,
}

impl Handle {
    fn request_stop(&self, id: &InstanceId) {
        {
            let mut state = self.slots.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_live() {
                *state = InstanceState::Stopping;
            }
        }
        if self.control.send(WorkerCommand::Stop).is_err() {
            warn!(instance = %id, "stop not delivered; worker already exited");
        }
    }

    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Join an exited thread. Returns the panic message if it panicked.
    fn join(&mut self, id: &InstanceId) -> Option<String> {
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(()) => None,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(instance = %id, panic = %message, "worker thread panicked");
                Some(message)
            }
        }
    }

    /// A thread that exited while its state still says live died without
    /// reporting; record it as failed.
    fn detect_crash(&mut self, id: &InstanceId) {
        if self.thread.is_none() || !self.is_finished() || !self.slots.state().is_live() {
            return;
        }
        let reason = match self.join(id) {
            Some(message) => format!("worker panicked: {}", message),
            None => "worker thread exited unexpectedly".to_string(),
        };
        error!(instance = %id, reason = %reason, "worker died");
        self.slots.set_state(InstanceState::Failed(reason));
    }
}


#[derive(Default)]
struct Registry {
    live: BTreeMap<InstanceId, Handle>,
    retiring: Vec<(InstanceId, Handle)>,
}

impl Registry {
    /// Join retired workers whose threads have exited, and mark configured
    /// workers whose threads died as failed.
    fn reap(&mut self) {
        for (id, handle) in self.live.iter_mut() {
            handle.detect_crash(id);
        }
        let mut still = Vec::new();
        for (id, mut handle) in self.retiring.drain(..) {
            if handle.is_finished() {
                handle.join(&id);
                info!(instance = %id, "worker reaped");
            } else {
                still.push((id, handle));
            }
        }
        self.retiring = still;
    }
}


/// Outcome of [`InstanceManager::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<InstanceId>,
    /// Workers still running when the grace period ran out; detached.
    pub stragglers: Vec<InstanceId>,
    /// Workers that exited by panicking, with the panic message.
    pub panicked: Vec<(InstanceId, String)>,
}

impl ShutdownReport {
    /// True when some worker did not stop cleanly.
    pub fn is_abnormal(&self) -> bool {
        !self.stragglers.is_empty() || !self.panicked.is_empty()
    }
}


// ---------------------------------------------------------------------------
// Slices
// ---------------------------------------------------------------------------

/// Every configured instance with its configuration slice.
pub fn slices(tree: &ConfigTree) -> Result<BTreeMap<InstanceId, Arc<Container>>> {
    let mut out = BTreeMap::new();
    let config = match tree.container("softwire-config") {
        Some(c) => c,
        None => return Ok(out),
    };
    let instances = match config.list("instance") {
        Some(l) => l,
        None => return Ok(out),
    };
    for (_, entry) in instances.iter() {
        let device = match entry.leaf("device") {
            Some(Value::Str(d)) => d.clone(),
            _ => continue,
        };
        let queues = match entry.list("queue") {
            Some(q) => q,
            None => continue,
        };
        for (_, queue) in queues.iter() {
            let qid = queue.leaf("id").and_then(Value::as_uint).unwrap_or(0);
            let queue_id = u8::try_from(qid).map_err(|_| ConfigError::InstanceTransitionFailed {
                instance: format!("{}/{}", device, qid),
                reason: "queue id out of range".into(),
            })?;
            let id = InstanceId {
                device: device.clone(),
                queue: queue_id,
            };
            out.insert(id, Arc::new(worker::slice_for(config, queue)));
        }
    }
    Ok(out)
}


// ---------------------------------------------------------------------------
// InstanceManager
// ---------------------------------------------------------------------------

pub struct InstanceManager {
    registry: Mutex<Registry>,
    factory: Arc<dyn DataplaneFactory>,
    timing: WorkerTiming,
}

impl InstanceManager {
    pub fn new(factory: Arc<dyn DataplaneFactory>, timing: WorkerTiming) -> Self {
        InstanceManager {
            registry: Mutex::new(Registry::default()),
            factory,
            timing,
        }
    }

    /// A manager backed by the synthetic data plane.
    pub fn synthetic(timing: WorkerTiming) -> Self {
        InstanceManager::new(Arc::new(SyntheticFactory), timing)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, id: &InstanceId, slice: Arc<Container>) -> Result<Handle> {
        let failed = |reason: String| ConfigError::InstanceTransitionFailed {
            instance: id.to_string(),
            reason,
        };
        let dataplane = self
            .factory
            .create(id, &slice)
            .map_err(|e| failed(e.to_string()))?;
        let (tx, rx) = mpsc::channel();
        let slots = WorkerSlots::new();
        let worker_slots = slots.clone();
        let worker_id = id.clone();
        let worker_slice = slice.clone();
        let timing = self.timing;
        let thread = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || worker::run(worker_id, dataplane, worker_slice, rx, worker_slots, timing))
            .map_err(|e| failed(e.to_string()))?;
        info!(instance = %id, "worker started");
        Ok(Handle {
            slots,
            control: tx,
            thread: Some(thread),
            slice,
        })
    }

    /// Drive the registry toward the instances configured in `tree`.
    ///
    /// New entries are started pre-loaded with their slice, changed slices
    /// are pushed to their worker and removed entries are asked to stop. If
    /// any start fails, workers started by this call are stopped again and
    /// the rest of the registry is left as it was.
    pub fn reconcile(&self, tree: &ConfigTree) -> Result<()> {
        let desired = slices(tree)?;
        let mut reg = self.registry();
        reg.reap();

        let mut started = Vec::new();
        for (id, slice) in &desired {
            if reg.live.contains_key(id) {
                continue;
            }
            match self.spawn(id, slice.clone()) {
                Ok(handle) => started.push((id.clone(), handle)),
                Err(e) => {
                    warn!(instance = %id, error = %e, "start failed; undoing this transition");
                    for (sid, handle) in started {
                        handle.request_stop(&sid);
                        reg.retiring.push((sid, handle));
                    }
                    return Err(e);
                }
            }
        }

        let removed: Vec<InstanceId> = reg
            .live
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = reg.live.remove(&id) {
                info!(instance = %id, "stop requested");
                handle.request_stop(&id);
                reg.retiring.push((id, handle));
            }
        }

        for (id, handle) in reg.live.iter_mut() {
            if let Some(slice) = desired.get(id) {
                if *slice != handle.slice {
                    if handle.control.send(WorkerCommand::Reconfigure(slice.clone())).is_err() {
                        warn!(instance = %id, "reconfigure not delivered; worker already exited");
                    }
                    handle.slice = slice.clone();
                }
            }
        }

        for (id, handle) in started {
            reg.live.insert(id, handle);
        }
        Ok(())
    }

    /// Number of configured workers that are starting or running.
    pub fn live_count(&self) -> usize {
        self.registry()
            .live
            .values()
            .filter(|h| h.slots.state().is_live())
            .count()
    }

    pub fn states(&self) -> Vec<(InstanceId, InstanceState)> {
        let mut reg = self.registry();
        reg.reap();
        reg.live
            .iter()
            .map(|(id, h)| (id.clone(), h.slots.state()))
            .collect()
    }

    /// Poll until exactly `expected` workers are live and every retired
    /// worker has exited, or `window` elapses.
    pub fn wait_converged(&self, expected: usize, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            let done = {
                let mut reg = self.registry();
                reg.reap();
                reg.retiring.is_empty()
                    && reg.live.values().filter(|h| h.slots.state() == InstanceState::Running).count()
                        == expected
            };
            if done {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// A configured worker that has failed, if any. The registry can no
    /// longer match the configuration, so callers treat this as fatal.
    pub fn inconsistency(&self) -> Option<String> {
        let mut reg = self.registry();
        reg.reap();
        reg.live.iter().find_map(|(id, h)| match h.slots.state() {
            InstanceState::Failed(reason) => Some(format!("instance {} failed: {}", id, reason)),
            _ => None,
        })
    }

    /// Stop every worker, waiting up to `grace` for them to exit.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut handles: Vec<(InstanceId, Handle)> = {
            let mut reg = self.registry();
            let mut all: Vec<(InstanceId, Handle)> = std::mem::take(&mut reg.live).into_iter().collect();
            all.append(&mut reg.retiring);
            all
        };
        for (id, handle) in &handles {
            handle.request_stop(id);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !handles.iter().all(|(_, h)| h.is_finished()) {
            thread::sleep(Duration::from_millis(5));
        }

        let mut report = ShutdownReport::default();
        for (id, handle) in handles.iter_mut() {
            if handle.is_finished() {
                if let Some(message) = handle.join(id) {
                    report.panicked.push((id.clone(), message));
                }
                report.stopped.push(id.clone());
            } else {
                warn!(instance = %id, "worker did not stop within the grace period; detaching");
                report.stragglers.push(id.clone());
            }
        }
        info!(
            stopped = report.stopped.len(),
            stragglers = report.stragglers.len(),
            panicked = report.panicked.len(),
            "instances shut down"
        );
        report
    }
}


impl CommitListener for InstanceManager {
    fn on_commit(&self, _old: &ConfigTree, new: &ConfigTree) -> Result<()> {
        self.reconcile(new)
    }
}


impl CounterSource for InstanceManager {
    fn counters(&self) -> Vec<(InstanceId, CounterSet)> {
        self.registry()
            .live
            .iter()
            .map(|(id, h)| (id.clone(), h.slots.counters()))
            .collect()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_tree;
    use crate::state::aggregate;
    use crate::store::ConfigStore;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn fast() -> WorkerTiming {
        WorkerTiming {
            breath_interval: Duration::from_millis(2),
            publish_interval: Duration::from_millis(2),
        }
    }

    fn managed_store() -> (ConfigStore, Arc<InstanceManager>) {
        let store = ConfigStore::new(sample_tree());
        let manager = Arc::new(InstanceManager::synthetic(fast()));
        manager.reconcile(&store.snapshot()).unwrap();
        store.set_listener(manager.clone());
        (store, manager)
    }

    #[test]
    fn initial_reconcile_starts_configured_workers() {
        let (_store, manager) = managed_store();
        assert!(manager.wait_converged(1, WINDOW));
        manager.shutdown(WINDOW);
    }

    #[test]
    fn adding_queues_adds_workers_and_removing_one_decrements() {
        let (store, manager) = managed_store();
        let queues = "/softwire-config/instance[device=00:05.0]/queue";
        store.add(queues, "{ id 1; }").unwrap();
        store.add(queues, "{ id 2; }").unwrap();
        store.add("/softwire-config/instance", "{ device 00:06.0; queue { id 0; } }").unwrap();
        assert!(manager.wait_converged(4, WINDOW));

        store.remove(&format!("{}[id=1]", queues)).unwrap();
        assert!(manager.wait_converged(3, WINDOW));
        let ids: Vec<String> = manager.states().iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, ["00:05.0/0", "00:05.0/2", "00:06.0/0"]);
        manager.shutdown(WINDOW);
    }

    #[test]
    fn changed_slice_reconfigures_running_worker() {
        let (store, manager) = managed_store();
        assert!(manager.wait_converged(1, WINDOW));
        store.remove("/softwire-config/binding-table/softwire[ipv4=178.79.150.233][psid=7850]").unwrap();
        let reg = manager.registry();
        let handle = reg.live.values().next().unwrap();
        assert_eq!(
            handle
                .slice
                .descend(&["binding-table"])
                .unwrap()
                .list("softwire")
                .unwrap()
                .len(),
            3
        );
        drop(reg);
        manager.shutdown(WINDOW);
    }

    struct RefuseDevice(&'static str);

    impl DataplaneFactory for RefuseDevice {
        fn create(&self, id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
            if id.device == self.0 {
                Err(ConfigError::Io(format!("no such device {}", id.device)))
            } else {
                Ok(Box::new(SyntheticDataplane::default()))
            }
        }
    }

    #[test]
    fn spawn_failure_rolls_back_the_commit() {
        let store = ConfigStore::new(sample_tree());
        let manager = Arc::new(InstanceManager::new(Arc::new(RefuseDevice("bad")), fast()));
        manager.reconcile(&store.snapshot()).unwrap();
        store.set_listener(manager.clone());

        let err = store
            .add("/softwire-config/instance", "{ device bad; queue { id 0; } }")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InstanceTransitionFailed { .. }));
        assert!(store.get("/softwire-config/instance[device=bad]").is_err());
        assert!(manager.wait_converged(1, WINDOW));
        manager.shutdown(WINDOW);
    }

    #[test]
    fn aggregate_of_published_snapshots_matches_parts() {
        let (_store, manager) = managed_store();
        assert!(manager.wait_converged(1, WINDOW));
        thread::sleep(Duration::from_millis(20));
        let parts = manager.counters();
        let total = aggregate(parts.iter().map(|(_, c)| c));
        let sum: u64 = parts.iter().map(|(_, c)| c.get("in-ipv4-packets")).sum();
        assert_eq!(total.get("in-ipv4-packets"), sum);
        assert!(sum > 0);
        manager.shutdown(WINDOW);
    }

    struct FailAfterStart;

    impl Dataplane for FailAfterStart {
        fn configure(&mut self, _slice: &Container) -> Result<()> {
            Ok(())
        }
        fn breathe(&mut self, _counters: &mut CounterSet) -> Result<()> {
            Err(ConfigError::Io("nic reset".into()))
        }
    }

    struct FailingFactory;

    impl DataplaneFactory for FailingFactory {
        fn create(&self, _id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
            Ok(Box::new(FailAfterStart))
        }
    }

    #[test]
    fn failed_worker_is_reported_as_inconsistency() {
        let manager = InstanceManager::new(Arc::new(FailingFactory), fast());
        manager.reconcile(&sample_tree()).unwrap();
        let deadline = Instant::now() + WINDOW;
        let mut report = None;
        while report.is_none() && Instant::now() < deadline {
            report = manager.inconsistency();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(report.unwrap().contains("nic reset"));
        manager.shutdown(WINDOW);
    }

    struct Panicking;

    impl Dataplane for Panicking {
        fn configure(&mut self, _slice: &Container) -> Result<()> {
            Ok(())
        }
        fn breathe(&mut self, _counters: &mut CounterSet) -> Result<()> {
            panic!("ring buffer corrupted");
        }
    }

    struct PanickingFactory;

    impl DataplaneFactory for PanickingFactory {
        fn create(&self, _id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
            Ok(Box::new(Panicking))
        }
    }

    #[test]
    fn panicked_worker_is_failed_not_running() {
        let manager = InstanceManager::new(Arc::new(PanickingFactory), fast());
        manager.reconcile(&sample_tree()).unwrap();
        let deadline = Instant::now() + WINDOW;
        let mut report = None;
        while report.is_none() && Instant::now() < deadline {
            report = manager.inconsistency();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(report.unwrap().contains("ring buffer corrupted"));
        let states = manager.states();
        assert_eq!(states.len(), 1);
        assert!(matches!(states[0].1, InstanceState::Failed(_)));
        assert_eq!(manager.live_count(), 0);
        assert!(!manager.wait_converged(1, Duration::from_millis(50)));
        let report = manager.shutdown(WINDOW);
        assert!(report.stragglers.is_empty());
    }

    struct PanicOnReconfigure;

    impl Dataplane for PanicOnReconfigure {
        fn configure(&mut self, slice: &Container) -> Result<()> {
            if slice.leaf("name").is_none() {
                panic!("configured without a name");
            }
            Ok(())
        }
        fn breathe(&mut self, _counters: &mut CounterSet) -> Result<()> {
            Ok(())
        }
    }

    struct PanicOnReconfigureFactory;

    impl DataplaneFactory for PanicOnReconfigureFactory {
        fn create(&self, _id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
            Ok(Box::new(PanicOnReconfigure))
        }
    }

    #[test]
    fn shutdown_reports_panicked_workers() {
        let store = ConfigStore::new(sample_tree());
        let manager = Arc::new(InstanceManager::new(Arc::new(PanicOnReconfigureFactory), fast()));
        manager.reconcile(&store.snapshot()).unwrap();
        store.set_listener(manager.clone());
        assert!(manager.wait_converged(1, WINDOW));
        store.remove("/softwire-config/name").unwrap();
        thread::sleep(Duration::from_millis(50));
        let report = manager.shutdown(WINDOW);
        assert_eq!(report.panicked.len(), 1);
        assert!(report.panicked[0].1.contains("configured without a name"));
        assert!(report.is_abnormal());
    }

    struct Stubborn;

    impl Dataplane for Stubborn {
        fn configure(&mut self, _slice: &Container) -> Result<()> {
            Ok(())
        }
        fn breathe(&mut self, _counters: &mut CounterSet) -> Result<()> {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    struct StubbornFactory;

    impl DataplaneFactory for StubbornFactory {
        fn create(&self, _id: &InstanceId, _slice: &Container) -> Result<Box<dyn Dataplane>> {
            Ok(Box::new(Stubborn))
        }
    }

    #[test]
    fn shutdown_reports_stragglers() {
        let manager = InstanceManager::new(Arc::new(StubbornFactory), fast());
        manager.reconcile(&sample_tree()).unwrap();
        thread::sleep(Duration::from_millis(20));
        let report = manager.shutdown(Duration::from_millis(10));
        assert_eq!(report.stragglers.len(), 1);
        assert!(report.stopped.is_empty());
    }

    #[test]
    fn slices_enumerate_device_queues() {
        let all = slices(&sample_tree()).unwrap();
        let ids: Vec<String> = all.keys().map(|id| id.to_string()).collect();
        assert_eq!(ids, ["00:05.0/0"]);
    }
}
