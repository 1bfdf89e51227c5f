//! Daemon: the leader's main loop.
//!
//! The main thread owns the control socket and the worker registry. Session
//! threads talk to the shared store directly; everything that must stop or
//! escalate the daemon flows through an mpsc channel the main loop drains.
//!
//! # Main loop tick
//!
//! 1. Drain channel; a `Shutdown` or `Fatal` event ends the loop
//! 2. Check for SIGINT/SIGTERM
//! 3. Accept socket connections (non-blocking with timeout)
//! 4. Join finished session threads
//! 5. Escalate a worker set that no longer matches the configuration

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::instance::{self, DataplaneFactory, InstanceManager, ShutdownReport};
use crate::rundir::{Registration, RunDir};
use crate::service::{ServiceSocket, SessionOptions};
use crate::settings::DaemonSettings;
use crate::state::StateAggregator;
use crate::store::ConfigStore;


// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to a flag the main loop polls.
pub fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn take_signal() -> bool {
    SIGNALLED.swap(false, Ordering::SeqCst)
}


// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug)]
pub enum DaemonEvent {
    /// Request the daemon to shut down gracefully.
    Shutdown,
    /// Stop the daemon and report `reason` as a fatal error.
    Fatal { reason: String },
}


/// Handle returned from `Daemon::handle()` allowing threads to send events.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
}


impl DaemonHandle {
    /// Request daemon shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.send(DaemonEvent::Shutdown)
    }

    pub fn fatal(&self, reason: &str) -> Result<()> {
        self.send(DaemonEvent::Fatal {
            reason: reason.to_string(),
        })
    }

    fn send(&self, event: DaemonEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| ConfigError::Io(format!("daemon channel send failed: {}", e)))
    }
}


/// Why the main loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    Requested,
    Fatal(String),
}


/// What `Daemon::run` returns once everything is torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonExit {
    pub report: ShutdownReport,
    /// Set when the daemon stopped because of an unrecoverable condition.
    pub fatal: Option<String>,
}


// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The leader: owns the store, the worker registry and the control socket.
pub struct Daemon {
    settings: DaemonSettings,
    store: Arc<ConfigStore>,
    manager: Arc<InstanceManager>,
    dispatcher: Arc<Dispatcher>,
    service: ServiceSocket,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
    sessions: Vec<JoinHandle<()>>,
    stop_sessions: Arc<AtomicBool>,
    // Dropped last: removes the run directory once the socket is gone.
    registration: Registration,
}


impl Daemon {
    /// Load the configuration, start its workers, and bind the control
    /// socket under `settings.run_dir`.
    pub fn start(
        settings: DaemonSettings,
        config_text: &str,
        factory: Arc<dyn DataplaneFactory>,
    ) -> Result<Daemon> {
        let store = Arc::new(ConfigStore::from_text(config_text)?);
        let manager = Arc::new(InstanceManager::new(factory, settings.timing()));

        let initial = store.snapshot();
        let expected = instance::slices(&initial)?.len();
        manager.reconcile(&initial)?;
        store.set_listener(manager.clone());
        if !manager.wait_converged(expected, settings.convergence_window()) {
            warn!(
                expected,
                live = manager.live_count(),
                "workers did not converge within the window"
            );
        }

        let aggregator = Arc::new(StateAggregator::new(manager.clone()));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), aggregator));

        let registration =
            RunDir::new(&settings.run_dir).register(std::process::id(), settings.name.as_deref())?;
        let service = ServiceSocket::bind(registration.socket())?;
        let (sender, receiver) = mpsc::channel();

        info!(
            socket = %service.path().display(),
            instances = expected,
            "leader started"
        );
        Ok(Daemon {
            settings,
            store,
            manager,
            dispatcher,
            service,
            receiver,
            handle: DaemonHandle { sender },
            sessions: Vec::new(),
            stop_sessions: Arc::new(AtomicBool::new(false)),
            registration,
        })
    }

    /// Get a handle for sending events to this daemon.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn socket_path(&self) -> &Path {
        self.service.path()
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Run the main event loop until shutdown or a fatal condition, then
    /// tear everything down.
    pub fn run(mut self) -> DaemonExit {
        let stop = loop {
            if let Some(stop) = self.tick() {
                break stop;
            }
        };
        self.teardown(stop)
    }

    /// Run exactly one tick of the main loop.
    fn tick(&mut self) -> Option<Stop> {
        if let Some(stop) = self.drain_channel() {
            return Some(stop);
        }

        if take_signal() {
            info!("signal received; shutting down");
            return Some(Stop::Requested);
        }

        let options = SessionOptions {
            poll: Duration::from_millis(self.settings.socket_poll_ms.clamp(1, 20)),
            request_timeout: self.settings.request_timeout(),
        };
        match self.service.accept_nonblocking(
            &self.dispatcher,
            options,
            &self.stop_sessions,
            Duration::from_millis(self.settings.socket_poll_ms),
        ) {
            Ok(spawned) => self.sessions.extend(spawned),
            Err(e) => warn!(error = %e, "socket error"),
        }

        self.reap_sessions();

        if let Some(reason) = self.manager.inconsistency() {
            error!(%reason, "worker set no longer matches configuration");
            return Some(Stop::Fatal(reason));
        }
        None
    }

    /// Check the channel for a pending stop request.
    fn drain_channel(&self) -> Option<Stop> {
        match self.receiver.try_recv() {
            Ok(DaemonEvent::Shutdown) => Some(Stop::Requested),
            Ok(DaemonEvent::Fatal { reason }) => Some(Stop::Fatal(reason)),
            Err(mpsc::TryRecvError::Empty) => None,
            // The daemon holds a sender itself, so this cannot happen.
            Err(mpsc::TryRecvError::Disconnected) => Some(Stop::Requested),
        }
    }

    fn reap_sessions(&mut self) {
        let (done, live): (Vec<_>, Vec<_>) =
            self.sessions.drain(..).partition(|h| h.is_finished());
        self.sessions = live;
        for handle in done {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }
    }

    fn teardown(mut self, stop: Stop) -> DaemonExit {
        self.service.cleanup();
        self.stop_sessions.store(true, Ordering::SeqCst);
        for handle in self.sessions.drain(..) {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }

        let report = self.manager.shutdown(self.settings.shutdown_grace());
        if !report.stragglers.is_empty() {
            warn!(
                stragglers = ?report.stragglers.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                "abnormal shutdown: workers detached"
            );
        }
        if !report.panicked.is_empty() {
            warn!(
                panicked = ?report.panicked.iter().map(|(i, _)| i.to_string()).collect::<Vec<_>>(),
                "abnormal shutdown: workers panicked"
            );
        }
        let fatal = match stop {
            Stop::Requested => None,
            Stop::Fatal(reason) => Some(reason),
        };
        info!(
            dir = %self.registration.dir().display(),
            fatal = fatal.is_some(),
            "leader stopped"
        );
        DaemonExit { report, fatal }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
