//! # Device Monitor
//!
//! Keeps a modem session open across hot-plug events. The monitor is a two-state
//! machine:
//!
//! ```text
//!            open + init ok
//!  NoDevice ────────────────▶ Ready
//!     ▲  │                      │
//!     │  └─ recheck timer ◀─┐   │ link lost (read error / port gone)
//!     │     (open failed)   │   │
//!     └─────────────────────┴───┘
//! ```
//!
//! All transitions are serialized through one bounded channel consumed by
//! [`Monitor::run`]. Producers are the recheck timer, the session's link
//! watcher and [`MonitorHandle`] operations that hit an I/O failure. Each
//! session carries a generation number; a `LinkLost` from an older session is
//! ignored.
//!
//! Callers never drive transitions. They observe [`MonitorStatus`] and get
//! [`AtError::DeviceNotReady`] while no session is open.

mod watchers;

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ModemConfig;
use crate::metrics;
use crate::modem::{
    sms, AtError, AtResult, CommandEngine, DeviceOpener, DynEngine, EngineTiming, LinkStats,
    ListingReport, Transport,
};
use crate::storage::{PersistedMessage, SharedStore};
use watchers::{LinkWatcher, NotificationWatcher};

/// Command engine of an open session. Every AT exchange holds the lock for its
/// whole duration.
pub type SharedEngine = Arc<Mutex<DynEngine>>;

/// Notifications a session buffers while the notification watcher is busy.
const NOTIFICATION_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub command_port: String,
    pub notify_port: String,
    pub baud_rate: u32,
    pub timing: EngineTiming,
    pub init_commands: Vec<String>,
    pub recheck_interval: Duration,
    pub presence_interval: Duration,
    pub transition_capacity: usize,
    pub delete_after_receive: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        ModemConfig::default().monitor_settings()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    NoDevice,
    Ready,
}

/// Published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub recheck_armed: bool,
    /// Generation of the current (or most recent) session. Zero before the
    /// first successful open.
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) enum Transition {
    RecheckDue,
    LinkLost { generation: u64, reason: String },
}

#[derive(Clone)]
struct SessionRef {
    generation: u64,
    engine: SharedEngine,
}

struct Session {
    generation: u64,
    engine: SharedEngine,
    stop: watch::Sender<bool>,
}

impl Session {
    fn close(self) {
        let _ = self.stop.send(true);
    }
}

/// Open the command port and run the init sequence. Any rejected command
/// fails the whole open.
pub async fn open_engine(
    settings: &MonitorSettings,
    opener: &dyn DeviceOpener,
) -> AtResult<DynEngine> {
    let port = opener.open(&settings.command_port, settings.baud_rate)?;
    let mut engine = CommandEngine::new(port, settings.timing);
    for command in &settings.init_commands {
        engine.execute(&format!("{command}\r\n")).await?;
    }
    Ok(engine)
}

/// Owns the device lifecycle. Construct, take a [`MonitorHandle`], then spawn
/// [`Monitor::run`].
pub struct Monitor {
    settings: MonitorSettings,
    opener: Arc<dyn DeviceOpener>,
    store: SharedStore,
    status_tx: watch::Sender<MonitorStatus>,
    session_tx: watch::Sender<Option<SessionRef>>,
    transitions_tx: mpsc::Sender<Transition>,
    transitions_rx: mpsc::Receiver<Transition>,
    session: Option<Session>,
    generation: u64,
    recheck: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(settings: MonitorSettings, opener: Arc<dyn DeviceOpener>, store: SharedStore) -> Self {
        let (status_tx, _) = watch::channel(MonitorStatus {
            state: MonitorState::NoDevice,
            recheck_armed: false,
            generation: 0,
        });
        let (session_tx, _) = watch::channel(None);
        let (transitions_tx, transitions_rx) = mpsc::channel(settings.transition_capacity.max(1));
        Self {
            settings,
            opener,
            store,
            status_tx,
            session_tx,
            transitions_tx,
            transitions_rx,
            session: None,
            generation: 0,
            recheck: None,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            status_rx: self.status_tx.subscribe(),
            session_rx: self.session_tx.subscribe(),
            transitions: self.transitions_tx.clone(),
            store: self.store.clone(),
        }
    }

    /// Try to open the device, then process transitions until `shutdown`
    /// becomes true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Device monitor starting on {} (notifications on {})",
            self.settings.command_port, self.settings.notify_port
        );
        self.try_open().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(transition) = self.transitions_rx.recv() => {
                    self.apply(transition).await;
                }
            }
        }

        info!("Device monitor shutting down");
        self.disarm_recheck();
        self.close_session();
        self.publish(MonitorState::NoDevice);
    }

    async fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::RecheckDue => {
                self.recheck = None;
                if self.session.is_some() {
                    debug!("Recheck fired while ready; ignoring");
                    return;
                }
                self.try_open().await;
            }
            Transition::LinkLost { generation, reason } => {
                let current = self.session.as_ref().map(|s| s.generation);
                if current != Some(generation) {
                    debug!(
                        "Ignoring stale link loss from session {} (current {:?}): {}",
                        generation, current, reason
                    );
                    return;
                }
                warn!("Modem link lost: {}", reason);
                metrics::inc_link_losses();
                self.close_session();
                self.arm_recheck();
                self.publish(MonitorState::NoDevice);
                info!("Waiting for device");
            }
        }
    }

    async fn try_open(&mut self) {
        match self.open_and_init().await {
            Ok((engine, notify)) => {
                self.generation += 1;
                metrics::inc_sessions_opened();
                self.start_session(engine, notify);
                self.disarm_recheck();
                self.publish(MonitorState::Ready);
                info!("Device connected (session {})", self.generation);
            }
            Err(e) => {
                metrics::inc_open_failures();
                warn!("Failed to open device: {}", e);
                self.arm_recheck();
                self.publish(MonitorState::NoDevice);
            }
        }
    }

    async fn open_and_init(&self) -> AtResult<(DynEngine, Box<dyn Transport>)> {
        let engine = open_engine(&self.settings, self.opener.as_ref()).await?;
        let notify = self
            .opener
            .open(&self.settings.notify_port, self.settings.baud_rate)?;
        Ok((engine, notify))
    }

    fn start_session(&mut self, engine: DynEngine, notify: Box<dyn Transport>) {
        let generation = self.generation;
        let engine: SharedEngine = Arc::new(Mutex::new(engine));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (note_tx, note_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let link = LinkWatcher {
            generation,
            notify,
            opener: self.opener.clone(),
            command_port: self.settings.command_port.clone(),
            poll_interval: self.settings.timing.poll_interval,
            presence_interval: self.settings.presence_interval,
            notifications: note_tx,
            transitions: self.transitions_tx.clone(),
            stop: stop_rx.clone(),
        };
        let notes = NotificationWatcher {
            generation,
            engine: engine.clone(),
            store: self.store.clone(),
            notifications: note_rx,
            transitions: self.transitions_tx.clone(),
            delete_after_receive: self.settings.delete_after_receive,
            stop: stop_rx,
        };
        tokio::spawn(link.run());
        tokio::spawn(notes.run());

        self.session_tx.send_replace(Some(SessionRef {
            generation,
            engine: engine.clone(),
        }));
        self.session = Some(Session {
            generation,
            engine,
            stop: stop_tx,
        });
    }

    fn close_session(&mut self) {
        self.session_tx.send_replace(None);
        if let Some(session) = self.session.take() {
            debug!(
                "Closing session {} ({} other engine holders)",
                session.generation,
                Arc::strong_count(&session.engine) - 1
            );
            session.close();
        }
    }

    fn arm_recheck(&mut self) {
        self.disarm_recheck();
        let tx = self.transitions_tx.clone();
        let delay = self.settings.recheck_interval;
        self.recheck = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Transition::RecheckDue).await;
        }));
    }

    fn disarm_recheck(&mut self) {
        if let Some(timer) = self.recheck.take() {
            timer.abort();
        }
    }

    fn publish(&self, state: MonitorState) {
        let status = MonitorStatus {
            state,
            recheck_armed: self.recheck.is_some(),
            generation: self.generation,
        };
        self.status_tx.send_replace(status);
        debug!("Monitor status {:?}; metrics {:?}", status, metrics::snapshot());
    }
}

/// Cloneable entry point for request handlers and the CLI.
#[derive(Clone)]
pub struct MonitorHandle {
    status_rx: watch::Receiver<MonitorStatus>,
    session_rx: watch::Receiver<Option<SessionRef>>,
    transitions: mpsc::Sender<Transition>,
    store: SharedStore,
}

impl MonitorHandle {
    pub fn status(&self) -> MonitorStatus {
        *self.status_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status().state == MonitorState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    /// Resolve with the first published status matching `pred`. If the
    /// monitor is gone, returns the last status seen.
    pub async fn wait_for<F>(&self, pred: F) -> MonitorStatus
    where
        F: Fn(&MonitorStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if pred(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    fn session(&self) -> AtResult<SessionRef> {
        self.session_rx
            .borrow()
            .clone()
            .ok_or(AtError::DeviceNotReady)
    }

    /// Pass `result` through, escalating link failures to the monitor.
    async fn observe<R>(&self, session: &SessionRef, result: AtResult<R>) -> AtResult<R> {
        if let Err(e) = &result {
            if e.is_link_failure() {
                warn!("Command port failure in session {}: {}", session.generation, e);
                let _ = self
                    .transitions
                    .send(Transition::LinkLost {
                        generation: session.generation,
                        reason: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    pub async fn stats(&self) -> AtResult<LinkStats> {
        let session = self.session()?;
        let result = {
            let mut engine = session.engine.lock().await;
            sms::link_stats(&mut *engine).await
        };
        self.observe(&session, result).await
    }

    pub async fn list_sms(&self, filter: &str) -> AtResult<ListingReport> {
        let session = self.session()?;
        let result = {
            let mut engine = session.engine.lock().await;
            sms::list_sms(&mut *engine, filter).await
        };
        self.observe(&session, result).await
    }

    pub async fn send_sms(&self, destination: &str, body: &str) -> AtResult<()> {
        let session = self.session()?;
        let result = {
            let mut engine = session.engine.lock().await;
            sms::send_sms(&mut *engine, destination, body).await
        };
        self.observe(&session, result).await
    }

    pub async fn delete_sms(&self, index: &str) -> AtResult<()> {
        let session = self.session()?;
        let result = {
            let mut engine = session.engine.lock().await;
            sms::delete_sms(&mut *engine, index).await
        };
        self.observe(&session, result).await
    }

    /// Inbox contents in arrival order. Available whatever the device state.
    pub async fn stored_messages(&self) -> Vec<PersistedMessage> {
        let mut store = self.store.lock().await;
        store.refresh();
        store.messages().to_vec()
    }

    pub async fn delete_stored(&self, id: &str) -> bool {
        self.store.lock().await.delete(id)
    }
}
