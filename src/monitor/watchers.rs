//! Per-session background tasks.
//!
//! The link watcher owns the notification port and is the only task that
//! decides a session is gone. The notification watcher turns indications into
//! stored messages using the session's command engine.

use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use super::{SharedEngine, Transition};
use crate::logutil::escape_log;
use crate::metrics;
use crate::modem::notify::LineSplitter;
use crate::modem::{sms, AtError, DeviceOpener, Notification, SmsRecord, Transport};
use crate::storage::{PersistedMessage, SharedStore};

pub(crate) struct LinkWatcher {
    pub generation: u64,
    pub notify: Box<dyn Transport>,
    pub opener: Arc<dyn DeviceOpener>,
    pub command_port: String,
    pub poll_interval: Duration,
    pub presence_interval: Duration,
    pub notifications: mpsc::Sender<Notification>,
    pub transitions: mpsc::Sender<Transition>,
    pub stop: watch::Receiver<bool>,
}

impl LinkWatcher {
    pub async fn run(mut self) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut presence = interval(self.presence_interval);
        presence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    debug!("Link watcher {} stopped", self.generation);
                    return;
                }
                _ = poll.tick() => {
                    loop {
                        match self.notify.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                for item in splitter.push(&buf[..n]) {
                                    match item {
                                        Ok(notification) => {
                                            let _ = self.notifications.send(notification).await;
                                        }
                                        Err(e) => warn!("Unparseable notification: {} ({})", e, escape_log(&e.raw)),
                                    }
                                }
                            }
                            Err(e) => {
                                self.lost(format!("notification port read failed: {e}")).await;
                                return;
                            }
                        }
                    }
                }
                _ = presence.tick() => {
                    if !self.opener.is_present(&self.command_port) {
                        self.lost(format!("{} disappeared", self.command_port)).await;
                        return;
                    }
                }
            }
        }
    }

    async fn lost(&mut self, reason: String) {
        let _ = self
            .transitions
            .send(Transition::LinkLost {
                generation: self.generation,
                reason,
            })
            .await;
    }
}

pub(crate) struct NotificationWatcher {
    pub generation: u64,
    pub engine: SharedEngine,
    pub store: SharedStore,
    pub notifications: mpsc::Receiver<Notification>,
    pub transitions: mpsc::Sender<Transition>,
    pub delete_after_receive: bool,
    pub stop: watch::Receiver<bool>,
}

impl NotificationWatcher {
    pub async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.stop.changed() => None,
                n = self.notifications.recv() => n,
            };
            let Some(notification) = next else {
                debug!("Notification watcher {} stopped", self.generation);
                return;
            };
            if let Err(e) = self.handle(notification).await {
                if e.is_link_failure() {
                    let _ = self
                        .transitions
                        .send(Transition::LinkLost {
                            generation: self.generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                warn!("Failed to fetch incoming SMS: {}", e);
            }
        }
    }

    async fn handle(&mut self, notification: Notification) -> Result<(), AtError> {
        match notification {
            Notification::NewMessage { storage, index } => {
                debug!("New message indication: {}@{}", index, storage);
                let record = {
                    let mut engine = self.engine.lock().await;
                    let record = sms::read_sms(&mut *engine, &index).await?;
                    if self.delete_after_receive {
                        if let Err(e) = sms::delete_sms(&mut *engine, &index).await {
                            if e.is_link_failure() {
                                return Err(e);
                            }
                            warn!("Could not remove SMS {} from modem: {}", index, e);
                        }
                    }
                    record
                };
                self.store_record(record).await;
            }
            Notification::Delivered(record) => self.store_record(record).await,
            Notification::SignalQuality(rssi) => debug!("Signal quality: {}", rssi),
            Notification::Registration(line) => info!("Registration: {}", line),
            Notification::Other(line) => trace!("Unsolicited: {}", escape_log(&line)),
        }
        Ok(())
    }

    async fn store_record(&self, record: SmsRecord) {
        info!("Received an SMS from {}", crate::logutil::mask_number(&record.sender));
        let message = PersistedMessage::new(record);
        self.store.lock().await.append(message);
        metrics::inc_messages_received();
    }
}
