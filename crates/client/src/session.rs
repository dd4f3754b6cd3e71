use std::sync::Arc;

use tandem_core::{Cursor, SettingId, SettingValue, SettingsRegistry, SyncConfig, User};
use tandem_engine::{PreviewRequest, PublishReport};

use crate::error::{ClientError, TransportError};
use crate::events::{ClientEvent, EventBus, SubscriptionId};
use crate::machine::{EditOutcome, Phase, SyncMachine};
use crate::transport::SyncTransport;

/// Drives a [`SyncMachine`] against a transport: debounced preview sends,
/// periodic heartbeat pulls, lock expiry, publishing and reconnects.
///
/// Single-threaded. The host calls [`ClientSession::tick`] from its timer
/// with the current time.
pub struct ClientSession<T> {
    transport: T,
    machine: SyncMachine,
    config: SyncConfig,
    bus: EventBus,
    user: Option<User>,
    cursor: Option<Cursor>,
    next_heartbeat_ms: Option<u64>,
    /// Set when a request went unanswered. The next request reconnects
    /// first so the cursor skips whatever happened during the outage.
    link_down: bool,
}

impl<T: SyncTransport> ClientSession<T> {
    pub fn new(mut transport: T, registry: Arc<dyn SettingsRegistry>, config: SyncConfig) -> Self {
        transport.configure(&config);
        Self {
            machine: SyncMachine::new(registry, &config),
            transport,
            config,
            bus: EventBus::new(),
            user: None,
            cursor: None,
            next_heartbeat_ms: None,
            link_down: false,
        }
    }

    pub fn seed(&mut self, committed: impl IntoIterator<Item = (SettingId, SettingValue)>) {
        for (setting_id, value) in committed {
            self.machine.seed(setting_id, value);
        }
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&ClientEvent) + 'static) -> SubscriptionId {
        self.bus.subscribe(subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn machine(&self) -> &SyncMachine {
        &self.machine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self, setting_id: &SettingId) -> Phase {
        self.machine.phase(setting_id)
    }

    pub fn displayed(&self, setting_id: &SettingId) -> Option<&SettingValue> {
        self.machine.displayed(setting_id)
    }

    pub fn next_heartbeat_ms(&self) -> Option<u64> {
        self.next_heartbeat_ms
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down
    }

    /// Start (or restart) the session. The cursor jumps to the store's
    /// current head: changes made while disconnected are not replayed,
    /// only drafts still inside the lock window are delivered.
    pub fn connect(&mut self, now_ms: u64) -> Result<(), ClientError> {
        let boot = match self.transport.connect() {
            Ok(boot) => boot,
            Err(err) => {
                self.note_failure(&err);
                return Err(err.into());
            }
        };
        self.link_down = false;
        self.config = boot.config;
        self.machine.configure(&self.config);
        self.transport.configure(&self.config);
        self.cursor = Some(boot.cursor);
        self.next_heartbeat_ms = Some(now_ms.saturating_add(self.config.heartbeat_interval_ms()));

        tracing::info!(
            user = %boot.user.id,
            generation = %boot.cursor.generation,
            active = boot.active_previews.len(),
            "session connected"
        );
        self.user = Some(boot.user);
        self.bus.publish(&ClientEvent::CursorReset {
            cursor: boot.cursor,
        });
        self.machine.apply_remote(boot.active_previews, now_ms);
        self.dispatch_events();
        Ok(())
    }

    pub fn edit(&mut self, setting_id: SettingId, value: SettingValue, now_ms: u64) -> EditOutcome {
        let outcome = self.machine.edit(setting_id, value, now_ms);
        self.dispatch_events();
        outcome
    }

    /// Run everything that is due at `now_ms`: lock expiry, the debounced
    /// send, and the heartbeat.
    pub fn tick(&mut self, now_ms: u64) -> Result<(), ClientError> {
        self.machine.expire_locks(now_ms);
        self.dispatch_events();

        if let Some(batch) = self.machine.take_due(now_ms) {
            self.send_batch(batch, now_ms)?;
        }
        if self.next_heartbeat_ms.is_some_and(|due| now_ms >= due) {
            self.heartbeat(now_ms)?;
        }
        Ok(())
    }

    /// Send queued edits now instead of waiting for the debounce deadline.
    pub fn flush(&mut self, now_ms: u64) -> Result<(), ClientError> {
        match self.machine.take_all() {
            Some(batch) => self.send_batch(batch, now_ms),
            None => Ok(()),
        }
    }

    fn send_batch(&mut self, batch: Vec<PreviewRequest>, now_ms: u64) -> Result<(), ClientError> {
        let cursor = match self.live_cursor(now_ms) {
            Ok(cursor) => cursor,
            Err(ClientError::Transport(err)) if err.is_retryable() => {
                tracing::warn!(error = %err, settings = batch.len(), "still disconnected; will retry");
                self.machine.requeue(batch, now_ms);
                self.report_send_failure(&err, true);
                self.dispatch_events();
                return Ok(());
            }
            Err(err) => {
                self.machine.requeue(batch, now_ms);
                self.dispatch_events();
                return Err(err);
            }
        };

        let result = self.transport.submit_previews(&cursor, &batch);
        let outcome = match result {
            Ok(outcomes) => {
                self.machine.apply_preview_outcomes(outcomes, &batch, now_ms);
                Ok(())
            }
            Err(err) if err.is_stale_cursor() => {
                self.machine.requeue(batch, now_ms);
                self.reconnect(now_ms)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, settings = batch.len(), "preview send failed; will retry");
                self.note_failure(&err);
                self.machine.requeue(batch, now_ms);
                self.report_send_failure(&err, true);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "preview send refused");
                self.machine.abandon(&batch);
                self.report_send_failure(&err, false);
                Err(err.into())
            }
        };
        self.dispatch_events();
        outcome
    }

    /// Pull until caught up and apply every foreign record.
    pub fn heartbeat(&mut self, now_ms: u64) -> Result<(), ClientError> {
        self.next_heartbeat_ms = Some(now_ms.saturating_add(self.config.heartbeat_interval_ms()));
        let mut cursor = match self.live_cursor(now_ms) {
            Ok(cursor) => cursor,
            Err(ClientError::Transport(err)) if err.is_retryable() => {
                tracing::warn!(error = %err, "still disconnected; retrying next interval");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        loop {
            let pull = match self.transport.pull(&cursor) {
                Ok(pull) => pull,
                Err(err) if err.is_stale_cursor() => return self.reconnect(now_ms),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(error = %err, "heartbeat failed; retrying next interval");
                    self.note_failure(&err);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            tracing::debug!(updates = pull.updates.len(), has_more = pull.has_more, "heartbeat");
            self.machine.apply_remote(pull.updates, now_ms);
            let advanced = cursor.advance_to(&pull.next_cursor);
            self.cursor = Some(cursor);
            self.dispatch_events();

            if !pull.has_more || !advanced {
                return Ok(());
            }
        }
    }

    /// Publish every unsaved edit as one batch.
    pub fn publish(&mut self, now_ms: u64) -> Result<PublishReport, ClientError> {
        let blockers = self.machine.publish_blockers();
        if !blockers.is_empty() {
            return Err(ClientError::PublishBlocked(blockers));
        }
        let values = self.machine.publish_values();
        if values.is_empty() {
            return Err(ClientError::NothingToPublish);
        }
        let cursor = self.live_cursor(now_ms)?;
        let overrides = self.machine.publish_overrides();

        match self.transport.publish_all(&cursor, &values, &overrides) {
            Ok(report) => {
                tracing::info!(
                    committed = report.committed,
                    settings = values.len(),
                    "publish answered"
                );
                self.machine.apply_publish_report(report.clone(), now_ms);
                self.dispatch_events();
                Ok(report)
            }
            Err(err) if err.is_stale_cursor() => {
                self.reconnect(now_ms)?;
                Err(err.into())
            }
            Err(err) => {
                self.note_failure(&err);
                Err(err.into())
            }
        }
    }

    pub fn override_lock(&mut self, setting_id: &SettingId, now_ms: u64) -> Result<(), ClientError> {
        let result = self.machine.override_lock(setting_id, now_ms);
        self.dispatch_events();
        result
    }

    pub fn accept_theirs(&mut self, setting_id: &SettingId, now_ms: u64) -> Result<(), ClientError> {
        let result = self.machine.accept_theirs(setting_id, now_ms);
        self.dispatch_events();
        result
    }

    fn reconnect(&mut self, now_ms: u64) -> Result<(), ClientError> {
        tracing::info!("cursor is stale; reconnecting");
        self.connect(now_ms)
    }

    /// The cursor for the next request. After an unanswered request the
    /// session reconnects first, so the backlog from the outage is never
    /// replayed and only live drafts arrive.
    fn live_cursor(&mut self, now_ms: u64) -> Result<Cursor, ClientError> {
        if self.link_down {
            tracing::info!("link restored; resetting cursor");
            self.connect(now_ms)?;
        }
        self.cursor.ok_or(ClientError::NotConnected)
    }

    fn note_failure(&mut self, err: &TransportError) {
        if err.is_link_failure() && !self.link_down {
            tracing::warn!(error = %err, "connection lost");
            self.link_down = true;
        }
    }

    fn report_send_failure(&mut self, err: &TransportError, retryable: bool) {
        self.bus.publish(&ClientEvent::SendFailed {
            setting_id: None,
            reason: err.to_string(),
            retryable,
        });
    }

    fn dispatch_events(&mut self) {
        for event in self.machine.drain_events() {
            self.bus.publish(&event);
        }
    }
}
