//! Per-setting synchronization state for one client session.
//!
//! The machine never performs I/O and never reads a clock: every operation
//! that depends on time takes `now_ms`. It records what happened as
//! [`ClientEvent`]s in an outbox the driver drains after each call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tandem_core::{
    Hlc, SettingId, SettingValue, SettingsRegistry, SyncConfig, User, registry::sort_for_delivery,
};
use tandem_engine::{PreviewOutcome, PreviewRequest, PreviewStatus, PublishReport, SettingUpdate};
use tandem_storage::SettingStatus;

use crate::error::ClientError;
use crate::events::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No local change waiting to reach the server.
    Clean,
    /// Edited; the debounce timer is running.
    Dirty,
    /// A send failed; waiting for the next debounce cycle to retry.
    PendingSend,
    /// Submitted; waiting for the outcome.
    Sent,
    /// Held by another user, directly or through a composite member.
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SendState {
    #[default]
    Idle,
    Debouncing,
    Retrying,
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub by: User,
    pub value: SettingValue,
    pub status: SettingStatus,
    pub modified_at: Hlc,
    pub revision: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    /// Last known published value.
    committed: Option<SettingValue>,
    displayed: Option<SettingValue>,
    /// Unpublished local value. Kept while locked so it can be forced
    /// through with an override.
    local_edit: Option<SettingValue>,
    send: SendState,
    lock: Option<LockInfo>,
    /// Members of this composite that are locked by someone else.
    cascade: BTreeSet<SettingId>,
    /// The local edit lost its place in the queue to a cascade lock and is
    /// queued again once the cascade clears.
    unsent: bool,
}

impl Slot {
    fn is_locked(&self) -> bool {
        self.lock.is_some() || !self.cascade.is_empty()
    }

    fn is_dirty(&self) -> bool {
        self.local_edit.is_some()
    }

    fn phase(&self) -> Phase {
        if self.is_locked() {
            return Phase::Locked;
        }
        match self.send {
            SendState::Idle => Phase::Clean,
            SendState::Debouncing => Phase::Dirty,
            SendState::Retrying => Phase::PendingSend,
            SendState::InFlight => Phase::Sent,
        }
    }

    fn current(&self) -> Option<&SettingValue> {
        self.displayed.as_ref().or(self.committed.as_ref())
    }
}

#[derive(Debug, Clone)]
struct QueuedEdit {
    value: SettingValue,
    override_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Queued,
    /// The setting is locked; the edit was dropped.
    Suppressed,
    /// Same value as the current local edit.
    Unchanged,
}

pub struct SyncMachine {
    registry: Arc<dyn SettingsRegistry>,
    send_delay_ms: u64,
    lock_window_ms: u64,
    slots: BTreeMap<SettingId, Slot>,
    queue: BTreeMap<SettingId, QueuedEdit>,
    /// One debounce deadline for the whole queue, pushed back on every edit.
    deadline_ms: Option<u64>,
    publish_overrides: BTreeSet<SettingId>,
    outbox: Vec<ClientEvent>,
}

impl SyncMachine {
    pub fn new(registry: Arc<dyn SettingsRegistry>, config: &SyncConfig) -> Self {
        Self {
            registry,
            send_delay_ms: config.send_settings_delay_ms,
            lock_window_ms: config.lock_window_ms(),
            slots: BTreeMap::new(),
            queue: BTreeMap::new(),
            deadline_ms: None,
            publish_overrides: BTreeSet::new(),
            outbox: Vec::new(),
        }
    }

    pub fn configure(&mut self, config: &SyncConfig) {
        self.send_delay_ms = config.send_settings_delay_ms;
        self.lock_window_ms = config.lock_window_ms();
    }

    /// Record the committed value a setting starts from.
    pub fn seed(&mut self, setting_id: SettingId, committed: SettingValue) {
        let slot = self.slots.entry(setting_id).or_default();
        slot.displayed = Some(committed.clone());
        slot.committed = Some(committed);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn phase(&self, setting_id: &SettingId) -> Phase {
        self.slots.get(setting_id).map_or(Phase::Clean, Slot::phase)
    }

    pub fn displayed(&self, setting_id: &SettingId) -> Option<&SettingValue> {
        self.slots.get(setting_id).and_then(Slot::current)
    }

    pub fn committed(&self, setting_id: &SettingId) -> Option<&SettingValue> {
        self.slots.get(setting_id).and_then(|s| s.committed.as_ref())
    }

    pub fn local_edit(&self, setting_id: &SettingId) -> Option<&SettingValue> {
        self.slots.get(setting_id).and_then(|s| s.local_edit.as_ref())
    }

    pub fn lock(&self, setting_id: &SettingId) -> Option<&LockInfo> {
        self.slots.get(setting_id).and_then(|s| s.lock.as_ref())
    }

    pub fn is_locked(&self, setting_id: &SettingId) -> bool {
        self.slots.get(setting_id).is_some_and(Slot::is_locked)
    }

    /// Locked members that cascade their lock onto this composite.
    pub fn cascade_sources(&self, setting_id: &SettingId) -> Vec<SettingId> {
        self.slots
            .get(setting_id)
            .map(|s| s.cascade.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn debounce_deadline(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// Earliest time at which a direct lock runs out.
    pub fn next_lock_expiry(&self) -> Option<u64> {
        self.slots
            .values()
            .filter_map(|s| s.lock.as_ref().map(|l| l.expires_at_ms))
            .min()
    }

    pub fn queued(&self) -> Vec<SettingId> {
        self.queue.keys().cloned().collect()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------------
    // Local edits and sending
    // ------------------------------------------------------------------------

    pub fn edit(&mut self, setting_id: SettingId, value: SettingValue, now_ms: u64) -> EditOutcome {
        let slot = self.slots.entry(setting_id.clone()).or_default();
        if slot.is_locked() {
            tracing::debug!(%setting_id, "edit suppressed on locked setting");
            return EditOutcome::Suppressed;
        }
        if slot.local_edit.as_ref() == Some(&value) {
            return EditOutcome::Unchanged;
        }

        slot.local_edit = Some(value.clone());
        slot.displayed = Some(value.clone());
        slot.send = SendState::Debouncing;
        slot.unsent = false;
        self.queue.insert(
            setting_id,
            QueuedEdit {
                value,
                override_lock: false,
            },
        );
        self.deadline_ms = Some(now_ms.saturating_add(self.send_delay_ms));
        EditOutcome::Queued
    }

    /// The queued batch, once the debounce deadline has passed.
    pub fn take_due(&mut self, now_ms: u64) -> Option<Vec<PreviewRequest>> {
        match self.deadline_ms {
            Some(deadline) if deadline <= now_ms => self.take_all(),
            _ => None,
        }
    }

    /// The queued batch regardless of the deadline. Every taken setting is
    /// marked in flight.
    pub fn take_all(&mut self) -> Option<Vec<PreviewRequest>> {
        self.deadline_ms = None;
        if self.queue.is_empty() {
            return None;
        }
        let queue = std::mem::take(&mut self.queue);
        let mut batch = Vec::with_capacity(queue.len());
        for (setting_id, edit) in queue {
            if let Some(slot) = self.slots.get_mut(&setting_id) {
                slot.send = SendState::InFlight;
                slot.unsent = false;
            }
            batch.push(PreviewRequest {
                setting_id,
                value: edit.value,
                override_lock: edit.override_lock,
            });
        }
        sort_for_delivery(self.registry.as_ref(), &mut batch, |r| &r.setting_id);
        Some(batch)
    }

    /// Put an unanswered batch back for the next debounce cycle. Settings
    /// edited again or locked meanwhile keep their newer state.
    pub fn requeue(&mut self, batch: Vec<PreviewRequest>, now_ms: u64) {
        for request in batch {
            let Some(slot) = self.slots.get_mut(&request.setting_id) else {
                continue;
            };
            if slot.is_locked() {
                slot.unsent |= slot.local_edit.as_ref() == Some(&request.value);
                continue;
            }
            if self.queue.contains_key(&request.setting_id) {
                continue;
            }
            slot.send = SendState::Retrying;
            self.queue.insert(
                request.setting_id,
                QueuedEdit {
                    value: request.value,
                    override_lock: request.override_lock,
                },
            );
        }
        if !self.queue.is_empty() && self.deadline_ms.is_none() {
            self.deadline_ms = Some(now_ms.saturating_add(self.send_delay_ms));
        }
    }

    /// Give up on a batch the server refused outright. Local edits stay so
    /// they can still be published.
    pub fn abandon(&mut self, batch: &[PreviewRequest]) {
        for request in batch {
            if let Some(slot) = self.slots.get_mut(&request.setting_id) {
                if slot.send == SendState::InFlight {
                    slot.send = SendState::Idle;
                }
            }
        }
    }

    pub fn apply_preview_outcomes(
        &mut self,
        outcomes: BTreeMap<SettingId, PreviewOutcome>,
        sent: &[PreviewRequest],
        now_ms: u64,
    ) {
        let mut outcomes: Vec<PreviewOutcome> = outcomes.into_values().collect();
        sort_for_delivery(self.registry.as_ref(), &mut outcomes, |o| &o.setting_id);
        for outcome in outcomes {
            let request = sent.iter().find(|r| r.setting_id == outcome.setting_id);
            self.apply_preview_outcome(outcome, request, now_ms);
        }
        self.recompute_cascades(now_ms);
    }

    fn apply_preview_outcome(
        &mut self,
        outcome: PreviewOutcome,
        request: Option<&PreviewRequest>,
        now_ms: u64,
    ) {
        let setting_id = outcome.setting_id.clone();
        match outcome.status {
            PreviewStatus::Accepted => {
                let reload_required = self.reload_required(&setting_id);
                let slot = self.slots.entry(setting_id.clone()).or_default();
                if slot.send == SendState::InFlight {
                    slot.send = SendState::Idle;
                }
                if request.is_some_and(|r| slot.local_edit.as_ref() == Some(&r.value)) {
                    slot.unsent = false;
                }
                let superseded = match (&slot.lock, &outcome.record) {
                    (Some(lock), Some(record)) => lock.modified_at < record.modified_at,
                    _ => false,
                };
                if superseded {
                    slot.lock = None;
                }
                self.outbox.push(ClientEvent::PreviewAccepted {
                    setting_id: setting_id.clone(),
                    revision: outcome.record.as_ref().map_or(0, |r| r.revision_number),
                    overridden: outcome.overridden,
                });
                if superseded {
                    self.outbox.push(ClientEvent::Unlocked {
                        setting_id,
                        reload_required,
                    });
                }
            }
            PreviewStatus::Rejected => match outcome.record {
                Some(theirs) => {
                    tracing::debug!(%setting_id, by = %theirs.author.id, "preview rejected");
                    self.outbox.push(ClientEvent::PreviewRejected {
                        setting_id,
                        locked_by: theirs.author.clone(),
                        their_value: theirs.value.clone(),
                    });
                    let expires_at_ms = self.record_expiry(&theirs);
                    self.lock_with(&theirs, expires_at_ms);
                }
                None => self.retry_one(setting_id, request, "rejected without a record", now_ms),
            },
            PreviewStatus::Failed => {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "preview not written".to_string());
                self.retry_one(setting_id, request, &reason, now_ms);
            }
        }
    }

    fn retry_one(
        &mut self,
        setting_id: SettingId,
        request: Option<&PreviewRequest>,
        reason: &str,
        now_ms: u64,
    ) {
        tracing::warn!(%setting_id, reason, "preview failed; will retry");
        if let Some(request) = request {
            self.requeue(vec![request.clone()], now_ms);
        }
        self.outbox.push(ClientEvent::SendFailed {
            setting_id: Some(setting_id),
            reason: reason.to_string(),
            retryable: true,
        });
    }

    // ------------------------------------------------------------------------
    // Remote updates
    // ------------------------------------------------------------------------

    /// Apply records from a pull or a session bootstrap, in delivery order.
    pub fn apply_remote(&mut self, updates: Vec<SettingUpdate>, now_ms: u64) {
        let mut updates = updates;
        sort_for_delivery(self.registry.as_ref(), &mut updates, |u| &u.setting_id);
        for update in updates {
            self.apply_one(update, now_ms);
            self.recompute_cascades(now_ms);
        }
    }

    fn apply_one(&mut self, update: SettingUpdate, now_ms: u64) {
        let setting_id = update.setting_id.clone();
        if update.is_draft() {
            let age = now_ms.saturating_sub(update.modified_at.wall_ms());
            if age > self.lock_window_ms {
                tracing::trace!(%setting_id, age, "ignoring expired foreign draft");
                return;
            }
            let expires_at_ms = self.record_expiry(&update);
            self.lock_with(&update, expires_at_ms);
            return;
        }

        let reload_required = self.reload_required(&setting_id);
        let slot = self.slots.entry(setting_id.clone()).or_default();
        slot.committed = Some(update.value.clone());
        let holder = slot.lock.as_ref().map(|l| l.by.id);
        match holder {
            Some(holder) if holder == update.author.id => {
                slot.lock = None;
                slot.local_edit = None;
                slot.send = SendState::Idle;
                slot.unsent = false;
                slot.displayed = Some(update.value.clone());
                self.queue.remove(&setting_id);
                self.publish_overrides.remove(&setting_id);
                self.outbox.push(ClientEvent::Unlocked {
                    setting_id: setting_id.clone(),
                    reload_required,
                });
                self.outbox.push(ClientEvent::ValueApplied {
                    setting_id,
                    value: update.value,
                    reload_required,
                });
            }
            Some(_) => {
                tracing::debug!(%setting_id, "published value recorded behind foreign lock");
            }
            None if slot.is_dirty() => {
                let expires_at_ms = self.record_expiry(&update);
                self.lock_with(&update, expires_at_ms);
            }
            None => {
                slot.displayed = Some(update.value.clone());
                self.outbox.push(ClientEvent::ValueApplied {
                    setting_id,
                    value: update.value,
                    reload_required,
                });
            }
        }
    }

    fn record_expiry(&self, update: &SettingUpdate) -> u64 {
        update
            .modified_at
            .wall_ms()
            .saturating_add(self.lock_window_ms)
    }

    fn lock_with(&mut self, update: &SettingUpdate, expires_at_ms: u64) {
        let setting_id = update.setting_id.clone();
        let reload_required = self.reload_required(&setting_id);
        let slot = self.slots.entry(setting_id.clone()).or_default();
        let newly_locked = slot
            .lock
            .as_ref()
            .is_none_or(|l| l.by.id != update.author.id);

        if update.status == SettingStatus::Published {
            slot.committed = Some(update.value.clone());
        }
        slot.displayed = Some(update.value.clone());
        slot.send = SendState::Idle;
        slot.lock = Some(LockInfo {
            by: update.author.clone(),
            value: update.value.clone(),
            status: update.status,
            modified_at: update.modified_at,
            revision: update.revision_number,
            expires_at_ms,
        });
        self.queue.remove(&setting_id);

        if newly_locked {
            self.outbox.push(ClientEvent::Locked {
                setting_id: setting_id.clone(),
                by: update.author.clone(),
                cascade: false,
            });
        }
        self.outbox.push(ClientEvent::ValueApplied {
            setting_id,
            value: update.value.clone(),
            reload_required,
        });
    }

    /// Release direct locks whose window has run out. The displayed value
    /// reverts to the last committed one and any suppressed edit is dropped.
    pub fn expire_locks(&mut self, now_ms: u64) -> Vec<SettingId> {
        let expired: Vec<SettingId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.lock.as_ref().is_some_and(|l| now_ms > l.expires_at_ms))
            .map(|(id, _)| id.clone())
            .collect();

        for setting_id in &expired {
            let reload_required = self.reload_required(setting_id);
            let Some(slot) = self.slots.get_mut(setting_id) else {
                continue;
            };
            slot.lock = None;
            slot.local_edit = None;
            slot.send = SendState::Idle;
            slot.unsent = false;
            slot.displayed = slot.committed.clone();
            let reverted = slot.committed.clone();
            self.queue.remove(setting_id);
            self.publish_overrides.remove(setting_id);

            tracing::info!(%setting_id, "lock expired");
            self.outbox.push(ClientEvent::LockExpired {
                setting_id: setting_id.clone(),
            });
            self.outbox.push(ClientEvent::Unlocked {
                setting_id: setting_id.clone(),
                reload_required,
            });
            if let Some(value) = reverted {
                self.outbox.push(ClientEvent::ValueApplied {
                    setting_id: setting_id.clone(),
                    value,
                    reload_required,
                });
            }
        }
        if !expired.is_empty() {
            self.recompute_cascades(now_ms);
        }
        expired
    }

    // ------------------------------------------------------------------------
    // Lock resolution by the user
    // ------------------------------------------------------------------------

    /// Take the setting back: drop the lock and queue the preserved local
    /// edit with the override flag.
    pub fn override_lock(&mut self, setting_id: &SettingId, now_ms: u64) -> Result<(), ClientError> {
        let reload_required = self.reload_required(setting_id);
        let slot = self
            .slots
            .get_mut(setting_id)
            .filter(|s| s.lock.is_some())
            .ok_or_else(|| ClientError::NotLocked(setting_id.clone()))?;
        let value = slot
            .local_edit
            .clone()
            .ok_or_else(|| ClientError::NoLocalEdit(setting_id.clone()))?;

        slot.lock = None;
        slot.displayed = Some(value.clone());
        slot.send = SendState::Debouncing;
        slot.unsent = false;
        self.queue.insert(
            setting_id.clone(),
            QueuedEdit {
                value: value.clone(),
                override_lock: true,
            },
        );
        self.deadline_ms = Some(now_ms.saturating_add(self.send_delay_ms));
        self.publish_overrides.insert(setting_id.clone());

        tracing::warn!(%setting_id, "user overrode foreign lock");
        self.outbox.push(ClientEvent::Unlocked {
            setting_id: setting_id.clone(),
            reload_required,
        });
        self.outbox.push(ClientEvent::ValueApplied {
            setting_id: setting_id.clone(),
            value,
            reload_required,
        });
        self.recompute_cascades(now_ms);
        Ok(())
    }

    /// Give up the local edit in favour of the lock holder's value. A lock
    /// from a published record is released; a live draft keeps holding.
    pub fn accept_theirs(&mut self, setting_id: &SettingId, now_ms: u64) -> Result<(), ClientError> {
        let reload_required = self.reload_required(setting_id);
        let slot = self
            .slots
            .get_mut(setting_id)
            .filter(|s| s.lock.is_some())
            .ok_or_else(|| ClientError::NotLocked(setting_id.clone()))?;

        slot.local_edit = None;
        slot.unsent = false;
        self.queue.remove(setting_id);
        self.publish_overrides.remove(setting_id);

        let released = slot
            .lock
            .as_ref()
            .is_some_and(|l| l.status == SettingStatus::Published);
        if released {
            slot.lock = None;
            slot.displayed = slot.committed.clone();
            self.outbox.push(ClientEvent::Unlocked {
                setting_id: setting_id.clone(),
                reload_required,
            });
            self.recompute_cascades(now_ms);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Settings with unsaved edits that are currently locked.
    pub fn publish_blockers(&self) -> Vec<SettingId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.is_dirty() && s.is_locked())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn publish_values(&self) -> BTreeMap<SettingId, SettingValue> {
        self.slots
            .iter()
            .filter_map(|(id, s)| s.local_edit.clone().map(|v| (id.clone(), v)))
            .collect()
    }

    pub fn publish_overrides(&self) -> BTreeSet<SettingId> {
        self.publish_overrides.clone()
    }

    pub fn apply_publish_report(&mut self, report: PublishReport, now_ms: u64) {
        if report.committed {
            let mut published: Vec<SettingUpdate> = report
                .results
                .into_values()
                .filter_map(|r| r.record)
                .collect();
            sort_for_delivery(self.registry.as_ref(), &mut published, |u| &u.setting_id);
            for record in published {
                let setting_id = record.setting_id.clone();
                let slot = self.slots.entry(setting_id.clone()).or_default();
                slot.committed = Some(record.value.clone());
                slot.displayed = Some(record.value);
                slot.local_edit = None;
                slot.send = SendState::Idle;
                slot.unsent = false;
                self.queue.remove(&setting_id);
                self.publish_overrides.remove(&setting_id);
                self.outbox.push(ClientEvent::Published {
                    setting_id,
                    revision: record.revision_number,
                });
            }
            return;
        }

        for result in report.results.into_values() {
            let Some(theirs) = result.theirs else {
                continue;
            };
            tracing::info!(setting_id = %result.setting_id, by = %theirs.author.id, "publish conflict");
            self.outbox.push(ClientEvent::PublishConflict {
                setting_id: result.setting_id,
                their_value: theirs.value.clone(),
                their_author: theirs.author.clone(),
            });
            self.lock_with(&theirs, now_ms.saturating_add(self.lock_window_ms));
        }
        self.recompute_cascades(now_ms);
    }

    // ------------------------------------------------------------------------
    // Composites
    // ------------------------------------------------------------------------

    fn recompute_cascades(&mut self, now_ms: u64) {
        let locked_by: BTreeMap<SettingId, User> = self
            .slots
            .iter()
            .filter_map(|(id, s)| s.lock.as_ref().map(|l| (id.clone(), l.by.clone())))
            .collect();

        let mut changes = Vec::new();
        for (setting_id, slot) in &self.slots {
            let members = match slot.current() {
                Some(value) => self.registry.members(setting_id, value),
                None => Vec::new(),
            };
            let cascade: BTreeSet<SettingId> = members
                .into_iter()
                .filter(|m| m != setting_id && locked_by.contains_key(m))
                .collect();
            if cascade != slot.cascade {
                changes.push((setting_id.clone(), cascade));
            }
        }

        for (setting_id, cascade) in changes {
            let reload_required = self.reload_required(&setting_id);
            let Some(slot) = self.slots.get_mut(&setting_id) else {
                continue;
            };
            let was_locked = slot.is_locked();
            let by = cascade.iter().next().and_then(|m| locked_by.get(m)).cloned();
            slot.cascade = cascade;
            let now_locked = slot.is_locked();

            if now_locked && !was_locked {
                let queued = self.queue.remove(&setting_id).is_some();
                slot.unsent |= queued || slot.send == SendState::InFlight;
                slot.send = SendState::Idle;
                if let Some(by) = by {
                    self.outbox.push(ClientEvent::Locked {
                        setting_id,
                        by,
                        cascade: true,
                    });
                }
            } else if was_locked && !now_locked {
                let resend = slot.local_edit.clone().filter(|_| slot.unsent);
                slot.unsent = false;
                if let Some(value) = resend {
                    tracing::debug!(%setting_id, "cascade cleared; resending composite edit");
                    slot.send = SendState::Debouncing;
                    self.queue.insert(
                        setting_id.clone(),
                        QueuedEdit {
                            value,
                            override_lock: false,
                        },
                    );
                    self.deadline_ms = Some(now_ms.saturating_add(self.send_delay_ms));
                }
                self.outbox.push(ClientEvent::Unlocked {
                    setting_id,
                    reload_required,
                });
            }
        }
    }

    fn reload_required(&self, setting_id: &SettingId) -> bool {
        self.registry.transport(setting_id).requires_reload()
    }
}
