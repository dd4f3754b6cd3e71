pub mod error;
pub mod locks;
pub mod resolver;
pub mod wire;

pub use error::{AuthorizationError, ErrorCode, SyncError};
pub use resolver::{Resolution, ResolveInput};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem_core::{
    CoreError, Cursor, Hlc, IdentityProvider, SessionId, SettingId, SettingValue,
    SettingsRegistry, StoreGeneration, SyncConfig, User, UserId, ValueDigest,
    registry::sort_for_delivery,
};
use tandem_storage::{PreviewedSettingRecord, RecordStore, RecordWrite, SettingStatus};

use crate::locks::KeyLocks;

/// Who is making a request. Built by the transport from its authenticated
/// session; `user` is `None` for anonymous callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user: Option<UserId>,
    pub session: SessionId,
}

impl RequestContext {
    pub fn authenticated(user: UserId) -> Self {
        Self {
            user: Some(user),
            session: SessionId::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user: None,
            session: SessionId::new(),
        }
    }
}

/// A stored record with its author resolved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingUpdate {
    pub setting_id: SettingId,
    pub value: SettingValue,
    pub status: SettingStatus,
    pub author: User,
    pub modified_at: Hlc,
    pub revision_number: u64,
}

impl SettingUpdate {
    pub fn is_draft(&self) -> bool {
        self.status == SettingStatus::Draft
    }
}

/// The foreign write a preview replaced or was blocked by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousWrite {
    pub author: User,
    pub status: SettingStatus,
    pub modified_at: Hlc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub setting_id: SettingId,
    pub value: SettingValue,
    pub override_lock: bool,
}

impl PreviewRequest {
    pub fn new(setting_id: SettingId, value: SettingValue) -> Self {
        Self {
            setting_id,
            value,
            override_lock: false,
        }
    }

    pub fn overriding(mut self) -> Self {
        self.override_lock = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Accepted,
    Rejected,
    /// Not evaluated because storage failed; safe to retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewOutcome {
    pub setting_id: SettingId,
    pub status: PreviewStatus,
    pub overridden: bool,
    /// Accepted: the record as written. Rejected: the record holding the lock.
    pub record: Option<SettingUpdate>,
    pub previous: Option<PreviousWrite>,
    pub error: Option<String>,
}

impl PreviewOutcome {
    fn failed(setting_id: SettingId, error: &SyncError) -> Self {
        Self {
            setting_id,
            status: PreviewStatus::Failed,
            overridden: false,
            record: None,
            previous: None,
            error: Some(error.to_string()),
        }
    }

    /// Collapse into the written record, or the error a single-setting caller
    /// would surface.
    pub fn into_result(self) -> Result<SettingUpdate, SyncError> {
        match (self.status, self.record) {
            (PreviewStatus::Accepted, Some(record)) => Ok(record),
            (PreviewStatus::Rejected, Some(theirs)) => Err(SyncError::PreviewRejected {
                setting_id: self.setting_id,
                their_value: theirs.value,
                locked_by: theirs.author,
            }),
            _ => Err(SyncError::Storage(tandem_storage::StorageError::Unavailable(
                self.error.unwrap_or_else(|| "preview not written".into()),
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Accepted,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub setting_id: SettingId,
    pub status: PublishStatus,
    pub overridden: bool,
    /// The published record; present only when the batch committed.
    pub record: Option<SettingUpdate>,
    /// The conflicting foreign record.
    pub theirs: Option<SettingUpdate>,
}

/// Outcome of an all-or-nothing publish. When any setting conflicts,
/// `committed` is false and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub committed: bool,
    pub results: BTreeMap<SettingId, PublishResult>,
}

impl PublishReport {
    pub fn conflicts(&self) -> impl Iterator<Item = &PublishResult> {
        self.results
            .values()
            .filter(|r| r.status == PublishStatus::Conflict)
    }

    pub fn published(&self) -> impl Iterator<Item = &SettingUpdate> {
        self.results.values().filter_map(|r| r.record.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResponse {
    pub updates: Vec<SettingUpdate>,
    pub next_cursor: Cursor,
    /// More records are waiting beyond `next_cursor`.
    pub has_more: bool,
}

/// What a fresh session needs to start syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBootstrap {
    pub user: User,
    pub cursor: Cursor,
    /// Foreign drafts still inside the lock window.
    pub active_previews: Vec<SettingUpdate>,
    pub config: SyncConfig,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Server side of preview synchronization: authorizes requests, serializes
/// the read-resolve-write sequence per setting, and answers pulls.
pub struct Coordinator<S> {
    store: S,
    identity: Arc<dyn IdentityProvider>,
    registry: Arc<dyn SettingsRegistry>,
    config: SyncConfig,
    locks: KeyLocks,
}

impl<S: RecordStore> Coordinator<S> {
    pub fn new(
        store: S,
        identity: Arc<dyn IdentityProvider>,
        registry: Arc<dyn SettingsRegistry>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            store,
            identity,
            registry,
            config,
            locks: KeyLocks::new(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn SettingsRegistry> {
        &self.registry
    }

    /// Current cursor position for a session that has seen everything.
    pub fn head(&self) -> Result<Cursor, SyncError> {
        Ok(Cursor::new(
            self.store.generation()?,
            self.store.high_water_mark()?,
        ))
    }

    pub fn connect(&self, ctx: &RequestContext) -> Result<SessionBootstrap, SyncError> {
        let user = self.authorize(ctx)?;
        // Read the head before scanning so a concurrent write is delivered
        // again by the first pull rather than skipped.
        let cursor = self.head()?;
        let now_ms = self.store.now_ms()?;
        let cutoff_ms = now_ms.saturating_sub(self.config.lock_window_ms());
        let mut since = match cutoff_ms {
            0 => Hlc::ZERO,
            ms => Hlc::end_of_ms(ms - 1),
        };

        let limit = self.config.pull_limit;
        let mut active_previews = Vec::new();
        loop {
            let page = self.store.query_modified_since(since, Some(user.id), limit)?;
            let exhausted = page.len() < limit;
            if let Some(last) = page.last() {
                since = last.modified_at;
            }
            active_previews.extend(
                page.into_iter()
                    .filter(|r| r.is_draft() && !r.is_expired(now_ms, self.config.lock_window_ms()))
                    .map(|r| self.attribute(r)),
            );
            if exhausted {
                break;
            }
        }
        sort_for_delivery(self.registry.as_ref(), &mut active_previews, |u| &u.setting_id);

        tracing::info!(
            user = %user.id,
            session = %ctx.session,
            active = active_previews.len(),
            "session connected"
        );
        Ok(SessionBootstrap {
            user,
            cursor,
            active_previews,
            config: self.config.clone(),
        })
    }

    pub fn submit_preview(
        &self,
        ctx: &RequestContext,
        cursor: &Cursor,
        request: PreviewRequest,
    ) -> Result<PreviewOutcome, SyncError> {
        let user = self.authorize(ctx)?;
        self.check_cursor(cursor)?;
        self.check_known(&request.setting_id)?;
        self.preview_one(&user, cursor, request)
    }

    /// Preview several settings in one request. Each setting is resolved on
    /// its own; a storage failure marks that setting `Failed` and the rest
    /// still proceed.
    pub fn submit_previews(
        &self,
        ctx: &RequestContext,
        cursor: &Cursor,
        requests: Vec<PreviewRequest>,
    ) -> Result<BTreeMap<SettingId, PreviewOutcome>, SyncError> {
        let user = self.authorize(ctx)?;
        self.check_cursor(cursor)?;
        if requests.is_empty() {
            return Err(SyncError::EmptyBatch);
        }
        for request in &requests {
            self.check_known(&request.setting_id)?;
        }

        let mut requests = requests;
        sort_for_delivery(self.registry.as_ref(), &mut requests, |r| &r.setting_id);

        let mut outcomes = BTreeMap::new();
        for request in requests {
            let setting_id = request.setting_id.clone();
            let outcome = match self.preview_one(&user, cursor, request) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(%setting_id, error = %err, "preview write failed");
                    PreviewOutcome::failed(setting_id.clone(), &err)
                }
            };
            outcomes.insert(setting_id, outcome);
        }
        Ok(outcomes)
    }

    pub fn publish(
        &self,
        ctx: &RequestContext,
        cursor: &Cursor,
        setting_id: SettingId,
        value: SettingValue,
        override_lock: bool,
    ) -> Result<SettingUpdate, SyncError> {
        let overrides = if override_lock {
            BTreeSet::from([setting_id.clone()])
        } else {
            BTreeSet::new()
        };
        let mut report = self.publish_all(
            ctx,
            cursor,
            BTreeMap::from([(setting_id.clone(), value)]),
            &overrides,
        )?;
        let result = report
            .results
            .remove(&setting_id)
            .ok_or_else(|| CoreError::InvalidData(format!("no publish result for {setting_id}")))?;

        match (result.record, result.theirs) {
            (Some(record), _) => Ok(record),
            (None, Some(theirs)) => Err(SyncError::ValidationConflict {
                setting_id,
                their_value: theirs.value,
                their_author: theirs.author,
            }),
            (None, None) => Err(CoreError::InvalidData(format!(
                "publish of {setting_id} neither committed nor conflicted"
            ))
            .into()),
        }
    }

    /// Publish every value in one transaction. All settings are locked for
    /// the duration; if any conflicts, nothing is written.
    pub fn publish_all(
        &self,
        ctx: &RequestContext,
        cursor: &Cursor,
        values: BTreeMap<SettingId, SettingValue>,
        overrides: &BTreeSet<SettingId>,
    ) -> Result<PublishReport, SyncError> {
        let user = self.authorize(ctx)?;
        self.check_cursor(cursor)?;
        if values.is_empty() {
            return Err(SyncError::EmptyBatch);
        }
        for setting_id in values.keys() {
            self.check_known(setting_id)?;
        }

        let _guards = self.locks.lock_many(values.keys());
        let now_ms = self.store.now_ms()?;

        let mut results = BTreeMap::new();
        let mut writes = Vec::with_capacity(values.len());
        for (setting_id, value) in values {
            let existing = self.store.get(&setting_id)?;
            let resolution = resolver::resolve(&ResolveInput {
                candidate_digest: digest_of(&value)?,
                client_cursor: cursor.position,
                existing: existing.as_ref(),
                is_publish: true,
                current_author: user.id,
                override_requested: overrides.contains(&setting_id),
                now_ms,
                lock_window_ms: self.config.lock_window_ms(),
            });

            let (status, theirs) = match resolution {
                Resolution::Conflict => (
                    PublishStatus::Conflict,
                    existing.map(|r| self.attribute(r)),
                ),
                Resolution::Overridden => {
                    tracing::warn!(
                        %setting_id,
                        user = %user.id,
                        overwritten = ?existing.as_ref().map(|r| r.author_id),
                        "publish overrides unseen foreign change"
                    );
                    (PublishStatus::Accepted, None)
                }
                Resolution::Accepted | Resolution::Rejected => (PublishStatus::Accepted, None),
            };

            writes.push(RecordWrite {
                setting_id: setting_id.clone(),
                value,
                author_id: user.id,
                status: SettingStatus::Published,
            });
            results.insert(
                setting_id.clone(),
                PublishResult {
                    setting_id,
                    status,
                    overridden: resolution == Resolution::Overridden,
                    record: None,
                    theirs,
                },
            );
        }

        let conflicts = results
            .values()
            .filter(|r| r.status == PublishStatus::Conflict)
            .count();
        if conflicts > 0 {
            tracing::info!(user = %user.id, conflicts, "publish refused");
            return Ok(PublishReport {
                committed: false,
                results,
            });
        }

        sort_for_delivery(self.registry.as_ref(), &mut writes, |w| &w.setting_id);
        for record in self.store.upsert_many(&writes)? {
            let update = self.attribute(record);
            if let Some(result) = results.get_mut(&update.setting_id) {
                result.record = Some(update);
            }
        }

        tracing::info!(user = %user.id, settings = writes.len(), "published");
        Ok(PublishReport {
            committed: true,
            results,
        })
    }

    /// Foreign records newer than `cursor`, oldest first. The requesting
    /// user's own records are never returned.
    pub fn pull(&self, ctx: &RequestContext, cursor: &Cursor) -> Result<PullResponse, SyncError> {
        let user = self.authorize(ctx)?;
        self.check_cursor(cursor)?;

        let head = self.store.high_water_mark()?;
        let limit = self.config.pull_limit;
        let mut rows = self
            .store
            .query_modified_since(cursor.position, Some(user.id), limit.saturating_add(1))?;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let last_seen = rows.last().map(|r| r.modified_at);
        let position = match (has_more, last_seen) {
            (true, Some(last)) => last,
            (_, last) => last.map_or(head, |last| last.max(head)).max(cursor.position),
        };

        let updates: Vec<SettingUpdate> = rows.into_iter().map(|r| self.attribute(r)).collect();
        tracing::debug!(
            user = %user.id,
            updates = updates.len(),
            has_more,
            "pull served"
        );
        Ok(PullResponse {
            updates,
            next_cursor: Cursor::new(cursor.generation, position),
            has_more,
        })
    }

    /// Drop every record and start a new store generation. Cursors issued
    /// before the reset become stale.
    pub fn reset(&self) -> Result<StoreGeneration, SyncError> {
        Ok(self.store.reset()?)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn preview_one(
        &self,
        user: &User,
        cursor: &Cursor,
        request: PreviewRequest,
    ) -> Result<PreviewOutcome, SyncError> {
        let PreviewRequest {
            setting_id,
            value,
            override_lock,
        } = request;

        let _guard = self.locks.lock(&setting_id);
        let existing = self.store.get(&setting_id)?;
        let resolution = resolver::resolve(&ResolveInput {
            candidate_digest: digest_of(&value)?,
            client_cursor: cursor.position,
            existing: existing.as_ref(),
            is_publish: false,
            current_author: user.id,
            override_requested: override_lock,
            now_ms: self.store.now_ms()?,
            lock_window_ms: self.config.lock_window_ms(),
        });

        let previous = existing
            .as_ref()
            .filter(|r| r.author_id != user.id)
            .map(|r| PreviousWrite {
                author: self.author(r.author_id),
                status: r.status,
                modified_at: r.modified_at,
            });

        if resolution == Resolution::Rejected {
            tracing::debug!(%setting_id, user = %user.id, "preview rejected by live lock");
            return Ok(PreviewOutcome {
                setting_id,
                status: PreviewStatus::Rejected,
                overridden: false,
                record: existing.map(|r| self.attribute(r)),
                previous,
                error: None,
            });
        }
        if resolution == Resolution::Overridden {
            tracing::warn!(
                %setting_id,
                user = %user.id,
                overwritten = ?previous.as_ref().map(|p| p.author.id),
                "preview overrides foreign lock"
            );
        }

        let record = self.store.upsert(&RecordWrite {
            setting_id: setting_id.clone(),
            value,
            author_id: user.id,
            status: SettingStatus::Draft,
        })?;
        Ok(PreviewOutcome {
            setting_id,
            status: PreviewStatus::Accepted,
            overridden: resolution == Resolution::Overridden,
            record: Some(self.attribute(record)),
            previous,
            error: None,
        })
    }

    fn authorize(&self, ctx: &RequestContext) -> Result<User, SyncError> {
        let id = ctx.user.ok_or(AuthorizationError::NotLoggedIn)?;
        if !self.identity.can_edit(id, &self.config.capability) {
            tracing::debug!(user = %id, capability = %self.config.capability, "request unauthorized");
            return Err(AuthorizationError::Unauthorized.into());
        }
        Ok(self.author(id))
    }

    fn check_cursor(&self, cursor: &Cursor) -> Result<(), SyncError> {
        let current = self.store.generation()?;
        if cursor.generation != current {
            return Err(SyncError::StaleCursor {
                cursor: cursor.generation,
                current,
            });
        }
        Ok(())
    }

    fn check_known(&self, setting_id: &SettingId) -> Result<(), SyncError> {
        match self.registry.setting(setting_id) {
            Some(_) => Ok(()),
            None => Err(SyncError::UnknownSetting(setting_id.clone())),
        }
    }

    fn author(&self, id: UserId) -> User {
        self.identity.user(id).unwrap_or_else(|| User::unknown(id))
    }

    fn attribute(&self, record: PreviewedSettingRecord) -> SettingUpdate {
        SettingUpdate {
            author: self.author(record.author_id),
            setting_id: record.setting_id,
            value: record.value,
            status: record.status,
            modified_at: record.modified_at,
            revision_number: record.revision_number,
        }
    }
}

fn digest_of(value: &SettingValue) -> Result<ValueDigest, SyncError> {
    value
        .digest()
        .map_err(|e| CoreError::Serialization(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tandem_core::hlc::ManualClock;
    use tandem_core::identity::StaticDirectory;
    use tandem_core::registry::{SettingDescriptor, StaticRegistry};
    use tandem_storage::SqliteStore;

    struct Fixture {
        coordinator: Coordinator<SqliteStore>,
        clock: Arc<ManualClock>,
        ada: RequestContext,
        bob: RequestContext,
    }

    fn id(s: &str) -> SettingId {
        SettingId::new(s).unwrap()
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig::default())
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let store = SqliteStore::open_in_memory_with_clock(clock.clone()).unwrap();
        let directory = StaticDirectory::new();
        let ada = User::new("Ada");
        let bob = User::new("Bob");
        directory.insert(ada.clone(), &["customize"]);
        directory.insert(bob.clone(), &["customize"]);
        let registry = StaticRegistry::new();
        for name in ["color", "title", "logo"] {
            registry.register(id(name), SettingDescriptor::leaf("option"));
        }
        registry.register(id("sidebar"), SettingDescriptor::composite("sidebar"));

        let coordinator = Coordinator::new(
            store,
            Arc::new(directory),
            Arc::new(registry),
            config,
        )
        .unwrap();
        Fixture {
            coordinator,
            clock,
            ada: RequestContext::authenticated(ada.id),
            bob: RequestContext::authenticated(bob.id),
        }
    }

    #[test]
    fn unbounded_pull_limit_serves_everything() {
        let f = fixture_with(SyncConfig {
            pull_limit: usize::MAX,
            ..SyncConfig::default()
        });
        let c = &f.coordinator;
        let ada_cursor = c.connect(&f.ada).unwrap().cursor;
        let bob_cursor = c.connect(&f.bob).unwrap().cursor;
        for name in ["color", "title", "logo"] {
            c.submit_preview(&f.ada, &ada_cursor, PreviewRequest::new(id(name), "x".into()))
                .unwrap();
        }

        let pulled = c.pull(&f.bob, &bob_cursor).unwrap();
        assert_eq!(pulled.updates.len(), 3);
        assert!(!pulled.has_more);
        assert_eq!(pulled.next_cursor, c.head().unwrap());
    }

    #[test]
    fn preview_then_foreign_preview_is_rejected() {
        let f = fixture();
        let c = &f.coordinator;
        let ada_cursor = c.connect(&f.ada).unwrap().cursor;
        let bob_cursor = c.connect(&f.bob).unwrap().cursor;

        let first = c
            .submit_preview(&f.ada, &ada_cursor, PreviewRequest::new(id("color"), "red".into()))
            .unwrap();
        assert_eq!(first.status, PreviewStatus::Accepted);
        assert_eq!(first.record.as_ref().unwrap().revision_number, 1);

        f.clock.advance_ms(10);
        let second = c
            .submit_preview(&f.bob, &bob_cursor, PreviewRequest::new(id("color"), "blue".into()))
            .unwrap();
        assert_eq!(second.status, PreviewStatus::Rejected);
        let theirs = second.record.clone().unwrap();
        assert_eq!(theirs.author.display_name, "Ada");
        assert_eq!(theirs.value, SettingValue::text("red"));

        let err = second.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreviewRejected);
    }

    #[test]
    fn preview_after_pull_replaces_foreign_draft() {
        let f = fixture();
        let c = &f.coordinator;
        let ada_cursor = c.connect(&f.ada).unwrap().cursor;
        let bob_cursor = c.connect(&f.bob).unwrap().cursor;
        c.submit_preview(&f.ada, &ada_cursor, PreviewRequest::new(id("color"), "red".into()))
            .unwrap();

        let pulled = c.pull(&f.bob, &bob_cursor).unwrap();
        assert_eq!(pulled.updates.len(), 1);

        let outcome = c
            .submit_preview(
                &f.bob,
                &pulled.next_cursor,
                PreviewRequest::new(id("color"), "blue".into()),
            )
            .unwrap();
        assert_eq!(outcome.status, PreviewStatus::Accepted);
        assert_eq!(outcome.record.unwrap().revision_number, 2);
        let previous = outcome.previous.unwrap();
        assert_eq!(previous.author.display_name, "Ada");
        assert_eq!(previous.status, SettingStatus::Draft);
    }

    #[test]
    fn override_writes_through_lock() {
        let f = fixture();
        let c = &f.coordinator;
        let cursor = c.connect(&f.ada).unwrap().cursor;
        c.submit_preview(&f.ada, &cursor, PreviewRequest::new(id("color"), "red".into()))
            .unwrap();
        let outcome = c
            .submit_preview(
                &f.bob,
                &cursor,
                PreviewRequest::new(id("color"), "blue".into()).overriding(),
            )
            .unwrap();
        assert_eq!(outcome.status, PreviewStatus::Accepted);
        assert!(outcome.overridden);
    }

    #[test]
    fn publish_conflicts_on_unseen_change() {
        let f = fixture();
        let c = &f.coordinator;
        let bob_cursor = c.connect(&f.bob).unwrap().cursor;
        let ada_cursor = c.connect(&f.ada).unwrap().cursor;
        c.publish(&f.ada, &ada_cursor, id("color"), "red".into(), false)
            .unwrap();

        let err = c
            .publish(&f.bob, &bob_cursor, id("color"), "blue".into(), false)
            .unwrap_err();
        match err {
            SyncError::ValidationConflict {
                their_value,
                their_author,
                ..
            } => {
                assert_eq!(their_value, SettingValue::text("red"));
                assert_eq!(their_author.display_name, "Ada");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn publish_all_is_all_or_nothing() {
        let f = fixture();
        let c = &f.coordinator;
        let bob_cursor = c.connect(&f.bob).unwrap().cursor;
        let ada_cursor = c.connect(&f.ada).unwrap().cursor;
        c.publish(&f.ada, &ada_cursor, id("color"), "red".into(), false)
            .unwrap();

        let values = BTreeMap::from([
            (id("color"), SettingValue::text("blue")),
            (id("title"), SettingValue::text("Hello")),
        ]);
        let report = c
            .publish_all(&f.bob, &bob_cursor, values.clone(), &BTreeSet::new())
            .unwrap();
        assert!(!report.committed);
        assert_eq!(report.conflicts().count(), 1);
        assert_eq!(report.results[&id("title")].status, PublishStatus::Accepted);
        assert!(c.store().get(&id("title")).unwrap().is_none());

        let report = c
            .publish_all(&f.bob, &bob_cursor, values, &BTreeSet::from([id("color")]))
            .unwrap();
        assert!(report.committed);
        assert!(report.results[&id("color")].overridden);
        assert_eq!(report.published().count(), 2);
    }

    #[test]
    fn pull_excludes_own_records_and_pages() {
        let f = fixture();
        let c = &f.coordinator;
        let cursor = c.connect(&f.ada).unwrap().cursor;
        for name in ["color", "title", "logo"] {
            c.submit_preview(&f.ada, &cursor, PreviewRequest::new(id(name), "x".into()))
                .unwrap();
        }
        assert!(c.pull(&f.ada, &cursor).unwrap().updates.is_empty());

        let bob_cursor = Cursor::new(cursor.generation, Hlc::ZERO);
        let page = c.pull(&f.bob, &bob_cursor).unwrap();
        assert_eq!(page.updates.len(), 3);
        assert!(!page.has_more);
        assert!(page
            .updates
            .windows(2)
            .all(|w| w[0].modified_at < w[1].modified_at));
        assert!(c.pull(&f.bob, &page.next_cursor).unwrap().updates.is_empty());
    }

    #[test]
    fn connect_reports_live_drafts_only() {
        let f = fixture();
        let c = &f.coordinator;
        let cursor = c.connect(&f.ada).unwrap().cursor;
        c.submit_preview(&f.ada, &cursor, PreviewRequest::new(id("color"), "red".into()))
            .unwrap();
        f.clock.advance_ms(c.config().lock_window_ms() + 1);
        c.submit_preview(&f.ada, &cursor, PreviewRequest::new(id("title"), "Hi".into()))
            .unwrap();

        let boot = c.connect(&f.bob).unwrap();
        let ids: Vec<_> = boot.active_previews.iter().map(|u| u.setting_id.clone()).collect();
        assert_eq!(ids, vec![id("title")]);
        assert_eq!(boot.cursor, c.head().unwrap());
    }

    #[test]
    fn rejects_anonymous_unauthorized_and_unknown() {
        let f = fixture();
        let c = &f.coordinator;
        let cursor = c.head().unwrap();

        let err = c.connect(&RequestContext::anonymous()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotLoggedIn);

        let stranger = RequestContext::authenticated(UserId::new());
        assert_eq!(c.pull(&stranger, &cursor).unwrap_err().code(), ErrorCode::Unauthorized);

        let err = c
            .submit_preview(&f.ada, &cursor, PreviewRequest::new(id("nope"), "x".into()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownSetting);

        let err = c.submit_previews(&f.ada, &cursor, Vec::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CustomizedEmpty);
    }

    #[test]
    fn reset_makes_cursors_stale() {
        let f = fixture();
        let c = &f.coordinator;
        let cursor = c.connect(&f.ada).unwrap().cursor;
        c.reset().unwrap();
        let err = c.pull(&f.ada, &cursor).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleCursor);
        let fresh = c.connect(&f.ada).unwrap().cursor;
        assert!(c.pull(&f.ada, &fresh).is_ok());
    }
}
