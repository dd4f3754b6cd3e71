use serde::{Deserialize, Serialize};
use tandem_core::{
    hlc::Hlc,
    ids::{SettingId, StoreGeneration, UserId, ValueDigest},
    setting_value::SettingValue,
};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingStatus {
    /// Being previewed by its author; not committed.
    Draft,
    /// Committed final value.
    Published,
}

impl SettingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            _ => Err(StorageError::Serialization(format!(
                "unknown setting status: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewedSettingRecord {
    pub setting_id: SettingId,
    pub value: SettingValue,
    pub value_digest: ValueDigest,
    pub status: SettingStatus,
    pub author_id: UserId,
    pub modified_at: Hlc,
    pub revision_number: u64,
}

impl PreviewedSettingRecord {
    pub fn is_draft(&self) -> bool {
        self.status == SettingStatus::Draft
    }

    /// Whether the record is older than the lock window at `now_ms`.
    pub fn is_expired(&self, now_ms: u64, lock_window_ms: u64) -> bool {
        now_ms.saturating_sub(self.modified_at.wall_ms()) > lock_window_ms
    }
}

/// One requested write. The store assigns `modified_at` and the revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    pub setting_id: SettingId,
    pub value: SettingValue,
    pub author_id: UserId,
    pub status: SettingStatus,
}

/// Persistence for previewed-setting records.
///
/// Every write stamps `modified_at` from a single store-wide clock inside the
/// write transaction, so commit order equals `modified_at` order and a reader
/// that has seen a record never later observes an older one appearing.
pub trait RecordStore: Send + Sync {
    /// Identity of the current store contents; changes on [`RecordStore::reset`].
    fn generation(&self) -> Result<StoreGeneration, StorageError>;

    /// Latest `modified_at` ever issued by this store.
    fn high_water_mark(&self) -> Result<Hlc, StorageError>;

    /// Physical time of the store clock, in milliseconds.
    fn now_ms(&self) -> Result<u64, StorageError>;

    fn get(&self, setting_id: &SettingId) -> Result<Option<PreviewedSettingRecord>, StorageError>;

    /// Insert or update one record, bumping its revision by exactly one.
    fn upsert(&self, write: &RecordWrite) -> Result<PreviewedSettingRecord, StorageError>;

    /// Apply all writes in one transaction: either every record is written or
    /// none is.
    fn upsert_many(
        &self,
        writes: &[RecordWrite],
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError>;

    /// Records with `modified_at > since`, oldest first, at most `limit`.
    fn query_modified_since(
        &self,
        since: Hlc,
        exclude_author: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError>;

    fn record_count(&self) -> Result<u64, StorageError>;

    /// Drop every record and start a new generation.
    fn reset(&self) -> Result<StoreGeneration, StorageError>;
}
