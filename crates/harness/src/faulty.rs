use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tandem_core::{Hlc, SettingId, StoreGeneration, UserId};
use tandem_storage::{PreviewedSettingRecord, RecordStore, RecordWrite, StorageError};

/// [`RecordStore`] wrapper that injects storage failures on demand.
pub struct FaultyStore<S> {
    inner: S,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    failing_settings: Mutex<Vec<SettingId>>,
    injected: AtomicUsize,
}

impl<S: RecordStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            failing_settings: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail every write touching `setting_id` until cleared.
    pub fn fail_setting(&self, setting_id: SettingId) {
        self.failing_settings.lock().push(setting_id);
    }

    pub fn clear_faults(&self) {
        self.fail_writes(false);
        self.fail_reads(false);
        self.failing_settings.lock().clear();
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn fault(&self, what: &str) -> StorageError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(what, "injecting storage fault");
        StorageError::Unavailable(format!("injected {what} fault"))
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.fault("read"));
        }
        Ok(())
    }

    fn check_write(&self, writes: &[RecordWrite]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.fault("write"));
        }
        let failing = self.failing_settings.lock();
        if writes.iter().any(|w| failing.contains(&w.setting_id)) {
            drop(failing);
            return Err(self.fault("setting write"));
        }
        Ok(())
    }
}

impl<S: RecordStore> RecordStore for FaultyStore<S> {
    fn generation(&self) -> Result<StoreGeneration, StorageError> {
        self.inner.generation()
    }

    fn high_water_mark(&self) -> Result<Hlc, StorageError> {
        self.inner.high_water_mark()
    }

    fn now_ms(&self) -> Result<u64, StorageError> {
        self.inner.now_ms()
    }

    fn get(&self, setting_id: &SettingId) -> Result<Option<PreviewedSettingRecord>, StorageError> {
        self.check_read()?;
        self.inner.get(setting_id)
    }

    fn upsert(&self, write: &RecordWrite) -> Result<PreviewedSettingRecord, StorageError> {
        self.check_write(std::slice::from_ref(write))?;
        self.inner.upsert(write)
    }

    fn upsert_many(
        &self,
        writes: &[RecordWrite],
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError> {
        self.check_write(writes)?;
        self.inner.upsert_many(writes)
    }

    fn query_modified_since(
        &self,
        since: Hlc,
        exclude_author: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError> {
        self.check_read()?;
        self.inner.query_modified_since(since, exclude_author, limit)
    }

    fn record_count(&self) -> Result<u64, StorageError> {
        self.inner.record_count()
    }

    fn reset(&self) -> Result<StoreGeneration, StorageError> {
        self.inner.reset()
    }
}
