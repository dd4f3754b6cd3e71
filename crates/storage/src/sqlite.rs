use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};

use tandem_core::{
    hlc::{Hlc, HlcClock, PhysicalClock, SystemClock},
    ids::*,
    setting_value::SettingValue,
};

use crate::error::StorageError;
use crate::schema;
use crate::traits::{PreviewedSettingRecord, RecordStore, RecordWrite, SettingStatus};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

const RECORD_COLUMNS: &str =
    "setting_id, value, value_digest, status, author_id, modified_at, revision_number";

struct Inner {
    conn: Connection,
    clock: HlcClock,
    generation: StoreGeneration,
}

/// SQLite-backed record store.
///
/// One connection behind a mutex; each call holds it for a single statement
/// or transaction only, so callers working on different settings interleave
/// at call granularity.
pub struct SqliteStore {
    inner: Mutex<Inner>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: &str,
        clock: Arc<dyn PhysicalClock>,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, clock)
    }

    pub fn open_in_memory_with_clock(clock: Arc<dyn PhysicalClock>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(
        conn: Connection,
        physical: Arc<dyn PhysicalClock>,
    ) -> Result<Self, StorageError> {
        schema::init_schema(&conn)?;
        let generation = schema::load_or_create_generation(&conn)?;

        let mut clock = HlcClock::new(physical);
        let latest: Option<Vec<u8>> =
            conn.query_row("SELECT MAX(modified_at) FROM previewed_settings", [], |row| {
                row.get(0)
            })?;
        if let Some(bytes) = latest {
            clock.observe(Hlc::from_bytes(&to_array::<12>(bytes, "modified_at")?));
        }

        tracing::debug!(%generation, "opened previewed-setting store");
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                clock,
                generation,
            }),
        })
    }
}

type RawRecord = (String, Vec<u8>, Vec<u8>, String, Vec<u8>, Vec<u8>, i64);

fn raw_record(row: &rusqlite::Row) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_record(raw: RawRecord) -> Result<PreviewedSettingRecord, StorageError> {
    let (setting_id, value_bytes, digest_bytes, status, author_bytes, modified_bytes, revision) =
        raw;
    let value = SettingValue::from_msgpack(&value_bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let revision_number = u64::try_from(revision).map_err(|_| {
        StorageError::ConstraintViolation(format!("negative revision for {setting_id}"))
    })?;
    Ok(PreviewedSettingRecord {
        setting_id: SettingId::new(setting_id)?,
        value,
        value_digest: ValueDigest::from_bytes(to_array::<32>(digest_bytes, "value_digest")?),
        status: SettingStatus::parse(&status)?,
        author_id: UserId::from_bytes(to_array::<16>(author_bytes, "author_id")?),
        modified_at: Hlc::from_bytes(&to_array::<12>(modified_bytes, "modified_at")?),
        revision_number,
    })
}

fn read_record(
    conn: &Connection,
    setting_id: &SettingId,
) -> Result<Option<PreviewedSettingRecord>, StorageError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM previewed_settings WHERE setting_id = ?1"),
            rusqlite::params![setting_id.as_str()],
            raw_record,
        )
        .optional()?;
    raw.map(decode_record).transpose()
}

/// Write one record inside `tx`. The revision is read and bumped in the same
/// transaction that writes it.
fn write_record(
    tx: &Transaction,
    clock: &mut HlcClock,
    write: &RecordWrite,
) -> Result<PreviewedSettingRecord, StorageError> {
    let value_bytes = write
        .value
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let value_digest = write
        .value
        .digest()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let previous: Option<i64> = tx
        .query_row(
            "SELECT revision_number FROM previewed_settings WHERE setting_id = ?1",
            rusqlite::params![write.setting_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let revision_number = match previous {
        Some(rev) => u64::try_from(rev)
            .map_err(|_| {
                StorageError::ConstraintViolation(format!(
                    "negative revision for {}",
                    write.setting_id
                ))
            })?
            + 1,
        None => 1,
    };
    let modified_at = clock.tick()?;

    tx.execute(
        "INSERT INTO previewed_settings (setting_id, value, value_digest, status, author_id, modified_at, revision_number)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(setting_id) DO UPDATE SET
            value = excluded.value,
            value_digest = excluded.value_digest,
            status = excluded.status,
            author_id = excluded.author_id,
            modified_at = excluded.modified_at,
            revision_number = excluded.revision_number",
        rusqlite::params![
            write.setting_id.as_str(),
            value_bytes,
            value_digest.as_bytes().as_slice(),
            write.status.as_str(),
            write.author_id.as_bytes().as_slice(),
            &modified_at.to_bytes()[..],
            revision_number as i64,
        ],
    )?;

    Ok(PreviewedSettingRecord {
        setting_id: write.setting_id.clone(),
        value: write.value.clone(),
        value_digest,
        status: write.status,
        author_id: write.author_id,
        modified_at,
        revision_number,
    })
}

impl RecordStore for SqliteStore {
    fn generation(&self) -> Result<StoreGeneration, StorageError> {
        Ok(self.inner.lock().generation)
    }

    fn high_water_mark(&self) -> Result<Hlc, StorageError> {
        Ok(self.inner.lock().clock.last())
    }

    fn now_ms(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().clock.physical_ms()?)
    }

    fn get(&self, setting_id: &SettingId) -> Result<Option<PreviewedSettingRecord>, StorageError> {
        let inner = self.inner.lock();
        read_record(&inner.conn, setting_id)
    }

    fn upsert(&self, write: &RecordWrite) -> Result<PreviewedSettingRecord, StorageError> {
        let mut inner = self.inner.lock();
        let Inner { conn, clock, .. } = &mut *inner;
        let tx = conn.transaction()?;
        let record = write_record(&tx, clock, write)?;
        tx.commit()?;
        tracing::trace!(
            setting_id = %record.setting_id,
            revision = record.revision_number,
            status = record.status.as_str(),
            "upserted record"
        );
        Ok(record)
    }

    fn upsert_many(
        &self,
        writes: &[RecordWrite],
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError> {
        let mut inner = self.inner.lock();
        let Inner { conn, clock, .. } = &mut *inner;
        let tx = conn.transaction()?;
        let mut records = Vec::with_capacity(writes.len());
        for write in writes {
            records.push(write_record(&tx, clock, write)?);
        }
        tx.commit()?;
        Ok(records)
    }

    fn query_modified_since(
        &self,
        since: Hlc,
        exclude_author: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<PreviewedSettingRecord>, StorageError> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM previewed_settings
             WHERE modified_at > ?1 AND (?2 IS NULL OR author_id != ?2)
             ORDER BY modified_at, rowid
             LIMIT ?3"
        ))?;
        let exclude = exclude_author.map(|a| a.as_bytes().to_vec());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            rusqlite::params![&since.to_bytes()[..], exclude, limit],
            raw_record,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_record(row?)?);
        }
        Ok(result)
    }

    fn record_count(&self) -> Result<u64, StorageError> {
        let inner = self.inner.lock();
        let count: i64 =
            inner
                .conn
                .query_row("SELECT COUNT(*) FROM previewed_settings", [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    fn reset(&self) -> Result<StoreGeneration, StorageError> {
        let mut inner = self.inner.lock();
        let generation = StoreGeneration::new();
        let tx = inner.conn.transaction()?;
        tx.execute("DELETE FROM previewed_settings", [])?;
        schema::write_generation(&tx, generation)?;
        tx.commit()?;
        inner.generation = generation;
        tracing::info!(%generation, "store reset to new generation");
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::hlc::ManualClock;

    fn id(s: &str) -> SettingId {
        SettingId::new(s).unwrap()
    }

    fn draft(setting: &str, value: &str, author: UserId) -> RecordWrite {
        RecordWrite {
            setting_id: id(setting),
            value: SettingValue::text(value),
            author_id: author,
            status: SettingStatus::Draft,
        }
    }

    #[test]
    fn first_upsert_creates_revision_one() -> Result<(), StorageError> {
        let store = SqliteStore::open_in_memory()?;
        let author = UserId::new();
        assert!(store.get(&id("color"))?.is_none());

        let record = store.upsert(&draft("color", "red", author))?;
        assert_eq!(record.revision_number, 1);
        assert_eq!(record.status, SettingStatus::Draft);

        let fetched = store.get(&id("color"))?.unwrap();
        assert_eq!(fetched, record);
        Ok(())
    }

    #[test]
    fn revision_counts_every_upsert() -> Result<(), StorageError> {
        let clock = ManualClock::new(1_000);
        let store = SqliteStore::open_in_memory_with_clock(clock.clone())?;
        let author = UserId::new();
        let mut previous = Hlc::ZERO;
        for n in 1..=25u64 {
            let record = store.upsert(&draft("color", &format!("v{n}"), author))?;
            assert_eq!(record.revision_number, n);
            assert!(record.modified_at > previous);
            previous = record.modified_at;
            if n % 5 == 0 {
                clock.advance_ms(1);
            }
        }
        assert_eq!(store.get(&id("color"))?.unwrap().revision_number, 25);
        assert_eq!(store.record_count()?, 1);
        Ok(())
    }

    #[test]
    fn query_orders_and_excludes_author() -> Result<(), StorageError> {
        let clock = ManualClock::new(5_000);
        let store = SqliteStore::open_in_memory_with_clock(clock.clone())?;
        let alice = UserId::new();
        let bob = UserId::new();

        let a = store.upsert(&draft("a", "1", alice))?;
        let b = store.upsert(&draft("b", "2", bob))?;
        clock.advance_ms(10);
        let c = store.upsert(&draft("c", "3", bob))?;
        // rewriting `a` moves it to the end
        let a2 = store.upsert(&draft("a", "4", alice))?;

        let all = store.query_modified_since(Hlc::ZERO, None, 100)?;
        let ids: Vec<&str> = all.iter().map(|r| r.setting_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(all[2].revision_number, 2);

        let not_bob = store.query_modified_since(Hlc::ZERO, Some(bob), 100)?;
        assert_eq!(not_bob.len(), 1);
        assert_eq!(not_bob[0].modified_at, a2.modified_at);

        let after_b = store.query_modified_since(b.modified_at, None, 100)?;
        assert_eq!(after_b.len(), 2);
        assert_eq!(after_b[0].modified_at, c.modified_at);

        let limited = store.query_modified_since(a.modified_at, None, 1)?;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].setting_id.as_str(), "b");
        Ok(())
    }

    #[test]
    fn upsert_many_is_all_or_nothing() -> Result<(), StorageError> {
        let store = SqliteStore::open_in_memory()?;
        let author = UserId::new();
        store.upsert(&draft("keep", "original", author))?;

        // Make the second write of the batch fail.
        {
            let inner = store.inner.lock();
            inner.conn.execute_batch(
                "CREATE TRIGGER reject_boom BEFORE UPDATE ON previewed_settings
                 WHEN NEW.setting_id = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;
                 CREATE TRIGGER reject_boom_insert BEFORE INSERT ON previewed_settings
                 WHEN NEW.setting_id = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )?;
        }

        let batch = vec![
            RecordWrite {
                status: SettingStatus::Published,
                ..draft("keep", "changed", author)
            },
            draft("boom", "x", author),
        ];
        assert!(store.upsert_many(&batch).is_err());

        let kept = store.get(&id("keep"))?.unwrap();
        assert_eq!(kept.value, SettingValue::text("original"));
        assert_eq!(kept.revision_number, 1);
        assert_eq!(kept.status, SettingStatus::Draft);
        assert!(store.get(&id("boom"))?.is_none());
        Ok(())
    }

    #[test]
    fn reset_rotates_generation() -> Result<(), StorageError> {
        let store = SqliteStore::open_in_memory()?;
        let before = store.generation()?;
        store.upsert(&draft("color", "red", UserId::new()))?;

        let after = store.reset()?;
        assert_ne!(before, after);
        assert_eq!(store.generation()?, after);
        assert_eq!(store.record_count()?, 0);
        Ok(())
    }

    #[test]
    fn reopen_keeps_records_generation_and_clock() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tandem.db");
        let path = path.to_str().ok_or("non-utf8 temp path")?;

        let (generation, written) = {
            let clock = ManualClock::new(90_000);
            let store = SqliteStore::open_with_clock(path, clock)?;
            let record = store.upsert(&draft("color", "red", UserId::new()))?;
            (store.generation()?, record)
        };

        // Wall clock went backwards between runs.
        let clock = ManualClock::new(1_000);
        let store = SqliteStore::open_with_clock(path, clock)?;
        assert_eq!(store.generation()?, generation);
        assert_eq!(store.high_water_mark()?, written.modified_at);

        let next = store.upsert(&draft("color", "blue", UserId::new()))?;
        assert_eq!(next.revision_number, 2);
        assert!(next.modified_at > written.modified_at);
        Ok(())
    }
}
