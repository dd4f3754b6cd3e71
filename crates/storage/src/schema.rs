use rusqlite::{Connection, OptionalExtension};
use tandem_core::ids::StoreGeneration;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

const GENERATION_KEY: &str = "generation";

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS previewed_settings (
    setting_id TEXT PRIMARY KEY CHECK (length(setting_id) > 0),
    value BLOB NOT NULL,
    value_digest BLOB NOT NULL CHECK (length(value_digest) = 32),
    status TEXT NOT NULL CHECK (status IN ('draft', 'published')),
    author_id BLOB NOT NULL CHECK (length(author_id) = 16),
    modified_at BLOB NOT NULL CHECK (length(modified_at) = 12),
    revision_number INTEGER NOT NULL CHECK (revision_number > 0)
);
CREATE INDEX IF NOT EXISTS idx_previewed_settings_modified ON previewed_settings (modified_at);
";

/// Read the store generation, creating one on first open.
pub fn load_or_create_generation(conn: &Connection) -> Result<StoreGeneration, StorageError> {
    let existing: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            rusqlite::params![GENERATION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(bytes) => {
            let arr: [u8; 16] = bytes.try_into().map_err(|_| {
                StorageError::Serialization("invalid generation length".into())
            })?;
            Ok(StoreGeneration::from_bytes(arr))
        }
        None => {
            let generation = StoreGeneration::new();
            write_generation(conn, generation)?;
            Ok(generation)
        }
    }
}

pub fn write_generation(conn: &Connection, generation: StoreGeneration) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![GENERATION_KEY, generation.as_bytes().as_slice()],
    )?;
    Ok(())
}
