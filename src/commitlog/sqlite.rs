//! SQLite-backed commit log.

use super::{CommitLog, LogError, Record, Watermark};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "log.db";

/// Settings for a [`SqliteLog`].
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Name stamped on records produced locally
    pub origin: String,
}

struct Inner {
    conn: Option<Connection>,
    next_offset: u64,
}

/// Commit log persisted in a single SQLite table.
pub struct SqliteLog {
    config: LogConfig,
    instance: String,
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl SqliteLog {
    /// Open (or create) the log under `dir`.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(LOG_FILE);
        let conn = Connection::open(&path)?;
        let log = Self::with_connection(conn, config, Some(path))?;
        tracing::info!(
            path = ?log.path,
            instance = %log.instance,
            next_offset = log.next_offset()?,
            "commit log opened"
        );
        Ok(log)
    }

    /// Open a log that lives only in memory.
    pub fn in_memory(config: LogConfig) -> Result<Self, LogError> {
        Self::with_connection(Connection::open_in_memory()?, config, None)
    }

    fn with_connection(
        conn: Connection,
        config: LogConfig,
        path: Option<PathBuf>,
    ) -> Result<Self, LogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS records (
                record_offset INTEGER PRIMARY KEY,
                origin TEXT NOT NULL,
                origin_instance TEXT NOT NULL,
                origin_offset INTEGER NOT NULL,
                value BLOB NOT NULL,
                checksum INTEGER NOT NULL,
                UNIQUE (origin_instance, origin_offset)
            );
            CREATE INDEX IF NOT EXISTS records_by_origin ON records (origin, record_offset);",
        )?;

        // Generated once per database; later opens keep the stored id
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('instance', ?1)",
            params![format!("{:016x}", rand::random::<u64>())],
        )?;
        let instance: String = conn.query_row(
            "SELECT value FROM meta WHERE key = 'instance'",
            [],
            |row| row.get(0),
        )?;

        let next_offset: i64 = conn.query_row(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) FROM records",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            config,
            instance,
            path,
            inner: Mutex::new(Inner {
                conn: Some(conn),
                next_offset: next_offset as u64,
            }),
        })
    }

    /// Name stamped on locally produced records.
    pub fn origin(&self) -> &str {
        &self.config.origin
    }
}

impl CommitLog for SqliteLog {
    fn append(&self, mut record: Record) -> Result<u64, LogError> {
        let mut inner = self.inner.lock();
        let offset = inner.next_offset;
        let conn = inner.conn.as_ref().ok_or(LogError::Closed)?;

        if record.is_unstamped() {
            record.origin = self.config.origin.clone();
            record.origin_instance = self.instance.clone();
            record.origin_offset = offset;
        } else {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT record_offset FROM records WHERE origin_instance = ?1 AND origin_offset = ?2",
                    params![record.origin_instance, record.origin_offset as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(LogError::Duplicate {
                    origin_instance: record.origin_instance,
                    origin_offset: record.origin_offset,
                });
            }
        }

        conn.execute(
            "INSERT INTO records (record_offset, origin, origin_instance, origin_offset, value, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                offset as i64,
                record.origin,
                record.origin_instance,
                record.origin_offset as i64,
                record.value,
                record.checksum() as i64
            ],
        )?;

        inner.next_offset += 1;
        Ok(offset)
    }

    fn read(&self, offset: u64) -> Result<Record, LogError> {
        let inner = self.inner.lock();
        let conn = inner.conn.as_ref().ok_or(LogError::Closed)?;

        let row = conn
            .query_row(
                "SELECT origin, origin_instance, origin_offset, value, checksum
                 FROM records WHERE record_offset = ?1",
                params![offset as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let (origin, origin_instance, origin_offset, value, checksum) =
            row.ok_or(LogError::OffsetOutOfRange(offset))?;
        let record = Record {
            value,
            offset,
            origin,
            origin_instance,
            origin_offset: origin_offset as u64,
        };

        if record.checksum() != checksum as u32 {
            return Err(LogError::Corrupt(offset));
        }
        Ok(record)
    }

    fn next_offset(&self) -> Result<u64, LogError> {
        let inner = self.inner.lock();
        if inner.conn.is_none() {
            return Err(LogError::Closed);
        }
        Ok(inner.next_offset)
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn origin_watermark(&self, origin: &str) -> Result<Option<Watermark>, LogError> {
        let inner = self.inner.lock();
        let conn = inner.conn.as_ref().ok_or(LogError::Closed)?;
        let mark = conn
            .query_row(
                "SELECT origin_instance, MAX(origin_offset) FROM records
                 WHERE origin_instance = (
                     SELECT origin_instance FROM records
                     WHERE origin = ?1 ORDER BY record_offset DESC LIMIT 1
                 )
                 GROUP BY origin_instance",
                params![origin],
                |row| {
                    Ok(Watermark {
                        instance: row.get(0)?,
                        offset: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(mark)
    }

    fn close(&self) -> Result<(), LogError> {
        let conn = self.inner.lock().conn.take();
        match conn {
            Some(conn) => {
                conn.close().map_err(|(_, e)| LogError::Sqlite(e))?;
                tracing::debug!(path = ?self.path, "commit log closed");
                Ok(())
            }
            None => Err(LogError::Closed),
        }
    }
}
