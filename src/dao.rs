//! Relational persistence for snapshots, archive descriptors and blobs.
//!
//! Tables:
//! - cache(id, revision, date)                — one row per snapshot
//! - data(id, data)                           — immutable blobs
//! - archive(id, "index", archive, crc, revision, name, data_id)
//!   with a unique index on ("index", archive, crc, revision, name):
//!   descriptors dedup across snapshots by the full 5-tuple
//! - cache_archive(cache_id, archive_id)      — snapshot membership
//!
//! All calls share the run's transaction; the high-volume statements
//! (find_archive, link_archive, insert_archive, insert_data) go through the
//! connection's prepared-statement cache.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::UpdateError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
  id       INTEGER PRIMARY KEY AUTOINCREMENT,
  revision INTEGER NOT NULL,
  date     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS data (
  id   INTEGER PRIMARY KEY AUTOINCREMENT,
  data BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS archive (
  id       INTEGER PRIMARY KEY AUTOINCREMENT,
  "index"  INTEGER NOT NULL,
  archive  INTEGER NOT NULL,
  crc      INTEGER NOT NULL,
  revision INTEGER NOT NULL,
  name     INTEGER NOT NULL,
  data_id  INTEGER NOT NULL REFERENCES data(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS archive_tuple
  ON archive ("index", archive, crc, revision, name);
CREATE TABLE IF NOT EXISTS cache_archive (
  cache_id   INTEGER NOT NULL REFERENCES cache(id),
  archive_id INTEGER NOT NULL REFERENCES archive(id),
  PRIMARY KEY (cache_id, archive_id)
);
"#;

/// One snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: i64,
    pub revision: i32,
    /// Unix seconds.
    pub date: i64,
}

/// One archive-descriptor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub id: i64,
    pub index_id: i32,
    pub archive_id: i32,
    pub crc: i32,
    pub name_hash: i32,
    pub revision: i32,
    pub data_id: i64,
}

/// Create the schema if the database is fresh.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("create cache schema")
}

pub struct CacheDao<'a> {
    conn: &'a Connection,
}

impl<'a> CacheDao<'a> {
    /// Borrow the run's transaction (derefs to a connection).
    pub fn new(conn: &'a Connection) -> CacheDao<'a> {
        CacheDao { conn }
    }

    pub fn create_cache(&self, revision: i32, date: i64) -> Result<CacheEntry> {
        self.conn
            .execute(
                "INSERT INTO cache (revision, date) VALUES (?1, ?2)",
                params![revision, date],
            )
            .map_err(db_err)?;
        Ok(CacheEntry {
            id: self.conn.last_insert_rowid(),
            revision,
            date,
        })
    }

    pub fn find_most_recent(&self) -> Result<Option<CacheEntry>> {
        self.conn
            .query_row(
                "SELECT id, revision, date FROM cache ORDER BY revision DESC, date DESC LIMIT 1",
                [],
                |row| {
                    Ok(CacheEntry {
                        id: row.get(0)?,
                        revision: row.get(1)?,
                        date: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Master entries ("index" = 255) of a snapshot, ordered by index id so
    /// the list compares positionally against the remote manifest.
    pub fn find_master_entries(&self, cache: &CacheEntry) -> Result<Vec<ArchiveEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.\"index\", a.archive, a.crc, a.name, a.revision, a.data_id \
             FROM cache_archive ca JOIN archive a ON ca.archive_id = a.id \
             WHERE ca.cache_id = ?1 AND a.\"index\" = ?2 ORDER BY a.archive",
        )?;
        let rows = stmt.query_map(params![cache.id, i64::from(crate::consts::MASTER_INDEX)], |row| {
            Ok(ArchiveEntry {
                id: row.get(0)?,
                index_id: row.get(1)?,
                archive_id: row.get(2)?,
                crc: row.get(3)?,
                name_hash: row.get(4)?,
                revision: row.get(5)?,
                data_id: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Exact 5-tuple lookup; this is what dedups descriptors across snapshots.
    pub fn find_archive(
        &self,
        index: i32,
        archive: i32,
        crc: i32,
        name: i32,
        revision: i32,
    ) -> Result<Option<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id FROM archive \
             WHERE \"index\" = ?1 AND archive = ?2 AND crc = ?3 AND revision = ?4 AND name = ?5",
        )?;
        stmt.query_row(params![index, archive, crc, revision, name], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_err)
    }

    pub fn insert_data(&self, data: &[u8]) -> Result<i64> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO data (data) VALUES (?1)")?;
        stmt.execute(params![data]).map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn read_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row("SELECT data FROM data WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
    }

    pub fn insert_archive(
        &self,
        index: i32,
        archive: i32,
        crc: i32,
        name: i32,
        revision: i32,
        data_id: i64,
    ) -> Result<i64> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO archive (\"index\", archive, crc, revision, name, data_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![index, archive, crc, revision, name, data_id])
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Idempotent per (cache, archive) pair.
    pub fn link_archive(&self, cache_id: i64, archive_id: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO cache_archive (cache_id, archive_id) VALUES (?1, ?2)",
        )?;
        stmt.execute(params![cache_id, archive_id]).map_err(db_err)?;
        Ok(())
    }
}

/// Constraint violations mean a concurrent writer; everything else is passed
/// through with its original message.
fn db_err(e: rusqlite::Error) -> anyhow::Error {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            UpdateError::DbConflict(e.to_string()).into()
        }
        _ => e.into(),
    }
}
