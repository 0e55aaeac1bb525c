//! Reconciliation driver: one transaction per run, handshake, manifest
//! comparison, download, snapshot commit.
//!
//! A run that changes nothing (up to date, handshake rejected) returns
//! success without committing; every fatal error rolls the transaction back
//! by dropping it, so the previous snapshot stays the most recent one.

use anyhow::{Context, Result};
use log::{info, warn};
use rusqlite::Connection;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::{CacheClient, IndexInfo};
use crate::config::UpdaterConfig;
use crate::consts::HANDSHAKE_RESPONSE_OK;
use crate::dao::{self, ArchiveEntry, CacheDao};
use crate::fs::{Storage, Store};
use crate::storage::CacheStorage;

pub struct CacheUpdater {
    cfg: UpdaterConfig,
}

impl CacheUpdater {
    pub fn new(cfg: UpdaterConfig) -> CacheUpdater {
        CacheUpdater { cfg }
    }

    pub fn update(&self) -> Result<()> {
        let mut conn = Connection::open(&self.cfg.db_path)
            .with_context(|| format!("open database {}", self.cfg.db_path.display()))?;
        dao::ensure_schema(&conn)?;

        let tx = conn.transaction().context("begin transaction")?;
        let commit = run(&self.cfg, CacheDao::new(&tx))?;
        if commit {
            tx.commit().context("commit transaction")?;
            info!("Done!");
        }
        Ok(())
    }
}

/// Returns true when a snapshot was written and the transaction must commit.
fn run(cfg: &UpdaterConfig, dao: CacheDao<'_>) -> Result<bool> {
    let (cache, created) = match dao.find_most_recent()? {
        Some(cache) => (cache, false),
        None => (dao.create_cache(cfg.version, now_secs())?, true),
    };

    let mut storage = CacheStorage::new(cache, &dao);
    let mut store = Store::new();
    storage.load(&mut store)?;

    let mut client = CacheClient::connect(&cfg.host, cfg.port, cfg.version)?;

    let response = client.handshake()?;
    if response != HANDSHAKE_RESPONSE_OK {
        warn!("Out of date!");
        return Ok(false);
    }

    let indexes = client.request_indexes()?;
    let entries = dao.find_master_entries(storage.cache_entry())?;
    if !check_out_of_date(&indexes, &entries) {
        info!("All up to date.");
        return Ok(false);
    }

    client.download(&mut store, &mut storage)?;
    client.close()?;

    // Ревизия снапшота — всегда сконфигурированная ревизия клиента,
    // не ревизия удалённого мастер-индекса.
    if !created {
        let new_cache = dao.create_cache(cfg.version, now_secs())?;
        storage.set_cache_entry(new_cache);
    }

    info!("Saving new cache");
    storage.save(&mut store)?;

    Ok(true)
}

/// False iff the remote manifest and the stored master entries agree
/// positionally on (id, crc, revision).
pub fn check_out_of_date(remote: &[IndexInfo], local: &[ArchiveEntry]) -> bool {
    if remote.len() != local.len() {
        return true;
    }
    remote.iter().zip(local).any(|(r, l)| {
        i32::from(r.id) != l.archive_id || r.revision != l.revision || r.crc != l.crc
    })
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: u8, crc: i32, revision: i32) -> IndexInfo {
        IndexInfo { id, crc, revision }
    }

    fn local(archive_id: i32, crc: i32, revision: i32) -> ArchiveEntry {
        ArchiveEntry {
            id: 0,
            index_id: 255,
            archive_id,
            crc,
            name_hash: 0,
            revision,
            data_id: 0,
        }
    }

    #[test]
    fn equal_manifests_are_up_to_date() {
        let r = vec![remote(0, 111, 1), remote(1, 222, 5)];
        let l = vec![local(0, 111, 1), local(1, 222, 5)];
        assert!(!check_out_of_date(&r, &l));
    }

    #[test]
    fn count_mismatch_is_out_of_date() {
        let r = vec![remote(0, 111, 1)];
        assert!(check_out_of_date(&r, &[]));
        assert!(check_out_of_date(&[], &[local(0, 111, 1)]));
    }

    #[test]
    fn any_field_mismatch_is_out_of_date() {
        let l = vec![local(0, 111, 1)];
        assert!(check_out_of_date(&[remote(0, 112, 1)], &l));
        assert!(check_out_of_date(&[remote(0, 111, 2)], &l));
        // Positional id shift counts as a difference too.
        assert!(check_out_of_date(&[remote(1, 111, 1)], &l));
    }

    #[test]
    fn empty_both_is_up_to_date() {
        assert!(!check_out_of_date(&[], &[]));
    }
}
