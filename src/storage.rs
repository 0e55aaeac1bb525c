//! Адаптер между деревом кеша в памяти и реляционным хранилищем.
//!
//! Держит указатель на текущий снапшот (драйвер подменяет его между load и
//! save) и staging-карту (index << 32 | archive) -> blob id для байтов,
//! скачанных в этом прогоне. Байты вставляются в data сразу при stage;
//! save лишь разрешает ссылки.

use anyhow::{anyhow, Result};
use log::debug;
use std::collections::HashMap;

use crate::consts::MASTER_INDEX;
use crate::container;
use crate::dao::{CacheDao, CacheEntry};
use crate::errors::UpdateError;
use crate::fs::{Index, Storage, Store};
use crate::index::IndexData;

pub struct CacheStorage<'a> {
    cache: CacheEntry,
    dao: &'a CacheDao<'a>,
    staged: HashMap<u64, i64>,
}

fn stage_key(index: u8, archive: u16) -> u64 {
    (index as u64) << 32 | archive as u64
}

impl<'a> CacheStorage<'a> {
    pub fn new(cache: CacheEntry, dao: &'a CacheDao<'a>) -> CacheStorage<'a> {
        CacheStorage {
            cache,
            dao,
            staged: HashMap::new(),
        }
    }

    pub fn cache_entry(&self) -> &CacheEntry {
        &self.cache
    }

    /// Rebind to a fresh snapshot before save.
    pub fn set_cache_entry(&mut self, cache: CacheEntry) {
        self.cache = cache;
    }

    fn save_index(&mut self, index: &mut Index) -> Result<()> {
        let data = index.to_index_data().write();
        // Контейнер мастер-записи не несёт ревизию на уровне конверта.
        let compressed = container::compress(index.compression, &data, -1)?;

        let id = match self.dao.find_archive(
            MASTER_INDEX as i32,
            index.id as i32,
            compressed.crc,
            0,
            index.revision,
        )? {
            Some(id) => id,
            None => {
                let data_id = self.dao.insert_data(&compressed.bytes)?;
                self.dao.insert_archive(
                    MASTER_INDEX as i32,
                    index.id as i32,
                    compressed.crc,
                    0,
                    index.revision,
                    data_id,
                )?
            }
        };
        self.dao.link_archive(self.cache.id, id)?;

        index.crc = compressed.crc;
        Ok(())
    }
}

impl Storage for CacheStorage<'_> {
    fn load(&mut self, store: &mut Store) -> Result<()> {
        for entry in self.dao.find_master_entries(&self.cache)? {
            let bytes = self
                .dao
                .read_data(entry.data_id)?
                .ok_or_else(|| anyhow!("missing index data for index {}", entry.archive_id))?;

            let res = container::decompress(&bytes)?;
            debug_assert_eq!(res.revision, -1, "index containers carry no envelope revision");

            let index_data = IndexData::read(&res.data)?;

            let index = store.ensure_index(entry.archive_id as u8);
            index.protocol = index_data.protocol;
            index.revision = index_data.revision;
            index.named = index_data.named;
            index.sized = index_data.sized;
            index.crc = res.crc;
            index.compression = res.compression;

            for ad in &index_data.archives {
                let archive = index.ensure_archive(ad.id);
                archive.name_hash = ad.name_hash;
                archive.crc = ad.crc;
                archive.revision = ad.revision;
                archive.compressed_size = ad.compressed_size;
                archive.decompressed_size = ad.decompressed_size;
                archive.files = ad.files.clone();
            }
        }
        Ok(())
    }

    fn save(&mut self, store: &mut Store) -> Result<()> {
        for index in store.indexes_mut() {
            self.save_index(index)?;

            for archive in index.archives() {
                let id = match self.dao.find_archive(
                    index.id as i32,
                    archive.id as i32,
                    archive.crc,
                    archive.name_hash,
                    archive.revision,
                )? {
                    Some(id) => id,
                    None => {
                        let data_id = *self
                            .staged
                            .get(&stage_key(index.id, archive.id))
                            .ok_or(UpdateError::MissingStagedData {
                                index: index.id,
                                archive: archive.id,
                            })?;
                        self.dao.insert_archive(
                            index.id as i32,
                            archive.id as i32,
                            archive.crc,
                            archive.name_hash,
                            archive.revision,
                            data_id,
                        )?
                    }
                };
                self.dao.link_archive(self.cache.id, id)?;
            }
        }
        Ok(())
    }

    fn stage(&mut self, index: u8, archive: u16, data: &[u8]) -> Result<()> {
        let data_id = self.dao.insert_data(data)?;
        self.staged.insert(stage_key(index, archive), data_id);
        debug!("staged {}/{} as data {}", index, archive, data_id);
        Ok(())
    }

    fn read(&mut self, index: u8, archive: u16) -> Result<Vec<u8>> {
        // Перечитывать только что скачанное в рамках одного прогона нельзя:
        // гидратация идёт только из закоммиченных снапшотов.
        Err(anyhow!(
            "reading archives back is not supported by the cache storage adapter ({}/{})",
            index,
            archive
        ))
    }
}
