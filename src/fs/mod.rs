//! In-memory cache tree: a `Store` of `Index`es, each holding its `Archive`
//! descriptors. The tree is transient — rebuilt from the most recent snapshot
//! on every run and written back through a [`Storage`] implementation.
//!
//! Archive payloads are not held here; the tree carries descriptors only.

use anyhow::Result;

use crate::container::CompressionType;
use crate::index::{ArchiveData, FileData, IndexData};

/// Seam between the in-memory tree and whatever persists it.
pub trait Storage {
    /// Rehydrate the tree from the current snapshot.
    fn load(&mut self, store: &mut Store) -> Result<()>;

    /// Persist the tree into the current snapshot.
    fn save(&mut self, store: &mut Store) -> Result<()>;

    /// Hand over freshly downloaded archive bytes keyed by (index, archive).
    fn stage(&mut self, index: u8, archive: u16, data: &[u8]) -> Result<()>;

    /// Read archive bytes back. Not every implementation supports this.
    fn read(&mut self, index: u8, archive: u16) -> Result<Vec<u8>>;
}

#[derive(Debug, Default)]
pub struct Store {
    indexes: Vec<Index>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter()
    }

    pub fn indexes_mut(&mut self) -> impl Iterator<Item = &mut Index> {
        self.indexes.iter_mut()
    }

    pub fn find_index(&self, id: u8) -> Option<&Index> {
        self.indexes.iter().find(|i| i.id == id)
    }

    pub fn find_index_mut(&mut self, id: u8) -> Option<&mut Index> {
        self.indexes.iter_mut().find(|i| i.id == id)
    }

    /// Existing index or a freshly inserted one (kept sorted by id).
    pub fn ensure_index(&mut self, id: u8) -> &mut Index {
        if let Some(pos) = self.indexes.iter().position(|i| i.id == id) {
            return &mut self.indexes[pos];
        }
        let pos = self
            .indexes
            .iter()
            .position(|i| i.id > id)
            .unwrap_or(self.indexes.len());
        self.indexes.insert(pos, Index::new(id));
        &mut self.indexes[pos]
    }

    /// Returns false if the index was not present.
    pub fn remove_index(&mut self, id: u8) -> bool {
        let before = self.indexes.len();
        self.indexes.retain(|i| i.id != id);
        self.indexes.len() != before
    }
}

#[derive(Debug)]
pub struct Index {
    pub id: u8,
    pub protocol: u8,
    pub revision: i32,
    pub crc: i32,
    pub named: bool,
    pub sized: bool,
    pub compression: CompressionType,
    archives: Vec<Archive>,
}

impl Index {
    pub fn new(id: u8) -> Index {
        Index {
            id,
            protocol: 6,
            revision: 0,
            crc: 0,
            named: false,
            sized: false,
            compression: CompressionType::None,
            archives: Vec::new(),
        }
    }

    pub fn archives(&self) -> impl Iterator<Item = &Archive> {
        self.archives.iter()
    }

    pub fn find_archive(&self, id: u16) -> Option<&Archive> {
        self.archives.iter().find(|a| a.id == id)
    }

    pub fn ensure_archive(&mut self, id: u16) -> &mut Archive {
        if let Some(pos) = self.archives.iter().position(|a| a.id == id) {
            return &mut self.archives[pos];
        }
        let pos = self
            .archives
            .iter()
            .position(|a| a.id > id)
            .unwrap_or(self.archives.len());
        self.archives.insert(pos, Archive::new(id));
        &mut self.archives[pos]
    }

    pub fn remove_archive(&mut self, id: u16) -> bool {
        let before = self.archives.len();
        self.archives.retain(|a| a.id != id);
        self.archives.len() != before
    }

    /// Re-serialize the index settings and archive descriptors.
    pub fn to_index_data(&self) -> IndexData {
        IndexData {
            protocol: self.protocol,
            revision: self.revision,
            named: self.named,
            sized: self.sized,
            archives: self
                .archives
                .iter()
                .map(|a| ArchiveData {
                    id: a.id,
                    name_hash: a.name_hash,
                    crc: a.crc,
                    compressed_size: a.compressed_size,
                    decompressed_size: a.decompressed_size,
                    revision: a.revision,
                    files: a.files.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct Archive {
    pub id: u16,
    pub name_hash: i32,
    pub crc: i32,
    pub revision: i32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub files: Vec<FileData>,
}

impl Archive {
    pub fn new(id: u16) -> Archive {
        Archive {
            id,
            name_hash: 0,
            crc: 0,
            revision: 0,
            compressed_size: 0,
            decompressed_size: 0,
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_index_keeps_ids_sorted_and_deduped() {
        let mut store = Store::new();
        store.ensure_index(7);
        store.ensure_index(2);
        store.ensure_index(7).revision = 5;
        let ids: Vec<u8> = store.indexes().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 7]);
        assert_eq!(store.find_index(7).unwrap().revision, 5);
    }

    #[test]
    fn remove_index_reports_presence() {
        let mut store = Store::new();
        store.ensure_index(3);
        assert!(store.remove_index(3));
        assert!(!store.remove_index(3));
        assert!(store.find_index(3).is_none());
    }

    #[test]
    fn index_data_roundtrip_through_tree() {
        let mut store = Store::new();
        let index = store.ensure_index(0);
        index.revision = 11;
        index.named = true;
        let archive = index.ensure_archive(4);
        archive.crc = 99;
        archive.name_hash = -3;
        archive.revision = 2;
        archive.files.push(FileData { id: 0, name_hash: 1 });

        let data = index.to_index_data();
        assert_eq!(data.revision, 11);
        assert_eq!(data.archives.len(), 1);
        assert_eq!(data.archives[0].id, 4);
        assert_eq!(data.archives[0].files.len(), 1);
    }
}
