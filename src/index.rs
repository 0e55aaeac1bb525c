//! Index-data codec.
//!
//! Index data is the decompressed payload of a master entry (255, i): the
//! settings of index i plus one descriptor per archive it contains. Archive
//! and file ids are delta-encoded in ascending order. The per-archive file
//! tables live only here, so they are parsed and written back verbatim.
//!
//! Layout (big-endian):
//!   protocol u8              (5 or 6)
//!   revision i32             (protocol >= 6 only)
//!   flags    u8              (0x1 = named, 0x4 = sized)
//!   count    u16
//!   archive ids              count x u16 delta
//!   name hashes              count x i32          (named only)
//!   crcs                     count x i32
//!   sizes                    count x (u32, u32)   (sized only)
//!   revisions                count x i32
//!   file counts              count x u16
//!   file ids                 per archive: n x u16 delta
//!   file name hashes         per archive: n x i32 (named only)

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;

use crate::consts::{
    INDEX_FLAG_NAMES, INDEX_FLAG_SIZES, INDEX_PROTOCOL_MAX, INDEX_PROTOCOL_MIN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexData {
    pub protocol: u8,
    pub revision: i32,
    pub named: bool,
    pub sized: bool,
    pub archives: Vec<ArchiveData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveData {
    pub id: u16,
    pub name_hash: i32,
    pub crc: i32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub revision: i32,
    pub files: Vec<FileData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileData {
    pub id: u16,
    pub name_hash: i32,
}

impl IndexData {
    pub fn read(data: &[u8]) -> Result<IndexData> {
        let mut r = Cursor::new(data);

        let protocol = read_u8(&mut r)?;
        if !(INDEX_PROTOCOL_MIN..=INDEX_PROTOCOL_MAX).contains(&protocol) {
            return Err(anyhow!("unsupported index data protocol {}", protocol));
        }
        let revision = if protocol >= 6 { read_i32(&mut r)? } else { 0 };
        let flags = read_u8(&mut r)?;
        let named = flags & INDEX_FLAG_NAMES != 0;
        let sized = flags & INDEX_FLAG_SIZES != 0;

        let count = read_u16(&mut r)? as usize;
        let mut archives = Vec::with_capacity(count);

        let mut id = 0u16;
        for _ in 0..count {
            id = id.wrapping_add(read_u16(&mut r)?);
            archives.push(ArchiveData {
                id,
                name_hash: 0,
                crc: 0,
                compressed_size: 0,
                decompressed_size: 0,
                revision: 0,
                files: Vec::new(),
            });
        }

        if named {
            for archive in &mut archives {
                archive.name_hash = read_i32(&mut r)?;
            }
        }
        for archive in &mut archives {
            archive.crc = read_i32(&mut r)?;
        }
        if sized {
            for archive in &mut archives {
                archive.compressed_size = read_u32(&mut r)?;
                archive.decompressed_size = read_u32(&mut r)?;
            }
        }
        for archive in &mut archives {
            archive.revision = read_i32(&mut r)?;
        }

        let mut file_counts = Vec::with_capacity(count);
        for _ in 0..count {
            file_counts.push(read_u16(&mut r)? as usize);
        }
        for (archive, &n) in archives.iter_mut().zip(&file_counts) {
            let mut file_id = 0u16;
            archive.files.reserve(n);
            for _ in 0..n {
                file_id = file_id.wrapping_add(read_u16(&mut r)?);
                archive.files.push(FileData {
                    id: file_id,
                    name_hash: 0,
                });
            }
        }
        if named {
            for archive in &mut archives {
                for file in &mut archive.files {
                    file.name_hash = read_i32(&mut r)?;
                }
            }
        }

        Ok(IndexData {
            protocol,
            revision,
            named,
            sized,
            archives,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.push(self.protocol);
        if self.protocol >= 6 {
            push_i32(&mut out, self.revision);
        }
        let mut flags = 0u8;
        if self.named {
            flags |= INDEX_FLAG_NAMES;
        }
        if self.sized {
            flags |= INDEX_FLAG_SIZES;
        }
        out.push(flags);

        push_u16(&mut out, self.archives.len() as u16);
        let mut prev = 0u16;
        for archive in &self.archives {
            push_u16(&mut out, archive.id.wrapping_sub(prev));
            prev = archive.id;
        }

        if self.named {
            for archive in &self.archives {
                push_i32(&mut out, archive.name_hash);
            }
        }
        for archive in &self.archives {
            push_i32(&mut out, archive.crc);
        }
        if self.sized {
            for archive in &self.archives {
                push_u32(&mut out, archive.compressed_size);
                push_u32(&mut out, archive.decompressed_size);
            }
        }
        for archive in &self.archives {
            push_i32(&mut out, archive.revision);
        }

        for archive in &self.archives {
            push_u16(&mut out, archive.files.len() as u16);
        }
        for archive in &self.archives {
            let mut prev = 0u16;
            for file in &archive.files {
                push_u16(&mut out, file.id.wrapping_sub(prev));
                prev = file.id;
            }
        }
        if self.named {
            for archive in &self.archives {
                for file in &archive.files {
                    push_i32(&mut out, file.name_hash);
                }
            }
        }

        out
    }
}

fn read_u8(r: &mut Cursor<&[u8]>) -> Result<u8> {
    r.read_u8().map_err(|_| anyhow!("index data truncated"))
}

fn read_u16(r: &mut Cursor<&[u8]>) -> Result<u16> {
    r.read_u16::<BigEndian>()
        .map_err(|_| anyhow!("index data truncated"))
}

fn read_u32(r: &mut Cursor<&[u8]>) -> Result<u32> {
    r.read_u32::<BigEndian>()
        .map_err(|_| anyhow!("index data truncated"))
}

fn read_i32(r: &mut Cursor<&[u8]>) -> Result<i32> {
    r.read_i32::<BigEndian>()
        .map_err(|_| anyhow!("index data truncated"))
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    out.extend_from_slice(&b);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(named: bool, sized: bool) -> IndexData {
        IndexData {
            protocol: 6,
            revision: 913,
            named,
            sized,
            archives: vec![
                ArchiveData {
                    id: 0,
                    name_hash: if named { 0x1111_2222 } else { 0 },
                    crc: -559038737,
                    compressed_size: if sized { 120 } else { 0 },
                    decompressed_size: if sized { 512 } else { 0 },
                    revision: 3,
                    files: vec![
                        FileData {
                            id: 0,
                            name_hash: if named { 77 } else { 0 },
                        },
                        FileData {
                            id: 5,
                            name_hash: if named { -8 } else { 0 },
                        },
                    ],
                },
                // Non-contiguous id exercises the delta encoding.
                ArchiveData {
                    id: 40,
                    name_hash: if named { -1 } else { 0 },
                    crc: 12345,
                    compressed_size: if sized { 9 } else { 0 },
                    decompressed_size: if sized { 9 } else { 0 },
                    revision: 1,
                    files: vec![FileData {
                        id: 2,
                        name_hash: if named { 1 } else { 0 },
                    }],
                },
            ],
        }
    }

    #[test]
    fn roundtrip_plain() -> Result<()> {
        let data = sample(false, false);
        assert_eq!(IndexData::read(&data.write())?, data);
        Ok(())
    }

    #[test]
    fn roundtrip_named_and_sized() -> Result<()> {
        for (named, sized) in [(true, false), (false, true), (true, true)] {
            let data = sample(named, sized);
            assert_eq!(IndexData::read(&data.write())?, data);
        }
        Ok(())
    }

    #[test]
    fn roundtrip_protocol_5_has_no_revision_field() -> Result<()> {
        let mut data = sample(false, false);
        data.protocol = 5;
        data.revision = 0;
        let bytes = data.write();
        // protocol + flags + count, no i32 revision in between
        assert_eq!(bytes[0], 5);
        assert_eq!(IndexData::read(&bytes)?, data);
        Ok(())
    }

    #[test]
    fn rejects_unknown_protocol_and_truncation() {
        assert!(IndexData::read(&[9]).is_err());
        let bytes = sample(false, false).write();
        assert!(IndexData::read(&bytes[..bytes.len() - 1]).is_err());
        assert!(IndexData::read(&[]).is_err());
    }

    #[test]
    fn empty_index_roundtrips() -> Result<()> {
        let data = IndexData {
            protocol: 6,
            revision: 1,
            named: false,
            sized: false,
            archives: Vec::new(),
        };
        assert_eq!(IndexData::read(&data.write())?, data);
        Ok(())
    }
}
