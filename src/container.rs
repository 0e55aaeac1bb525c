//! Container codec — the compression envelope around every stored blob.
//!
//! Layout (big-endian):
//!   [compression u8][length u32][payload: length bytes][revision u16?]
//!
//! - compression: 0 = none, 1 = bzip2, 2 = gzip;
//! - bzip2 payloads omit the 4-byte "BZh1" stream header on the wire; it is
//!   re-attached on decompress and stripped on compress;
//! - the revision trailer is absent when revision == -1 (always the case for
//!   index data written by this crate);
//! - crc is CRC-32 over the first 5 + length bytes, trailer excluded.
//!
//! Invariant: compress(decompress(c).data) must be byte-identical to c for
//! containers produced by this codec, otherwise identical index data stops
//! deduplicating across snapshots.

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Write};

use crate::consts::{COMPRESSION_BZIP2, COMPRESSION_GZIP, COMPRESSION_NONE};
use crate::crc::crc32;
use crate::errors::UpdateError;

const HDR_LEN: usize = 5;
const BZIP2_HEADER: &[u8; 4] = b"BZh1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Bzip2,
    Gzip,
}

impl CompressionType {
    pub fn to_u8(self) -> u8 {
        match self {
            CompressionType::None => COMPRESSION_NONE,
            CompressionType::Bzip2 => COMPRESSION_BZIP2,
            CompressionType::Gzip => COMPRESSION_GZIP,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            COMPRESSION_NONE => Some(CompressionType::None),
            COMPRESSION_BZIP2 => Some(CompressionType::Bzip2),
            COMPRESSION_GZIP => Some(CompressionType::Gzip),
            _ => None,
        }
    }
}

/// Decompressed container: payload plus envelope metadata.
#[derive(Debug, Clone)]
pub struct Container {
    pub compression: CompressionType,
    pub data: Vec<u8>,
    /// CRC-32 over the compressed image (trailer excluded).
    pub crc: i32,
    /// Trailer revision; -1 when the trailer is absent.
    pub revision: i32,
}

/// Compressed container image plus its CRC.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub crc: i32,
}

pub fn decompress(bytes: &[u8]) -> Result<Container> {
    if bytes.len() < HDR_LEN {
        return Err(anyhow!(UpdateError::Protocol(format!(
            "container too short: {} bytes",
            bytes.len()
        ))));
    }
    let compression = CompressionType::from_u8(bytes[0]).ok_or_else(|| {
        UpdateError::Protocol(format!("unknown container compression {}", bytes[0]))
    })?;
    let length = BigEndian::read_u32(&bytes[1..5]) as usize;
    if bytes.len() < HDR_LEN + length {
        return Err(anyhow!(UpdateError::Protocol(format!(
            "container truncated: {} of {} payload bytes",
            bytes.len() - HDR_LEN,
            length
        ))));
    }

    let crc = crc32(&bytes[..HDR_LEN + length]);
    let payload = &bytes[HDR_LEN..HDR_LEN + length];

    let data = match compression {
        CompressionType::None => payload.to_vec(),
        CompressionType::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut out)
                .context("gzip decompress")?;
            out
        }
        CompressionType::Bzip2 => {
            // Wire payloads are headerless; the decoder wants a full stream.
            let mut framed = Vec::with_capacity(BZIP2_HEADER.len() + payload.len());
            framed.extend_from_slice(BZIP2_HEADER);
            framed.extend_from_slice(payload);
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(framed.as_slice())
                .read_to_end(&mut out)
                .context("bzip2 decompress")?;
            out
        }
    };

    let rest = &bytes[HDR_LEN + length..];
    let revision = if rest.len() >= 2 {
        BigEndian::read_u16(rest) as i32
    } else {
        -1
    };

    Ok(Container {
        compression,
        data,
        crc,
        revision,
    })
}

pub fn compress(compression: CompressionType, data: &[u8], revision: i32) -> Result<Compressed> {
    let payload = match compression {
        CompressionType::None => data.to_vec(),
        CompressionType::Gzip => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).context("gzip compress")?;
            enc.finish().context("gzip compress")?
        }
        CompressionType::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(1));
            enc.write_all(data).context("bzip2 compress")?;
            let full = enc.finish().context("bzip2 compress")?;
            if full.len() < BZIP2_HEADER.len() || &full[..4] != BZIP2_HEADER {
                return Err(anyhow!("unexpected bzip2 stream header"));
            }
            full[BZIP2_HEADER.len()..].to_vec()
        }
    };

    let mut bytes = Vec::with_capacity(HDR_LEN + payload.len() + 2);
    bytes.push(compression.to_u8());
    let mut len4 = [0u8; 4];
    BigEndian::write_u32(&mut len4, payload.len() as u32);
    bytes.extend_from_slice(&len4);
    bytes.extend_from_slice(&payload);

    let crc = crc32(&bytes);

    if revision != -1 {
        let mut rev2 = [0u8; 2];
        BigEndian::write_u16(&mut rev2, revision as u16);
        bytes.extend_from_slice(&rev2);
    }

    Ok(Compressed { bytes, crc })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"the quick brown fox jumps over the lazy dog";

    #[test]
    fn roundtrip_all_compression_types() -> Result<()> {
        for ct in [
            CompressionType::None,
            CompressionType::Bzip2,
            CompressionType::Gzip,
        ] {
            let compressed = compress(ct, SAMPLE, -1)?;
            let container = decompress(&compressed.bytes)?;
            assert_eq!(container.compression, ct);
            assert_eq!(container.data, SAMPLE);
            assert_eq!(container.crc, compressed.crc);
            assert_eq!(container.revision, -1);
        }
        Ok(())
    }

    #[test]
    fn recompression_is_byte_stable() -> Result<()> {
        for ct in [
            CompressionType::None,
            CompressionType::Bzip2,
            CompressionType::Gzip,
        ] {
            let first = compress(ct, SAMPLE, -1)?;
            let container = decompress(&first.bytes)?;
            let second = compress(ct, &container.data, -1)?;
            assert_eq!(first.bytes, second.bytes, "{:?} recompression drifted", ct);
            assert_eq!(first.crc, second.crc);
        }
        Ok(())
    }

    #[test]
    fn revision_trailer_roundtrip() -> Result<()> {
        let compressed = compress(CompressionType::None, SAMPLE, 42)?;
        let container = decompress(&compressed.bytes)?;
        assert_eq!(container.revision, 42);
        // Trailer must not affect the crc.
        let bare = compress(CompressionType::None, SAMPLE, -1)?;
        assert_eq!(container.crc, bare.crc);
        Ok(())
    }

    #[test]
    fn crc_tracks_compressed_image() -> Result<()> {
        let a = compress(CompressionType::None, b"aaaa", -1)?;
        let b = compress(CompressionType::None, b"aaab", -1)?;
        assert_ne!(a.crc, b.crc);
        Ok(())
    }

    #[test]
    fn rejects_unknown_compression_and_truncation() {
        assert!(decompress(&[9, 0, 0, 0, 0]).is_err());
        assert!(decompress(&[0, 0, 0, 0, 4, 1, 2]).is_err());
        assert!(decompress(&[0, 0]).is_err());
    }
}
