//! Typed error kinds surfaced by the updater.
//!
//! Functions return `anyhow::Result`; an `UpdateError` is raised where the
//! failure class matters (abort decisions, tests) and converts into
//! `anyhow::Error` at the call site. Everything else is plain context on the
//! underlying I/O or SQL error. A handshake rejection is not an error — the
//! driver surfaces the response code as a normal return.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// Socket connect/read/write failure. Aborts the run.
    #[error("network: {0}")]
    Network(String),

    /// Malformed frame or a response nobody asked for. Aborts the run.
    #[error("protocol: {0}")]
    Protocol(String),

    /// CRC-32 of a downloaded archive does not match the advertised value.
    #[error("crc mismatch on downloaded archive {index}/{archive}: {actual} != {expected}")]
    Integrity {
        index: u8,
        archive: u16,
        expected: i32,
        actual: i32,
    },

    /// The storage adapter was asked to persist an archive nobody staged.
    /// Programming error in the download path.
    #[error("no data staged for {index}/{archive}")]
    MissingStagedData { index: u8, archive: u16 },

    /// Unique-constraint violation; another writer touched the database.
    #[error("database conflict: {0}")]
    DbConflict(String),
}
