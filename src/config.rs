//! Centralized configuration for the updater.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - UpdaterConfig::from_env() reads the RS_* variables; fluent with_*
//!   setters allow overrides (the CLI flags go through these).
//!
//! Recognized environment:
//! - RS_VERSION — client revision sent in the handshake (default 0)
//! - RS_HOST    — upstream hostname (default 127.0.0.1)
//! - RS_PORT    — upstream TCP port (default 43594)
//! - RS_DB      — SQLite database path (default cache.db)

use std::fmt;
use std::path::PathBuf;

use crate::consts::DEFAULT_PORT;

#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    /// Client revision sent in the handshake; also the revision recorded on
    /// snapshots this run creates.
    pub version: i32,

    /// Upstream update server.
    pub host: String,
    pub port: u16,

    /// SQLite database holding snapshots, descriptors and blobs.
    pub db_path: PathBuf,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            version: 0,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            db_path: PathBuf::from("cache.db"),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RS_VERSION") {
            if let Ok(n) = v.trim().parse::<i32>() {
                cfg.version = n;
            }
        }
        if let Ok(v) = std::env::var("RS_HOST") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.host = s.to_string();
            }
        }
        if let Ok(v) = std::env::var("RS_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                cfg.port = n;
            }
        }
        if let Ok(v) = std::env::var("RS_DB") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.db_path = PathBuf::from(s);
            }
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_db_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.db_path = path.into();
        self
    }
}

impl fmt::Display for UpdaterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UpdaterConfig {{ version: {}, host: {}, port: {}, db: {} }}",
            self.version,
            self.host,
            self.port,
            self.db_path.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides() {
        let cfg = UpdaterConfig::default()
            .with_version(215)
            .with_host("update.example.net")
            .with_port(43595)
            .with_db_path("/tmp/mirror.db");
        assert_eq!(cfg.version, 215);
        assert_eq!(cfg.host, "update.example.net");
        assert_eq!(cfg.port, 43595);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/mirror.db"));
    }

    #[test]
    fn defaults() {
        let cfg = UpdaterConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.db_path, PathBuf::from("cache.db"));
    }
}
