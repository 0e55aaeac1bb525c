use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info};
use std::path::PathBuf;

use rsmirror::{CacheUpdater, UpdaterConfig};

/// Mirror a remote game asset cache into a local content-addressed store.
#[derive(Parser, Debug)]
#[command(name = "rsmirror", version)]
struct Args {
    /// Upstream host (overrides RS_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Upstream port (overrides RS_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Client revision for the handshake (overrides RS_VERSION).
    #[arg(long)]
    revision: Option<i32>,

    /// SQLite database path (overrides RS_DB).
    #[arg(long)]
    db: Option<PathBuf>,
}

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    let args = Args::parse();
    let mut cfg = UpdaterConfig::from_env();
    if let Some(host) = args.host {
        cfg = cfg.with_host(host);
    }
    if let Some(port) = args.port {
        cfg = cfg.with_port(port);
    }
    if let Some(revision) = args.revision {
        cfg = cfg.with_version(revision);
    }
    if let Some(db) = args.db {
        cfg = cfg.with_db_path(db);
    }

    info!("{}", cfg);

    if let Err(e) = CacheUpdater::new(cfg).update() {
        // Логируем ошибку и выходим с кодом 1.
        error!("{:?}", e);
        std::process::exit(1);
    }
}
