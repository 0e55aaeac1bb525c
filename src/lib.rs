// Базовые модули
pub mod config;
pub mod consts;
pub mod crc;
pub mod errors;

// Кодеки
pub mod container; // компрессионный конверт вокруг блобов
pub mod index; // index-data: настройки индекса + дескрипторы архивов

// Дерево кеша и персистентность
pub mod dao; // реляционный слой (cache/data/archive/cache_archive)
pub mod fs; // Store/Index/Archive + трейт Storage
pub mod storage; // staging-адаптер между деревом и dao

// Клиент и драйвер
pub mod client; // src/client/{mod,frames}.rs
pub mod updater;

// Удобные реэкспорты
pub use client::{CacheClient, ClientState, FileResult, IndexInfo};
pub use config::UpdaterConfig;
pub use container::CompressionType;
pub use dao::{ArchiveEntry, CacheDao, CacheEntry};
pub use errors::UpdateError;
pub use fs::{Archive, Index, Storage, Store};
pub use storage::CacheStorage;
pub use updater::{check_out_of_date, CacheUpdater};
