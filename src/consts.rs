//! Общие константы протокола обновления (handshake, запросы, фрейминг)
//! и формата index-data.

// -------- Handshake --------
pub const HANDSHAKE_UPDATE: u8 = 15;
pub const HANDSHAKE_RESPONSE_OK: u8 = 0;

// Формат запроса handshake:
// [type u8=15][revision i32][key i32 x4], big-endian.
// Total = 21 bytes.
pub const HANDSHAKE_LEN: usize = 21;

// Session prelude: команды, отправляемые сразу после OK, до первого
// файлового запроса. Формат фиксирован сервером; трактуем как opaque.
pub const PRELUDE_ENCRYPTION_KEY: [u8; 4] = [4, 0, 0, 0];
pub const PRELUDE_CLIENT_INFO: [u8; 4] = [3, 0, 0, 0];

// -------- File requests --------
// [kind u8][index u8][archive u16], big-endian. Total = 4 bytes.
pub const REQUEST_PREFETCH: u8 = 0;
pub const REQUEST_URGENT: u8 = 1;

// Потолок конвейера: больше — сервер молча рвёт соединение.
pub const MAX_REQUESTS: usize = 19;

// -------- Response framing --------
// Ответ: [index u8][archive u16], далее контейнер
// [compression u8][size u32][payload] блоками по 512 байт.
// Каждый блок после первого начинается с маркера продолжения 0xFF.
pub const BLOCK_LEN: usize = 512;
pub const BLOCK_MARKER: u8 = 0xFF;
pub const RESPONSE_HDR_LEN: usize = 8;

// Верхняя граница на размер контейнера в ответе; больше — битый кадр.
pub const MAX_CONTAINER_LEN: usize = 64 * 1024 * 1024;

// -------- Indexes --------
// index = 255 — синтетическое пространство мастер-записей:
// (255, i) — метаданные индекса i, (255, 255) — мастер-индекс целиком.
pub const MASTER_INDEX: u8 = 255;

// Клиент эти индексы не запрашивает; сервер молча дропает такие запросы.
pub const UNUSED_INDEXES: [u8; 2] = [16, 23];

// -------- Container --------
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_BZIP2: u8 = 1;
pub const COMPRESSION_GZIP: u8 = 2;

// -------- Index data --------
pub const INDEX_PROTOCOL_MIN: u8 = 5;
pub const INDEX_PROTOCOL_MAX: u8 = 6;
pub const INDEX_FLAG_NAMES: u8 = 0x1;
pub const INDEX_FLAG_SIZES: u8 = 0x4;

// -------- Defaults --------
pub const DEFAULT_PORT: u16 = 43594;
