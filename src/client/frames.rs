//! Сборка файловых ответов из 512-байтовых кадров.
//!
//! Формат ответа:
//!   [index u8][archive u16][compression u8][size u32]  -- 8-байтовый заголовок
//! Контейнер для проверки CRC и декомпрессии — это [compression][size][data],
//! то есть size + 5 байт, из которых первые пять приходят в заголовке.
//! Остаток данных идёт кадрами по 512 байт; каждый кадр после первого
//! начинается с маркера продолжения 0xFF, который отбрасывается.
//!
//! Чистый EOF на границе ответа возвращает None (поток закрыт штатно).

use byteorder::{BigEndian, ByteOrder};
use std::io::{ErrorKind, Read};

use crate::consts::{BLOCK_LEN, BLOCK_MARKER, MAX_CONTAINER_LEN, RESPONSE_HDR_LEN};
use crate::errors::UpdateError;

/// Один собранный ответ: ключ запроса и полный контейнер.
#[derive(Debug, Clone)]
pub struct Response {
    pub index: u8,
    pub archive: u16,
    pub container: Vec<u8>,
}

/// Прочитать следующий ответ. None — чистый EOF перед заголовком.
pub fn read_response<R: Read>(r: &mut R) -> Result<Option<Response>, UpdateError> {
    let mut hdr = [0u8; RESPONSE_HDR_LEN];
    if !read_exact_or_eof(r, &mut hdr)? {
        return Ok(None);
    }

    let index = hdr[0];
    let archive = BigEndian::read_u16(&hdr[1..3]);
    let size = BigEndian::read_u32(&hdr[4..8]) as usize;
    let total = size + 5;
    if total > MAX_CONTAINER_LEN {
        return Err(UpdateError::Protocol(format!(
            "response {}/{} advertises {} bytes (max {})",
            index, archive, total, MAX_CONTAINER_LEN
        )));
    }

    let mut container = Vec::with_capacity(total);
    // Байт компрессии и префикс длины — часть контейнера.
    container.extend_from_slice(&hdr[3..8]);

    // Заголовок занял первые 8 байт текущего кадра.
    let mut block = RESPONSE_HDR_LEN;
    let mut chunk = [0u8; BLOCK_LEN];
    while container.len() < total {
        if block == BLOCK_LEN {
            let mut marker = [0u8; 1];
            read_all(r, &mut marker)?;
            if marker[0] != BLOCK_MARKER {
                return Err(UpdateError::Protocol(format!(
                    "bad continuation marker {:#04x} in response {}/{}",
                    marker[0], index, archive
                )));
            }
            block = 1;
        }
        let want = (BLOCK_LEN - block).min(total - container.len());
        read_all(r, &mut chunk[..want])?;
        container.extend_from_slice(&chunk[..want]);
        block += want;
    }

    Ok(Some(Response {
        index,
        archive,
        container,
    }))
}

/// read_exact, но Ok(false) при EOF до первого байта.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, UpdateError> {
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) if off == 0 => return Ok(false),
            Ok(0) => {
                return Err(UpdateError::Network(format!(
                    "connection closed mid-response ({} of {} bytes)",
                    off,
                    buf.len()
                )))
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(UpdateError::Network(format!("read: {}", e))),
        }
    }
    Ok(true)
}

fn read_all<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), UpdateError> {
    r.read_exact(buf)
        .map_err(|e| UpdateError::Network(format!("read: {}", e)))
}
