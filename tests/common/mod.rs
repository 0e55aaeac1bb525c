#![allow(dead_code)]

//! Скриптуемый фейковый апдейт-сервер для интеграционных тестов:
//! один handshake, затем единый цикл 4-байтовых сообщений (session prelude
//! игнорируется, файловые запросы обслуживаются из ServerSpec). Ответы
//! пишутся кадрами по 512 байт с маркерами продолжения.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use rsmirror::consts::{
    BLOCK_LEN, BLOCK_MARKER, HANDSHAKE_LEN, HANDSHAKE_RESPONSE_OK, HANDSHAKE_UPDATE,
    MASTER_INDEX, RESPONSE_HDR_LEN,
};
use rsmirror::container::{self, CompressionType};
use rsmirror::index::{ArchiveData, FileData, IndexData};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("rsmirror-{prefix}-{pid}-{t}-{id}"))
}

/// Один архив на сервере: контейнер и то, что про него объявляет индекс.
pub struct RemoteArchive {
    pub id: u16,
    pub advertised_crc: i32,
    pub revision: i32,
    pub blob: Vec<u8>,
}

pub struct RemoteIndex {
    pub id: u8,
    pub crc: i32,
    pub revision: i32,
    pub master_blob: Vec<u8>,
    pub archives: Vec<RemoteArchive>,
}

pub struct ServerSpec {
    pub handshake_response: u8,
    /// Позиция в списке — это id индекса; id обязаны идти подряд с нуля.
    pub indexes: Vec<RemoteIndex>,
}

pub fn archive(id: u16, revision: i32, payload: &[u8]) -> RemoteArchive {
    let compressed =
        container::compress(CompressionType::None, payload, -1).expect("compress test archive");
    RemoteArchive {
        id,
        advertised_crc: compressed.crc,
        revision,
        blob: compressed.bytes,
    }
}

/// Архив, у которого объявленный CRC не сходится с содержимым.
pub fn archive_with_bad_crc(id: u16, revision: i32, payload: &[u8]) -> RemoteArchive {
    let mut a = archive(id, revision, payload);
    a.advertised_crc ^= 0x5A5A_5A5A;
    a
}

pub fn remote_index(id: u8, revision: i32, archives: Vec<RemoteArchive>) -> RemoteIndex {
    let (master_blob, crc) = master_entry_blob(revision, &archives);
    RemoteIndex {
        id,
        crc,
        revision,
        master_blob,
        archives,
    }
}

/// Собрать контейнер мастер-записи (255, i) для набора архивов.
pub fn master_entry_blob(revision: i32, archives: &[RemoteArchive]) -> (Vec<u8>, i32) {
    let data = IndexData {
        protocol: 6,
        revision,
        named: false,
        sized: false,
        archives: archives
            .iter()
            .map(|a| ArchiveData {
                id: a.id,
                name_hash: 0,
                crc: a.advertised_crc,
                compressed_size: 0,
                decompressed_size: 0,
                revision: a.revision,
                files: vec![FileData { id: 0, name_hash: 0 }],
            })
            .collect(),
    };
    let compressed = container::compress(CompressionType::None, &data.write(), -1)
        .expect("compress master entry");
    (compressed.bytes, compressed.crc)
}

pub fn start_server(spec: ServerSpec) -> (SocketAddr, JoinHandle<Result<()>>) {
    for (i, index) in spec.indexes.iter().enumerate() {
        assert_eq!(index.id as usize, i, "index ids must be positional");
    }
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || serve_one(&listener, &spec));
    (addr, handle)
}

fn serve_one(listener: &TcpListener, spec: &ServerSpec) -> Result<()> {
    let (mut stream, _) = listener.accept()?;

    let mut handshake = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut handshake)?;
    if handshake[0] != HANDSHAKE_UPDATE {
        return Err(anyhow!("unexpected handshake type {}", handshake[0]));
    }
    stream.write_all(&[spec.handshake_response])?;
    if spec.handshake_response != HANDSHAKE_RESPONSE_OK {
        return Ok(());
    }

    loop {
        let mut msg = [0u8; 4];
        if !read_msg_or_eof(&mut stream, &mut msg)? {
            return Ok(());
        }
        match msg[0] {
            // prefetch / urgent file request
            0 | 1 => {
                let index = msg[1];
                let archive = BigEndian::read_u16(&msg[2..4]);
                let blob = lookup(spec, index, archive)?;
                write_response(&mut stream, index, archive, &blob)?;
            }
            // session prelude — ignored
            _ => {}
        }
    }
}

fn lookup(spec: &ServerSpec, index: u8, archive: u16) -> Result<Vec<u8>> {
    if index == MASTER_INDEX && archive == MASTER_INDEX as u16 {
        let mut records = Vec::with_capacity(spec.indexes.len() * 8);
        for ri in &spec.indexes {
            let mut rec = [0u8; 8];
            BigEndian::write_i32(&mut rec[0..4], ri.crc);
            BigEndian::write_i32(&mut rec[4..8], ri.revision);
            records.extend_from_slice(&rec);
        }
        let compressed = container::compress(CompressionType::None, &records, -1)?;
        return Ok(compressed.bytes);
    }
    if index == MASTER_INDEX {
        let ri = spec
            .indexes
            .iter()
            .find(|r| r.id as u16 == archive)
            .ok_or_else(|| anyhow!("master entry for unknown index {}", archive))?;
        return Ok(ri.master_blob.clone());
    }
    let ri = spec
        .indexes
        .iter()
        .find(|r| r.id == index)
        .ok_or_else(|| anyhow!("request for unknown index {}", index))?;
    let ra = ri
        .archives
        .iter()
        .find(|a| a.id == archive)
        .ok_or_else(|| anyhow!("request for unknown archive {}/{}", index, archive))?;
    Ok(ra.blob.clone())
}

/// [index u8][archive u16], первые 5 байт контейнера в заголовке,
/// остаток кадрами по 512 с маркером 0xFF.
fn write_response(w: &mut TcpStream, index: u8, archive: u16, container: &[u8]) -> Result<()> {
    assert!(container.len() >= 5);
    let mut out = Vec::with_capacity(container.len() + RESPONSE_HDR_LEN);
    out.push(index);
    out.extend_from_slice(&archive.to_be_bytes());
    out.extend_from_slice(&container[..5]);
    let mut block = RESPONSE_HDR_LEN;
    for &b in &container[5..] {
        if block == BLOCK_LEN {
            out.push(BLOCK_MARKER);
            block = 1;
        }
        out.push(b);
        block += 1;
    }
    w.write_all(&out)?;
    Ok(())
}

fn read_msg_or_eof(stream: &mut TcpStream, buf: &mut [u8]) -> Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        match stream.read(&mut buf[off..]) {
            Ok(0) if off == 0 => return Ok(false),
            Ok(0) => return Err(anyhow!("client closed mid-message")),
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Клиент мог оборвать соединение после получения ответа об ошибке.
            Err(e) if e.kind() == ErrorKind::ConnectionReset && off == 0 => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
