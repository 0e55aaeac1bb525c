//! Update-protocol client: one TCP connection, a strictly sequential
//! handshake state machine and a bounded pipeline of outstanding file
//! requests.
//!
//! The driver thread writes requests (batched through a BufWriter, flushed
//! on demand); a reader thread reassembles framed responses and matches them
//! to pending requests by (index, archive). One mutex plus condvar covers
//! the pending queue, the finished-map for flushing requests, the verified
//! results awaiting staging and the abort slot. A CRC failure or a malformed
//! frame is recorded in the abort slot instead of unwinding out of the
//! reader, so the driver can roll the run back deterministically.
//!
//! The pipeline ceiling is a protocol constraint, not a tunable: going past
//! 19 outstanding requests makes the server drop the connection.

pub mod frames;

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::consts::{
    HANDSHAKE_LEN, HANDSHAKE_RESPONSE_OK, HANDSHAKE_UPDATE, MASTER_INDEX, MAX_REQUESTS,
    PRELUDE_CLIENT_INFO, PRELUDE_ENCRYPTION_KEY, REQUEST_PREFETCH, UNUSED_INDEXES,
};
use crate::container;
use crate::crc::crc32;
use crate::errors::UpdateError;
use crate::fs::{Storage, Store};
use crate::index::IndexData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Connected,
    Closed,
}

/// One record of the remote master index: (position, crc, revision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: u8,
    pub crc: i32,
    pub revision: i32,
}

/// A fully reassembled file response (compressed container bytes).
#[derive(Debug, Clone)]
pub struct FileResult {
    pub index: u8,
    pub archive: u16,
    pub data: Vec<u8>,
}

enum Expect {
    /// Caller waits for this exact response (flushing request).
    Reply,
    /// Bulk download: reader verifies the CRC and parks the result.
    Verify { crc: i32 },
}

struct PendingRequest {
    index: u8,
    archive: u16,
    expect: Expect,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<PendingRequest>,
    finished: HashMap<u32, FileResult>,
    verified: Vec<FileResult>,
    /// Abort signal from the reader thread; fatal for the run.
    error: Option<UpdateError>,
    eof: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cv: Condvar,
}

fn key_of(index: u8, archive: u16) -> u32 {
    (index as u32) << 16 | archive as u32
}

pub struct CacheClient {
    revision: i32,
    state: ClientState,
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    handshaken: bool,
}

impl CacheClient {
    /// Open the socket (TCP_NODELAY) without speaking yet.
    pub fn connect(host: &str, port: u16, revision: i32) -> Result<CacheClient> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| UpdateError::Network(format!("connect {}:{}: {}", host, port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| UpdateError::Network(format!("set_nodelay: {}", e)))?;
        let writer = BufWriter::new(
            stream
                .try_clone()
                .map_err(|e| UpdateError::Network(format!("clone stream: {}", e)))?,
        );
        Ok(CacheClient {
            revision,
            state: ClientState::Disconnected,
            stream,
            writer,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                cv: Condvar::new(),
            }),
            reader: None,
            handshaken: false,
        })
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Send the handshake and block on the one-byte response. OK transitions
    /// into Connected, sends the session prelude and starts the reader; any
    /// other code is returned as-is and the session stays unusable.
    pub fn handshake(&mut self) -> Result<u8> {
        if self.handshaken {
            bail!("handshake already performed on this client");
        }
        self.handshaken = true;
        self.state = ClientState::Handshaking;

        let mut packet = [0u8; HANDSHAKE_LEN];
        packet[0] = HANDSHAKE_UPDATE;
        BigEndian::write_i32(&mut packet[1..5], self.revision);
        // Четыре ключевых слова; сервер ждёт их нулями.
        self.writer.write_all(&packet).map_err(net_err)?;
        self.writer.flush().map_err(net_err)?;

        info!("Sent handshake with revision {}", self.revision);

        let mut response = [0u8; 1];
        let mut stream = &self.stream;
        stream.read_exact(&mut response).map_err(net_err)?;

        if response[0] != HANDSHAKE_RESPONSE_OK {
            return Ok(response[0]);
        }

        self.state = ClientState::Connected;

        // Session prelude: до первого файлового запроса.
        self.writer.write_all(&PRELUDE_ENCRYPTION_KEY).map_err(net_err)?;
        self.writer.write_all(&PRELUDE_CLIENT_INFO).map_err(net_err)?;
        self.writer.flush().map_err(net_err)?;

        let shared = Arc::clone(&self.shared);
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| UpdateError::Network(format!("clone stream: {}", e)))?;
        self.reader = Some(thread::spawn(move || reader_loop(stream, shared)));

        Ok(HANDSHAKE_RESPONSE_OK)
    }

    /// Fetch and parse the master index (255, 255): 8-byte records
    /// (crc, revision); the record position is the index id.
    pub fn request_indexes(&mut self) -> Result<Vec<IndexInfo>> {
        info!("Requesting indexes");

        let result = self.request_flushing(MASTER_INDEX, MASTER_INDEX as u16)?;
        let res = container::decompress(&result.data)?;

        if res.data.len() % 8 != 0 {
            return Err(anyhow!(UpdateError::Protocol(format!(
                "master index length {} is not a multiple of 8",
                res.data.len()
            ))));
        }
        let count = res.data.len() / 8;
        if count > MASTER_INDEX as usize {
            return Err(anyhow!(UpdateError::Protocol(format!(
                "master index advertises {} indexes",
                count
            ))));
        }

        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let crc = BigEndian::read_i32(&res.data[i * 8..i * 8 + 4]);
            let revision = BigEndian::read_i32(&res.data[i * 8 + 4..i * 8 + 8]);
            out.push(IndexInfo {
                id: i as u8,
                crc,
                revision,
            });
        }
        Ok(out)
    }

    /// Reconcile the tree against the remote manifest, fetching what changed.
    /// Verified bytes are staged into `storage`; local archives missing
    /// remotely are dropped from the tree.
    pub fn download(&mut self, store: &mut Store, storage: &mut dyn Storage) -> Result<()> {
        let started = Instant::now();

        let indexes = self.request_indexes()?;
        for info in &indexes {
            // Эти индексы клиент не запрашивает — сервер молча дропает
            // запрос; локальную копию убираем.
            if UNUSED_INDEXES.contains(&info.id) {
                if store.find_index(info.id).is_some() {
                    info!("Removing index {}", info.id);
                    store.remove_index(info.id);
                }
                continue;
            }

            match store.find_index(info.id) {
                None => info!("Index {} does not exist, creating", info.id),
                Some(index) => {
                    if index.revision != info.revision {
                        if info.revision < index.revision {
                            warn!(
                                "Index {} revision is going BACKWARDS! (our revision {}, their revision {})",
                                info.id, index.revision, info.revision
                            );
                        } else {
                            info!(
                                "Index {} has the wrong revision (our revision {}, their revision {})",
                                info.id, index.revision, info.revision
                            );
                        }
                    } else if index.crc != info.crc {
                        warn!(
                            "Index {} CRC has changed! (our crc {}, their crc {})",
                            info.id, index.crc, info.crc
                        );
                    } else {
                        // Индекс актуален, но не всё в нём обязательно скачано.
                        info!("Index {} is up to date", info.id);
                    }
                }
            }

            info!("Downloading index {}", info.id);

            let result = self.request_flushing(MASTER_INDEX, info.id as u16)?;
            let res = container::decompress(&result.data)?;
            if res.crc != info.crc {
                error!("Corrupted download for index {}", info.id);
                continue;
            }

            debug!("Downloaded index {}", info.id);

            let index_data = IndexData::read(&res.data)?;

            let index = store.ensure_index(info.id);
            index.protocol = index_data.protocol;
            index.named = index_data.named;
            index.sized = index_data.sized;
            index.crc = info.crc;
            index.revision = info.revision;
            index.compression = res.compression;

            info!("Index {} has {} archives", info.id, index_data.archives.len());

            let total = index_data.archives.len();
            let mut removed: Vec<u16> = index.archives().map(|a| a.id).collect();

            for ad in &index_data.archives {
                removed.retain(|id| *id != ad.id);

                if let Some(existing) = index.find_archive(ad.id) {
                    if existing.revision == ad.revision
                        && existing.crc == ad.crc
                        && existing.name_hash == ad.name_hash
                        && existing.compressed_size == ad.compressed_size
                        && existing.decompressed_size == ad.decompressed_size
                    {
                        debug!(
                            "Archive {}/{} in index {} is up to date",
                            ad.id, total, info.id
                        );
                        continue;
                    }

                    if ad.revision < existing.revision {
                        warn!(
                            "Archive {}/{} in index {} revision is going BACKWARDS! (our revision {}, their revision {})",
                            ad.id, total, info.id, existing.revision, ad.revision
                        );
                    } else {
                        info!(
                            "Archive {}/{} in index {} is out of date, downloading. revision: ours {} theirs {}, crc: ours {} theirs {}",
                            ad.id, total, info.id,
                            existing.revision, ad.revision,
                            existing.crc, ad.crc
                        );
                    }
                } else {
                    info!(
                        "Archive {}/{} in index {} is new, downloading",
                        ad.id, total, info.id
                    );
                }

                let archive = index.ensure_archive(ad.id);
                archive.revision = ad.revision;
                archive.crc = ad.crc;
                archive.name_hash = ad.name_hash;
                archive.compressed_size = ad.compressed_size;
                archive.decompressed_size = ad.decompressed_size;
                archive.files = ad.files.clone();

                self.request_archive(info.id, ad.id, ad.crc)?;
                self.stage_verified(storage)?;
            }

            for id in removed {
                info!("Archive {}/{} in index {} was removed", id, total, info.id);
                index.remove_archive(id);
            }
        }

        // Добиваем хвост очереди и ждём, пока конвейер опустеет.
        self.writer.flush().map_err(net_err)?;
        self.wait_drain()?;
        self.stage_verified(storage)?;

        info!("Download completed in {:.2?}", started.elapsed());
        Ok(())
    }

    /// Close the socket and join the reader thread.
    pub fn close(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.state != ClientState::Closed {
            self.state = ClientState::Closed;
            let _ = self.writer.flush();
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state != ClientState::Connected {
            bail!("can't request files until connected");
        }
        Ok(())
    }

    /// Write and flush a request, then block on its specific response.
    fn request_flushing(&mut self, index: u8, archive: u16) -> Result<FileResult> {
        self.ensure_connected()?;
        let shared = Arc::clone(&self.shared);

        let mut inner = lock(&shared);
        while inner.pending.len() >= MAX_REQUESTS {
            if let Some(e) = inner.error.clone() {
                return Err(e.into());
            }
            if inner.eof {
                return Err(
                    UpdateError::Network("connection closed with a full pipeline".into()).into(),
                );
            }
            self.writer.flush().map_err(net_err)?;
            inner = wait(&shared, inner);
        }
        inner.pending.push_back(PendingRequest {
            index,
            archive,
            expect: Expect::Reply,
        });
        drop(inner);
        self.write_request(index, archive)?;
        self.writer.flush().map_err(net_err)?;

        let k = key_of(index, archive);
        let mut inner = lock(&shared);
        loop {
            if let Some(result) = inner.finished.remove(&k) {
                return Ok(result);
            }
            if let Some(e) = inner.error.clone() {
                return Err(e.into());
            }
            if inner.eof {
                return Err(UpdateError::Network(format!(
                    "connection closed waiting for {}/{}",
                    index, archive
                ))
                .into());
            }
            inner = wait(&shared, inner);
        }
    }

    /// Enqueue a bulk download without flushing; suspends while the pipeline
    /// is full. The reader thread CRC-checks the response against
    /// `expected_crc` before parking it for staging.
    fn request_archive(&mut self, index: u8, archive: u16, expected_crc: i32) -> Result<()> {
        self.ensure_connected()?;
        let shared = Arc::clone(&self.shared);

        let mut inner = lock(&shared);
        while inner.pending.len() >= MAX_REQUESTS {
            if let Some(e) = inner.error.clone() {
                return Err(e.into());
            }
            if inner.eof {
                return Err(
                    UpdateError::Network("connection closed with a full pipeline".into()).into(),
                );
            }
            // Вытолкнуть накопленные запросы перед ожиданием свободного слота.
            self.writer.flush().map_err(net_err)?;
            inner = wait(&shared, inner);
        }
        inner.pending.push_back(PendingRequest {
            index,
            archive,
            expect: Expect::Verify { crc: expected_crc },
        });
        drop(inner);

        trace!("Sending request for {}/{}", index, archive);
        self.write_request(index, archive)
    }

    fn write_request(&mut self, index: u8, archive: u16) -> Result<()> {
        // [kind u8][index u8][archive u16]; срочность выражается flush-ем.
        let mut packet = [0u8; 4];
        packet[0] = REQUEST_PREFETCH;
        packet[1] = index;
        BigEndian::write_u16(&mut packet[2..4], archive);
        self.writer.write_all(&packet).map_err(net_err)?;
        Ok(())
    }

    /// Hand verified downloads over to the storage adapter; surface any
    /// abort recorded by the reader.
    fn stage_verified(&mut self, storage: &mut dyn Storage) -> Result<()> {
        let (done, error) = {
            let mut inner = lock(&self.shared);
            (
                std::mem::take(&mut inner.verified),
                inner.error.clone(),
            )
        };
        for result in done {
            debug!(
                "File download finished for index {} archive {}, length {}",
                result.index,
                result.archive,
                result.data.len()
            );
            storage.stage(result.index, result.archive, &result.data)?;
        }
        if let Some(e) = error {
            return Err(e.into());
        }
        Ok(())
    }

    /// Block until the outstanding-request queue is empty.
    fn wait_drain(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut inner = lock(&shared);
        while !inner.pending.is_empty() {
            if let Some(e) = inner.error.clone() {
                return Err(e.into());
            }
            if inner.eof {
                return Err(UpdateError::Network(format!(
                    "connection closed with {} requests outstanding",
                    inner.pending.len()
                ))
                .into());
            }
            inner = wait(&shared, inner);
        }
        Ok(())
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared.inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait<'a>(shared: &'a Shared, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
    shared.cv.wait(guard).unwrap_or_else(|e| e.into_inner())
}

fn net_err(e: std::io::Error) -> anyhow::Error {
    UpdateError::Network(format!("socket: {}", e)).into()
}

/// Reader side: reassemble responses, match them to pending requests by
/// (index, archive), verify bulk downloads, publish pipeline permits. Every
/// exit path leaves either `eof` or `error` set and wakes the driver.
fn reader_loop(stream: TcpStream, shared: Arc<Shared>) {
    let mut reader = BufReader::new(stream);
    loop {
        match frames::read_response(&mut reader) {
            Ok(Some(response)) => {
                let mut inner = lock(&shared);
                let pos = inner
                    .pending
                    .iter()
                    .position(|p| p.index == response.index && p.archive == response.archive);
                let Some(pos) = pos else {
                    error!(
                        "File download {}/{} with no pending request",
                        response.index, response.archive
                    );
                    inner.error = Some(UpdateError::Protocol(format!(
                        "response {}/{} was never requested",
                        response.index, response.archive
                    )));
                    shared.cv.notify_all();
                    return;
                };
                let request = inner.pending.remove(pos).expect("position is in range");

                let result = FileResult {
                    index: response.index,
                    archive: response.archive,
                    data: response.container,
                };
                match request.expect {
                    Expect::Reply => {
                        let k = key_of(result.index, result.archive);
                        inner.finished.insert(k, result);
                    }
                    Expect::Verify { crc } => {
                        let actual = crc32(&result.data);
                        if actual != crc {
                            error!(
                                "crc mismatch on downloaded archive {}/{}: {} != {}",
                                result.index, result.archive, actual, crc
                            );
                            inner.error = Some(UpdateError::Integrity {
                                index: result.index,
                                archive: result.archive,
                                expected: crc,
                                actual,
                            });
                            shared.cv.notify_all();
                            return;
                        }
                        inner.verified.push(result);
                    }
                }
                shared.cv.notify_all();
            }
            Ok(None) => {
                let mut inner = lock(&shared);
                inner.eof = true;
                shared.cv.notify_all();
                return;
            }
            Err(e) => {
                let mut inner = lock(&shared);
                if inner.error.is_none() {
                    inner.error = Some(e);
                }
                inner.eof = true;
                shared.cv.notify_all();
                return;
            }
        }
    }
}
