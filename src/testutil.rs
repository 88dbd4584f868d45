//! In-memory fakes of the external collaborators (`ChannelClient`,
//! `CacheHandle`, `MetadataClient`, `AudioKeyProvider`, `CdnHttpClient`),
//! gated behind the `test-support` feature so the integration tests under
//! `tests/` can assemble a complete streaming core without any real
//! session, control-channel, or cache plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::chunk_source::{CacheHandle, ChannelClient, ChunkSink, ChunkSourceError};
use crate::crypto::{ChunkDecryptor, FileKey};
use crate::feeder::{
    AudioKeyProvider, CdnHeadInfo, CdnHttpClient, Episode, FeederError, MetadataClient, Track,
    FILE_SIZE_HEADER_ID,
};
use crate::ids::{AudioFileId, TrackId};
use crate::CHUNK_SIZE;

/// Builds the raw plaintext layout of a decrypted audio file: 16 bytes of
/// little-endian normalization floats, the 167-byte `0xA7` OGG preamble,
/// then the audio bytes a test wants to observe coming out the other end.
pub fn encode_file_body(normalization: [f32; 4], audio: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + crate::OGG_PREAMBLE_LEN + audio.len());
    for f in normalization {
        body.extend_from_slice(&f.to_le_bytes());
    }
    body.extend(std::iter::repeat(0xA7u8).take(crate::OGG_PREAMBLE_LEN));
    body.extend_from_slice(audio);
    body
}

/// A control-channel fake keyed by file id: holds one file's full plaintext
/// and key, chunks and encrypts it on request exactly as a real channel
/// reply would arrive, and can be told to stall (never reply) or inject a
/// stream error on a given chunk index to drive the cancellation/timeout
/// and stream-error test scenarios.
pub struct FakeChannelClient {
    files: Mutex<HashMap<[u8; 20], (Vec<u8>, FileKey)>>,
    error_on: Mutex<Option<(u32, u8)>>,
    stall: Mutex<bool>,
    requests_seen: Mutex<Vec<u32>>,
}

impl Default for FakeChannelClient {
    fn default() -> Self {
        FakeChannelClient {
            files: Mutex::new(HashMap::new()),
            error_on: Mutex::new(None),
            stall: Mutex::new(false),
            requests_seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file's full plaintext body and key, so later
    /// `request_chunk` calls can serve slices of it.
    pub fn add_file(&self, file_id: AudioFileId, plaintext: Vec<u8>, key: FileKey) {
        self.files
            .lock()
            .unwrap()
            .insert(*file_id.as_bytes(), (plaintext, key));
    }

    /// The next request for `index` delivers `stream_error(code)` instead of
    /// a chunk.
    pub fn fail_chunk(&self, index: u32, code: u8) {
        *self.error_on.lock().unwrap() = Some((index, code));
    }

    /// Never reply to any request; the only way a blocked reader unblocks is
    /// the stream's own timeout or `close()`.
    pub fn set_stalling(&self, stalling: bool) {
        *self.stall.lock().unwrap() = stalling;
    }

    pub fn requests_seen(&self) -> Vec<u32> {
        self.requests_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelClient for FakeChannelClient {
    async fn request_chunk(
        &self,
        file_id: AudioFileId,
        index: u32,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<(), ChunkSourceError> {
        self.requests_seen.lock().unwrap().push(index);

        if *self.stall.lock().unwrap() {
            std::future::pending::<()>().await;
            return Ok(());
        }

        if let Some((err_index, code)) = *self.error_on.lock().unwrap() {
            if err_index == index {
                sink.stream_error(code);
                return Ok(());
            }
        }

        let (plaintext, key) = {
            let files = self.files.lock().unwrap();
            files
                .get(file_id.as_bytes())
                .cloned()
                .ok_or_else(|| ChunkSourceError::ChannelError("no such file registered".into()))?
        };

        let start = index as usize * CHUNK_SIZE;
        if start >= plaintext.len() {
            return Err(ChunkSourceError::ChannelError(format!(
                "chunk {index} is past end of file"
            )));
        }
        let end = (start + CHUNK_SIZE).min(plaintext.len());
        let decryptor = ChunkDecryptor::new(key);
        // CTR is its own inverse: "decrypting" plaintext produces ciphertext.
        let ciphertext = decryptor
            .decrypt(index, &plaintext[start..end])
            .expect("fixed-size slice always matches the chunk's own length");

        if index == 0 {
            sink.write_header(FILE_SIZE_HEADER_ID, &(plaintext.len() as u32).to_be_bytes(), false);
        }
        sink.write_chunk(index, &ciphertext, false);
        Ok(())
    }
}

/// A bounded in-memory LRU cache double. The `CacheHandle` trait makes no
/// eviction guarantee (a production handle may be append-only); this fake
/// bounds its own memory for long test runs by evicting least-recently-used
/// entries past `capacity`.
pub struct BoundedLruCacheHandle {
    capacity: usize,
    entries: Mutex<HashMap<([u8; 20], u32), Vec<u8>>>,
    order: Mutex<Vec<([u8; 20], u32)>>,
    writes: Mutex<usize>,
}

impl BoundedLruCacheHandle {
    pub fn new(capacity: usize) -> Self {
        BoundedLruCacheHandle {
            capacity,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            writes: Mutex::new(0),
        }
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    fn touch(&self, key: ([u8; 20], u32)) {
        let mut order = self.order.lock().unwrap();
        order.retain(|k| *k != key);
        order.push(key);
    }
}

#[async_trait]
impl CacheHandle for BoundedLruCacheHandle {
    async fn has_chunk(&self, file_id: AudioFileId, index: u32) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&(*file_id.as_bytes(), index))
    }

    async fn read_chunk(&self, file_id: AudioFileId, index: u32) -> Option<Vec<u8>> {
        let key = (*file_id.as_bytes(), index);
        let bytes = self.entries.lock().unwrap().get(&key).cloned();
        if bytes.is_some() {
            self.touch(key);
        }
        bytes
    }

    async fn write_chunk(
        &self,
        file_id: AudioFileId,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), ChunkSourceError> {
        let key = (*file_id.as_bytes(), index);
        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(key, bytes.to_vec());
            let mut order = self.order.lock().unwrap();
            order.retain(|k| *k != key);
            order.push(key);
            while entries.len() > self.capacity {
                let oldest = order.remove(0);
                entries.remove(&oldest);
            }
        }
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }
}

/// Metadata RPC fake: a plain map from gid to `Track`/`Episode`.
#[derive(Default)]
pub struct FakeMetadataClient {
    tracks: Mutex<HashMap<[u8; 16], Track>>,
    episodes: Mutex<HashMap<[u8; 16], Episode>>,
}

impl FakeMetadataClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, track: Track) {
        self.tracks.lock().unwrap().insert(*track.gid.as_bytes(), track);
    }

    pub fn add_episode(&self, episode: Episode) {
        self.episodes
            .lock()
            .unwrap()
            .insert(*episode.gid.as_bytes(), episode);
    }
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn track(&self, gid: TrackId) -> Result<Track, FeederError> {
        self.tracks
            .lock()
            .unwrap()
            .get(gid.as_bytes())
            .cloned()
            .ok_or(FeederError::MetadataNotFound(gid))
    }

    async fn episode(&self, gid: TrackId) -> Result<Episode, FeederError> {
        self.episodes
            .lock()
            .unwrap()
            .get(gid.as_bytes())
            .cloned()
            .ok_or(FeederError::MetadataNotFound(gid))
    }
}

/// Audio-key RPC fake: a plain map from `(gid, file_id)` to `FileKey`.
#[derive(Default)]
pub struct FakeAudioKeyProvider {
    keys: Mutex<HashMap<([u8; 16], [u8; 20]), FileKey>>,
}

impl FakeAudioKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, gid: TrackId, file_id: AudioFileId, key: FileKey) {
        self.keys
            .lock()
            .unwrap()
            .insert((*gid.as_bytes(), *file_id.as_bytes()), key);
    }
}

#[async_trait]
impl AudioKeyProvider for FakeAudioKeyProvider {
    async fn key(&self, gid: TrackId, file_id: AudioFileId) -> Result<FileKey, FeederError> {
        self.keys
            .lock()
            .unwrap()
            .get(&(*gid.as_bytes(), *file_id.as_bytes()))
            .cloned()
            .ok_or(FeederError::NoAudioKey)
    }
}

/// CDN HTTP fake: serves a fixed body for any URL, optionally with a delay
/// or a canned failure status, without touching the network.
pub struct FakeCdnHttpClient {
    body: Vec<u8>,
    delay: Duration,
    fail_status: Option<u16>,
}

impl FakeCdnHttpClient {
    pub fn new(body: Vec<u8>) -> Self {
        FakeCdnHttpClient {
            body,
            delay: Duration::ZERO,
            fail_status: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }
}

#[async_trait]
impl CdnHttpClient for FakeCdnHttpClient {
    async fn head(&self, _url: &str) -> Result<CdnHeadInfo, FeederError> {
        if let Some(status) = self.fail_status {
            return Err(FeederError::CdnHttpError(status));
        }
        Ok(CdnHeadInfo {
            content_length: self.body.len() as u64,
        })
    }

    async fn get(&self, _url: &str) -> Result<Vec<u8>, FeederError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(status) = self.fail_status {
            return Err(FeederError::CdnHttpError(status));
        }
        Ok(self.body.clone())
    }
}
