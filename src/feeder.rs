//! Stream Feeder (C5): resolves a track or episode id into metadata, an
//! audio-file key, and an open `ChunkedStream` ready for a decoder.
//!
//! `MetadataClient`, `AudioKeyProvider`, `ChannelClient` and `CacheHandle`
//! are consumed interfaces — session handshake, Mercury/metadata framing,
//! and cache persistence all live outside this crate. `CdnHttpClient` is
//! also consumed, but this crate ships a `reqwest`-backed default for it,
//! matching the rest of this lineage's reliance on `reqwest` for its other
//! HTTP integrations.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunk_buffer::ChunkBuffer;
use crate::chunk_source::{CacheHandle, ChannelClient, ChunkSink, ChunkSource, ChunkSourceError};
use crate::config::{QualityPreference, StreamingConfig};
use crate::crypto::{ChunkDecryptor, FileKey};
use crate::ids::{AudioFile, AudioFileId, TrackId};
use crate::stream::{ChunkedStream, StreamError};
use crate::{NORMALIZATION_DATA_LEN, OGG_PREAMBLE_LEN};

#[derive(Error, Debug)]
pub enum FeederError {
    #[error("metadata not found for {0:?}")]
    MetadataNotFound(TrackId),
    #[error("no audio key available")]
    NoAudioKey,
    #[error("no acceptable audio format for the configured quality preference")]
    UnsupportedFormat,
    #[error("CDN request failed with status {0}")]
    CdnHttpError(u16),
    #[error("channel request failed: {0}")]
    ChannelError(String),
    #[error(transparent)]
    ChunkSource(#[from] ChunkSourceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("I/O error while reading stream preamble: {0}")]
    Io(#[from] io::Error),
}

/// A track or a podcast episode; both carry a list of available encodings,
/// but only an episode may carry an `external_url` for the CDN path.
#[derive(Debug, Clone)]
pub struct Track {
    pub gid: TrackId,
    pub files: Vec<AudioFile>,
}

#[derive(Debug, Clone)]
pub struct Episode {
    pub gid: TrackId,
    pub files: Vec<AudioFile>,
    pub external_url: Option<String>,
}

/// Which metadata lookup to perform; callers know ahead of time whether an
/// id names a track or an episode (the playlist/episode-feed layer that
/// produced the id already knows).
#[derive(Debug, Clone, Copy)]
pub enum PlayableId {
    Track(TrackId),
    Episode(TrackId),
}

#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn track(&self, gid: TrackId) -> Result<Track, FeederError>;
    async fn episode(&self, gid: TrackId) -> Result<Episode, FeederError>;
}

#[async_trait]
pub trait AudioKeyProvider: Send + Sync {
    async fn key(&self, gid: TrackId, file_id: AudioFileId) -> Result<FileKey, FeederError>;
}

pub struct CdnHeadInfo {
    pub content_length: u64,
}

#[async_trait]
pub trait CdnHttpClient: Send + Sync {
    async fn head(&self, url: &str) -> Result<CdnHeadInfo, FeederError>;
    async fn get(&self, url: &str) -> Result<Vec<u8>, FeederError>;
}

/// Default CDN client, HEAD-then-GET over `reqwest`.
pub struct ReqwestCdnClient {
    client: reqwest::Client,
}

impl ReqwestCdnClient {
    pub fn new() -> Self {
        ReqwestCdnClient {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestCdnClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CdnHttpClient for ReqwestCdnClient {
    async fn head(&self, url: &str) -> Result<CdnHeadInfo, FeederError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|_| FeederError::CdnHttpError(0))?;
        if !response.status().is_success() {
            return Err(FeederError::CdnHttpError(response.status().as_u16()));
        }
        let content_length = response.content_length().unwrap_or(0);
        Ok(CdnHeadInfo { content_length })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, FeederError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| FeederError::CdnHttpError(0))?;
        if !response.status().is_success() {
            return Err(FeederError::CdnHttpError(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|_| FeederError::CdnHttpError(0))?;
        Ok(bytes.to_vec())
    }
}

/// A seekable byte reader, regardless of whether it's backed by the
/// chunked/encrypted channel path or an in-memory CDN download. `close` lets
/// a handler cancel a blocked decoder read without caring which path is
/// underneath; it's a no-op for the CDN path, which has nothing to wake.
pub trait ReadSeek: Read + Seek + Send {
    fn close(&self) {}
}

impl ReadSeek for ChunkedStream {
    fn close(&self) {
        ChunkedStream::close(self)
    }
}

impl ReadSeek for Cursor<Vec<u8>> {}

/// Normalization gain data, four little-endian IEEE-754 floats preceding
/// the OGG container, applied by the decoder rather than this crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationData(pub [f32; 4]);

/// The result of a successful `load()`: metadata, the open byte stream
/// positioned at the first audio byte, and normalization data for the
/// decoder's gain stage.
pub struct LoadedStream {
    pub track_gid: TrackId,
    pub files: Vec<AudioFile>,
    pub stream: Box<dyn ReadSeek>,
    pub normalization_data: NormalizationData,
}

pub(crate) const FILE_SIZE_HEADER_ID: u8 = 0x03;
const HEADER_TERMINATOR_ID: u8 = 0x00;

struct HeaderCaptureSink {
    headers: std::sync::Mutex<Vec<(u8, Vec<u8>)>>,
    chunk_body: std::sync::Mutex<Option<Vec<u8>>>,
    error: std::sync::Mutex<Option<u8>>,
}

impl HeaderCaptureSink {
    fn new() -> Self {
        HeaderCaptureSink {
            headers: std::sync::Mutex::new(Vec::new()),
            chunk_body: std::sync::Mutex::new(None),
            error: std::sync::Mutex::new(None),
        }
    }
}

impl ChunkSink for HeaderCaptureSink {
    fn write_chunk(&self, _index: u32, ciphertext: &[u8], _cached: bool) {
        *self.chunk_body.lock().unwrap() = Some(ciphertext.to_vec());
    }

    fn write_header(&self, id: u8, bytes: &[u8], _cached: bool) {
        if id != HEADER_TERMINATOR_ID {
            self.headers.lock().unwrap().push((id, bytes.to_vec()));
        }
    }

    fn stream_error(&self, code: u8) {
        *self.error.lock().unwrap() = Some(code);
    }
}

fn file_size_from_headers(headers: &[(u8, Vec<u8>)]) -> Result<u64, FeederError> {
    let bytes = headers
        .iter()
        .find(|(id, _)| *id == FILE_SIZE_HEADER_ID)
        .map(|(_, bytes)| bytes.as_slice())
        .ok_or_else(|| FeederError::ChannelError("missing file-size header".to_string()))?;

    let mut padded = [0u8; 8];
    let n = bytes.len().min(8);
    padded[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    Ok(u64::from_be_bytes(padded))
}

fn select_best_file(
    files: &[AudioFile],
    preference: QualityPreference,
) -> Result<AudioFile, FeederError> {
    let ceiling_kbps = match preference {
        QualityPreference::Low96 => 96,
        QualityPreference::Normal160 => 160,
        QualityPreference::High320 => 320,
    };
    files
        .iter()
        .filter(|f| f.format.is_vorbis() && f.format.bitrate_kbps() <= ceiling_kbps)
        .max_by_key(|f| f.format.bitrate_kbps())
        .copied()
        .ok_or(FeederError::UnsupportedFormat)
}

/// Consumes the leading 16 bytes of normalization data, then discards the
/// 167-byte OGG preamble, leaving `stream`'s position at the first audio
/// byte. Shared by both the channel and CDN paths, which differ only in
/// what's backing the `Read + Seek` before this point.
fn consume_preamble(mut stream: Box<dyn ReadSeek>) -> Result<(Box<dyn ReadSeek>, NormalizationData), FeederError> {
    let mut normalization_bytes = [0u8; NORMALIZATION_DATA_LEN];
    stream.read_exact(&mut normalization_bytes)?;

    let mut floats = [0f32; 4];
    for (i, chunk) in normalization_bytes.chunks_exact(4).enumerate() {
        floats[i] = f32::from_le_bytes(chunk.try_into().unwrap());
    }

    stream.seek(SeekFrom::Current(OGG_PREAMBLE_LEN as i64))?;
    Ok((stream, NormalizationData(floats)))
}

pub struct StreamFeeder {
    metadata: Arc<dyn MetadataClient>,
    audio_key: Arc<dyn AudioKeyProvider>,
    channel: Arc<dyn ChannelClient>,
    cache: Option<Arc<dyn CacheHandle>>,
    cdn: Arc<dyn CdnHttpClient>,
    runtime: tokio::runtime::Handle,
    config: StreamingConfig,
}

impl StreamFeeder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        audio_key: Arc<dyn AudioKeyProvider>,
        channel: Arc<dyn ChannelClient>,
        cache: Option<Arc<dyn CacheHandle>>,
        cdn: Arc<dyn CdnHttpClient>,
        runtime: tokio::runtime::Handle,
        config: StreamingConfig,
    ) -> Self {
        StreamFeeder {
            metadata,
            audio_key,
            channel,
            cache,
            cdn,
            runtime,
            config,
        }
    }

    pub async fn load(&self, id: PlayableId) -> Result<LoadedStream, FeederError> {
        match id {
            PlayableId::Track(gid) => {
                let track = self
                    .metadata
                    .track(gid)
                    .await
                    .map_err(|_| FeederError::MetadataNotFound(gid))?;
                info!(track = ?gid, "resolved track metadata");
                self.load_via_channel(gid, track.files).await
            }
            PlayableId::Episode(gid) => {
                let episode = self
                    .metadata
                    .episode(gid)
                    .await
                    .map_err(|_| FeederError::MetadataNotFound(gid))?;
                info!(episode = ?gid, "resolved episode metadata");

                if self.config.use_cdn {
                    if let Some(url) = &episode.external_url {
                        return self.load_via_cdn(gid, episode.files, url).await;
                    }
                }
                self.load_via_channel(gid, episode.files).await
            }
        }
    }

    async fn load_via_channel(
        &self,
        gid: TrackId,
        files: Vec<AudioFile>,
    ) -> Result<LoadedStream, FeederError> {
        let file = select_best_file(&files, self.config.preferred_quality)?;
        let key = self
            .audio_key
            .key(gid, file.id)
            .await
            .map_err(|_| FeederError::NoAudioKey)?;

        let capture = Arc::new(HeaderCaptureSink::new());
        self.channel
            .request_chunk(file.id, 0, capture.clone())
            .await
            .map_err(|e| FeederError::ChannelError(e.to_string()))?;

        if let Some(code) = *capture.error.lock().unwrap() {
            return Err(FeederError::ChannelError(format!(
                "stream error {code} while fetching chunk 0"
            )));
        }
        let headers = capture.headers.lock().unwrap().clone();
        let chunk0 = capture
            .chunk_body
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FeederError::ChannelError("no chunk-0 body delivered".to_string()))?;

        let file_size = file_size_from_headers(&headers)?;
        debug!(file_size, "parsed file-size header from chunk 0");

        let decryptor = ChunkDecryptor::new(key);
        let buffer = Arc::new(ChunkBuffer::new(file_size, decryptor));
        buffer.write_chunk(0, &chunk0)?;

        let source = Arc::new(ChunkSource::new(file.id, self.channel.clone(), self.cache.clone()));
        let stream = ChunkedStream::new(
            buffer,
            source,
            self.runtime.clone(),
            self.config.prefetch_ahead,
            Duration::from_millis(self.config.chunk_timeout_ms),
        );

        let (stream, normalization_data) = consume_preamble(Box::new(stream))?;
        Ok(LoadedStream {
            track_gid: gid,
            files,
            stream,
            normalization_data,
        })
    }

    async fn load_via_cdn(
        &self,
        gid: TrackId,
        files: Vec<AudioFile>,
        url: &str,
    ) -> Result<LoadedStream, FeederError> {
        let head = self.cdn.head(url).await?;
        debug!(content_length = head.content_length, "CDN HEAD succeeded");

        let body = self.cdn.get(url).await?;
        if body.is_empty() {
            warn!("CDN GET returned an empty body");
        }

        let cursor: Box<dyn ReadSeek> = Box::new(Cursor::new(body));
        let (stream, normalization_data) = consume_preamble(cursor)?;

        Ok(LoadedStream {
            track_gid: gid,
            files,
            stream,
            normalization_data,
        })
    }
}
