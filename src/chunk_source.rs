//! Chunk Source (C2): abstract fetcher for `(file-id, chunk-index)` pairs,
//! layering a best-effort local cache in front of the service's control
//! channel.
//!
//! Both collaborators here are consumed interfaces — this crate ships no
//! production `ChannelClient` or `CacheHandle` (session/channel plumbing and
//! cache persistence are owned elsewhere); only in-memory test doubles live
//! in `testutil`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ids::AudioFileId;

#[derive(Error, Debug)]
pub enum ChunkSourceError {
    #[error("channel request failed: {0}")]
    ChannelError(String),
    #[error("stream error from channel, code {0}")]
    StreamError(u8),
}

/// Callback target for a chunk fetch: whatever issued the request (normally
/// the Chunk Buffer) implements this to receive the payload.
pub trait ChunkSink: Send + Sync {
    fn write_chunk(&self, index: u32, ciphertext: &[u8], cached: bool);
    fn write_header(&self, id: u8, bytes: &[u8], cached: bool);
    fn stream_error(&self, code: u8);
}

/// The service's multiplexed control-channel RPC, consumed only — session
/// handshake, framing, and transport are out of this crate's scope.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn request_chunk(
        &self,
        file_id: AudioFileId,
        index: u32,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<(), ChunkSourceError>;
}

/// Local content cache, consumed only. No eviction contract is implied here;
/// a production handle may be append-only with external truncation.
#[async_trait]
pub trait CacheHandle: Send + Sync {
    async fn has_chunk(&self, file_id: AudioFileId, index: u32) -> bool;
    async fn read_chunk(&self, file_id: AudioFileId, index: u32) -> Option<Vec<u8>>;
    async fn write_chunk(
        &self,
        file_id: AudioFileId,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), ChunkSourceError>;
}

/// Upper bound on chunk requests serviced concurrently by one source.
const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Fetches chunks for one audio file, preferring a local cache hit and
/// falling back to the control channel, best-effort-populating the cache on
/// channel delivery.
pub struct ChunkSource {
    file_id: AudioFileId,
    channel: Arc<dyn ChannelClient>,
    cache: Option<Arc<dyn CacheHandle>>,
}

impl ChunkSource {
    pub fn new(
        file_id: AudioFileId,
        channel: Arc<dyn ChannelClient>,
        cache: Option<Arc<dyn CacheHandle>>,
    ) -> Self {
        ChunkSource {
            file_id,
            channel,
            cache,
        }
    }

    /// Request a single chunk. On a cache hit, delivers synchronously
    /// (logically) with `cached = true`; on a miss, issues a channel request
    /// and best-effort writes the result back to cache.
    pub async fn request_chunk(
        &self,
        index: u32,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<(), ChunkSourceError> {
        if let Some(cache) = &self.cache {
            if cache.has_chunk(self.file_id, index).await {
                if let Some(bytes) = cache.read_chunk(self.file_id, index).await {
                    debug!(index, "chunk served from cache");
                    sink.write_chunk(index, &bytes, true);
                    return Ok(());
                }
            }
        }

        let bridge = Arc::new(CacheFillSink {
            inner: sink,
            file_id: self.file_id,
            cache: self.cache.clone(),
        });
        self.channel.request_chunk(self.file_id, index, bridge).await
    }

    /// Fan out requests for several chunks at once, bounded to
    /// `MAX_CONCURRENT_REQUESTS` in flight. Used by the stream's prefetch
    /// window and by bulk warm-up.
    pub async fn request_chunks(&self, indices: &[u32], sink: Arc<dyn ChunkSink>) {
        stream::iter(indices.iter().copied())
            .for_each_concurrent(MAX_CONCURRENT_REQUESTS, |index| {
                let sink = sink.clone();
                async move {
                    if let Err(err) = self.request_chunk(index, sink).await {
                        warn!(index, %err, "chunk request failed");
                    }
                }
            })
            .await;
    }
}

/// Wraps the caller's sink so that a channel-delivered (non-cached) chunk is
/// best-effort written to cache before being forwarded. Cache write failures
/// are logged and swallowed per the cache's best-effort contract.
struct CacheFillSink {
    inner: Arc<dyn ChunkSink>,
    file_id: AudioFileId,
    cache: Option<Arc<dyn CacheHandle>>,
}

impl ChunkSink for CacheFillSink {
    fn write_chunk(&self, index: u32, ciphertext: &[u8], cached: bool) {
        if !cached {
            if let Some(cache) = self.cache.clone() {
                let file_id = self.file_id;
                let bytes = ciphertext.to_vec();
                tokio::spawn(async move {
                    if let Err(err) = cache.write_chunk(file_id, index, &bytes).await {
                        warn!(index, %err, "failed to populate cache, continuing uncached");
                    }
                });
            }
        }
        self.inner.write_chunk(index, ciphertext, cached);
    }

    fn write_header(&self, id: u8, bytes: &[u8], cached: bool) {
        self.inner.write_header(id, bytes, cached);
    }

    fn stream_error(&self, code: u8) {
        self.inner.stream_error(code);
    }
}
