//! Chunked Stream (C4): a seekable, forward-biased byte reader over a
//! `ChunkBuffer`, backed by a `ChunkSource` for prefetch.
//!
//! This is the boundary between the async chunk-request machinery and the
//! plain blocking `std::io::Read + Seek` a decoder thread expects. Only this
//! module and `chunk_buffer` use `std::sync::{Mutex, Condvar}` directly; the
//! request side stays on the `tokio` runtime handed in at construction.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::chunk_buffer::{ChunkBuffer, ChunkWaitResult};
use crate::chunk_source::ChunkSource;
use crate::CHUNK_SIZE;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream closed")]
    StreamClosed,
    #[error("timed out waiting for chunk")]
    ChunkTimeout,
    #[error("stream error from channel, code {0}")]
    StreamError(u8),
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        io::Error::other(err)
    }
}

/// A seekable reader over a file's decrypted chunks. `position` only moves
/// under calls made by the single decoder thread that owns this value — it
/// is not `Sync`, matching the `&mut self` `Read`/`Seek` contract.
pub struct ChunkedStream {
    buffer: Arc<ChunkBuffer>,
    source: Arc<ChunkSource>,
    runtime: tokio::runtime::Handle,
    position: u64,
    prefetch_ahead: usize,
    chunk_timeout: Duration,
}

impl ChunkedStream {
    pub fn new(
        buffer: Arc<ChunkBuffer>,
        source: Arc<ChunkSource>,
        runtime: tokio::runtime::Handle,
        prefetch_ahead: usize,
        chunk_timeout: Duration,
    ) -> Self {
        ChunkedStream {
            buffer,
            source,
            runtime,
            position: 0,
            prefetch_ahead,
            chunk_timeout,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u64 {
        self.buffer.total_size()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    /// Idempotent; wakes every reader blocked on this stream with
    /// `StreamClosed`.
    pub fn close(&self) {
        self.buffer.close();
    }

    /// Convenience used by feeders to discard a fixed-length prefix (the OGG
    /// preamble, normalization data) without reading it into a buffer.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.seek(SeekFrom::Current(n as i64))
    }

    fn chunk_index_for(&self, pos: u64) -> u32 {
        (pos / CHUNK_SIZE as u64) as u32
    }

    /// Request chunk `index` if it hasn't been requested yet, and eagerly
    /// request the prefetch window ahead of it.
    fn ensure_requested(&self, index: u32) {
        self.request_one(index);
        for ahead in 1..=self.prefetch_ahead as u32 {
            let next = index + ahead;
            if next < self.buffer.chunks_total() {
                self.request_one(next);
            }
        }
    }

    fn request_one(&self, index: u32) {
        if index >= self.buffer.chunks_total() {
            return;
        }
        if !self.buffer.mark_requested(index) {
            return;
        }
        let source = self.source.clone();
        let sink = self.buffer.clone();
        self.runtime.spawn(async move {
            if let Err(err) = source.request_chunk(index, sink).await {
                warn!(index, %err, "chunk request dispatch failed");
            }
        });
    }

    /// Block (with timeout-then-retry-once) until `index` is available,
    /// closed, or errored.
    fn wait_for_chunk(&self, index: u32) -> Result<Vec<u8>, StreamError> {
        match self.buffer.wait_for_chunk(index, self.chunk_timeout) {
            ChunkWaitResult::Available(bytes) => Ok(bytes),
            ChunkWaitResult::Closed => Err(StreamError::StreamClosed),
            ChunkWaitResult::Error(code) => Err(StreamError::StreamError(code)),
            ChunkWaitResult::Timeout => {
                debug!(index, "chunk wait timed out, re-requesting once");
                self.request_one(index);
                match self.buffer.wait_for_chunk(index, self.chunk_timeout) {
                    ChunkWaitResult::Available(bytes) => Ok(bytes),
                    ChunkWaitResult::Closed => Err(StreamError::StreamClosed),
                    ChunkWaitResult::Error(code) => Err(StreamError::StreamError(code)),
                    ChunkWaitResult::Timeout => Err(StreamError::ChunkTimeout),
                }
            }
        }
    }
}

impl Read for ChunkedStream {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.buffer.total_size() {
            return Ok(0);
        }
        if dst.is_empty() {
            return Ok(0);
        }

        let index = self.chunk_index_for(self.position);
        self.ensure_requested(index);

        let chunk = self.wait_for_chunk(index)?;
        let offset_in_chunk = (self.position % CHUNK_SIZE as u64) as usize;
        let available = chunk.len() - offset_in_chunk;
        let to_copy = dst.len().min(available);
        dst[..to_copy].copy_from_slice(&chunk[offset_in_chunk..offset_in_chunk + to_copy]);
        self.position += to_copy as u64;
        Ok(to_copy)
    }
}

impl Seek for ChunkedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let total_size = self.buffer.total_size() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => total_size + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        let clamped = target.clamp(0, total_size) as u64;
        self.position = clamped;

        let index = self.chunk_index_for(clamped);
        if clamped < self.buffer.total_size() {
            self.ensure_requested(index);
        }
        Ok(self.position)
    }
}
