//! Chunk Buffer (C3): the fixed-size, partially-populated array of a file's
//! decrypted chunks.
//!
//! This is the one piece of the core that is genuinely thread-blocking
//! rather than `async` — the decoder thread calls a plain blocking `read`
//! against it — so it is built on `std::sync::{Mutex, Condvar}`, not a
//! `tokio` lock.

use std::sync::{Condvar, Mutex};

use tracing::{trace, warn};

use crate::chunk_source::ChunkSink;
use crate::crypto::ChunkDecryptor;
use crate::CHUNK_SIZE;

struct Inner {
    payload: Vec<Vec<u8>>,
    available: Vec<bool>,
    requested: Vec<bool>,
    closed: bool,
    /// Set when a stream-error signal arrives from the channel; readers
    /// blocked on any chunk fail with this rather than `StreamClosed`.
    error_code: Option<u8>,
}

/// Owns the three parallel arrays described in the data model: payload,
/// `available`, `requested`, each of length `chunks_total`.
pub struct ChunkBuffer {
    state: Mutex<Inner>,
    condvar: Condvar,
    decryptor: ChunkDecryptor,
    total_size: u64,
    chunks_total: u32,
}

impl ChunkBuffer {
    /// Allocate a buffer for a file of `total_size` bytes, once
    /// `chunks_total` is known (typically after parsing the header in
    /// chunk 0).
    pub fn new(total_size: u64, decryptor: ChunkDecryptor) -> Self {
        let chunks_total = chunks_total_for(total_size);
        let inner = Inner {
            payload: vec![Vec::new(); chunks_total as usize],
            available: vec![false; chunks_total as usize],
            requested: vec![false; chunks_total as usize],
            closed: false,
            error_code: None,
        };
        ChunkBuffer {
            state: Mutex::new(inner),
            condvar: Condvar::new(),
            decryptor,
            total_size,
            chunks_total,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunks_total(&self) -> u32 {
        self.chunks_total
    }

    /// Expected plaintext length of chunk `i`: `CHUNK_SIZE` for all but the
    /// last chunk, `total_size mod CHUNK_SIZE` for the last (a multiple of
    /// `CHUNK_SIZE` is treated as a full `CHUNK_SIZE`, matching I2).
    pub fn expected_len(&self, index: u32) -> usize {
        expected_len(self.total_size, self.chunks_total, index)
    }

    /// Marks chunk `index` as requested (set by the reader before issuing a
    /// fetch, so a second reader doesn't double-request it). No-op if
    /// already requested or the buffer is closed.
    pub fn mark_requested(&self, index: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.requested[index as usize] {
            return false;
        }
        state.requested[index as usize] = true;
        true
    }

    pub fn is_requested(&self, index: u32) -> bool {
        self.state.lock().unwrap().requested[index as usize]
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.state.lock().unwrap().available[index as usize]
    }

    /// Decrypt and install ciphertext for chunk `index`. Tolerates being
    /// called after `close()` (no-op, per §4.3) — a channel reply can race a
    /// stream shutdown.
    pub fn write_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), crate::crypto::CryptoError> {
        let expected = self.expected_len(index);
        let plaintext = self
            .decryptor
            .decrypt_checked(index, ciphertext, expected)?;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            trace!(index, "dropping chunk write, buffer already closed");
            return Ok(());
        }
        // I1: available implies requested.
        state.requested[index as usize] = true;
        state.payload[index as usize] = plaintext;
        state.available[index as usize] = true;
        drop(state);
        self.condvar.notify_all();
        Ok(())
    }

    /// Block until chunk `index` is available, closed, or errored, or the
    /// timeout elapses. Returns `Ok(None)` on timeout so the caller can
    /// re-request and retry once before failing.
    pub fn wait_for_chunk(
        &self,
        index: u32,
        timeout: std::time::Duration,
    ) -> ChunkWaitResult {
        let state = self.state.lock().unwrap();
        if state.available[index as usize] {
            return ChunkWaitResult::Available(state.payload[index as usize].clone());
        }
        if state.closed {
            return ChunkWaitResult::Closed;
        }
        if let Some(code) = state.error_code {
            return ChunkWaitResult::Error(code);
        }

        let (state, timeout_result) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| {
                !s.available[index as usize] && !s.closed && s.error_code.is_none()
            })
            .unwrap();

        if state.available[index as usize] {
            ChunkWaitResult::Available(state.payload[index as usize].clone())
        } else if state.closed {
            ChunkWaitResult::Closed
        } else if let Some(code) = state.error_code {
            ChunkWaitResult::Error(code)
        } else {
            debug_assert!(timeout_result.timed_out());
            ChunkWaitResult::Timeout
        }
    }

    /// Idempotent: flips `closed` and wakes every blocked reader.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Fails all current and future waiters with a channel-delivered stream
    /// error (distinct from a clean `close()`).
    pub fn fail(&self, code: u8) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.error_code = Some(code);
        drop(state);
        self.condvar.notify_all();
    }
}

/// Lets a `ChunkSource` deliver directly into the buffer: a fetched chunk is
/// decrypted and installed, a stream error fails all waiters, and headers
/// (chunk-0 metadata) are not this buffer's concern — they're consumed by
/// the feeder before the buffer is even sized, so they're dropped here.
impl ChunkSink for ChunkBuffer {
    fn write_chunk(&self, index: u32, ciphertext: &[u8], _cached: bool) {
        if let Err(err) = self.write_chunk(index, ciphertext) {
            warn!(index, %err, "dropping chunk, decrypt failed");
        }
    }

    fn write_header(&self, _id: u8, _bytes: &[u8], _cached: bool) {}

    fn stream_error(&self, code: u8) {
        self.fail(code);
    }
}

pub enum ChunkWaitResult {
    Available(Vec<u8>),
    Closed,
    Error(u8),
    Timeout,
}

pub fn chunks_total_for(total_size: u64) -> u32 {
    if total_size == 0 {
        return 0;
    }
    (total_size.div_ceil(CHUNK_SIZE as u64)) as u32
}

fn expected_len(total_size: u64, chunks_total: u32, index: u32) -> usize {
    if index + 1 == chunks_total {
        let remainder = total_size % CHUNK_SIZE as u64;
        if remainder == 0 {
            CHUNK_SIZE
        } else {
            remainder as usize
        }
    } else {
        CHUNK_SIZE
    }
}
