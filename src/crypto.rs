//! Chunk Decryptor (C1): stateless per-chunk AES decryption keyed by
//! (file-key, chunk-index).
//!
//! AES-128-CTR with a fixed per-file IV; rather than manually incrementing a
//! 128-bit big-endian counter by `(chunk_index * CHUNK_SIZE) / 16` blocks, we
//! seek the stream cipher directly to `chunk_index * CHUNK_SIZE` keystream
//! bytes, which is equivalent and avoids re-deriving block math by hand.

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use thiserror::Error;

use crate::CHUNK_SIZE;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Fixed initialization vector the service uses for every file's chunk
/// keystream. Chunk position within the file is what varies the keystream,
/// not the IV itself.
const FILE_IV: [u8; 16] = [
    0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d, 0x93,
];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid chunk size: expected {expected}, got {actual}")]
    InvalidChunkSize { expected: usize, actual: usize },
}

/// 16-byte AES key returned by the key RPC for a specific (track, file) pair.
/// Never logged or `Debug`-formatted in full.
#[derive(Clone)]
pub struct FileKey([u8; 16]);

impl FileKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        FileKey(bytes)
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileKey").field(&"<redacted>").finish()
    }
}

/// Decrypts chunk ciphertext for one file key. Cheap to construct and clone;
/// holds nothing but the key, so decryption of distinct chunks can run in
/// parallel without any shared state.
#[derive(Clone)]
pub struct ChunkDecryptor {
    key: FileKey,
}

impl ChunkDecryptor {
    pub fn new(key: FileKey) -> Self {
        ChunkDecryptor { key }
    }

    /// Decrypt one chunk's ciphertext in place, given its index within the
    /// file. `ciphertext.len()` must equal the expected plaintext length for
    /// that chunk (CHUNK_SIZE for all but the last chunk); a mismatch is a
    /// caller bug, not a recoverable condition.
    pub fn decrypt(&self, chunk_index: u32, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = ciphertext.to_vec();
        self.decrypt_in_place(chunk_index, &mut plaintext)?;
        Ok(plaintext)
    }

    pub fn decrypt_in_place(&self, chunk_index: u32, buf: &mut [u8]) -> Result<(), CryptoError> {
        let keystream_offset = u64::from(chunk_index) * CHUNK_SIZE as u64;
        let mut cipher = Aes128Ctr::new(&self.key.0.into(), &FILE_IV.into());
        cipher
            .try_seek(keystream_offset)
            .expect("keystream offset never overflows a CTR cipher's counter space");
        cipher.apply_keystream(buf);
        Ok(())
    }

    /// Verify a ciphertext's length matches the expected plaintext length for
    /// this chunk before decrypting, per the spec's `InvalidChunkSize` bug
    /// check in §4.1 / §7.
    pub fn decrypt_checked(
        &self,
        chunk_index: u32,
        ciphertext: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() != expected_len {
            return Err(CryptoError::InvalidChunkSize {
                expected: expected_len,
                actual: ciphertext.len(),
            });
        }
        self.decrypt(chunk_index, ciphertext)
    }
}
