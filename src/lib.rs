//! Audio track streaming core: given an opaque track identifier, resolve it
//! to an open, seekable, chunk-decrypting byte stream for a decoder thread,
//! and serialize load/play/pause/seek/stop commands for that stream onto a
//! single worker.
//!
//! Session handshake, Mercury/metadata framing, the CDN HTTP transport
//! itself, local cache persistence, and audio decoding are all external
//! collaborators; this crate defines their interfaces (`MetadataClient`,
//! `AudioKeyProvider`, `ChannelClient`, `CacheHandle`, `CdnHttpClient`,
//! `DecoderSpawner`) and consumes them without owning their implementations.

pub mod chunk_buffer;
pub mod chunk_source;
pub mod config;
pub mod crypto;
pub mod error;
pub mod feeder;
pub mod handler;
pub mod ids;
pub mod stream;

#[cfg(feature = "test-support")]
pub mod testutil;

pub use config::{QualityPreference, StreamingConfig};
pub use error::{CoreError, CoreResult};
pub use feeder::{LoadedStream, PlayableId, StreamFeeder};
pub use handler::{spawn_handler, Controller, HandlerState, Listener, TrackHandlerHandle};
pub use ids::{AudioFile, AudioFileId, AudioFormat, TrackId};

/// Fixed chunk size, the unit of fetch, decrypt, and cache (128 KiB).
pub const CHUNK_SIZE: usize = 131_072;

/// Length in bytes of the OGG preamble every decrypted stream carries ahead
/// of the container's first page.
pub const OGG_PREAMBLE_LEN: usize = 167;

/// Length in bytes of the little-endian IEEE-754 normalization floats that
/// precede the OGG preamble.
pub const NORMALIZATION_DATA_LEN: usize = 16;
