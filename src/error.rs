//! Crate-level error aggregation.
//!
//! Each component owns a narrow `thiserror` enum (see `crypto`, `chunk_source`,
//! `stream`, `feeder`, `handler`); this module composes them into one
//! `CoreError` for callers that don't care which component failed.

use thiserror::Error;

use crate::chunk_source::ChunkSourceError;
use crate::crypto::CryptoError;
use crate::feeder::FeederError;
use crate::handler::HandlerError;
use crate::stream::StreamError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    ChunkSource(#[from] ChunkSourceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Feeder(#[from] FeederError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

pub type CoreResult<T> = Result<T, CoreError>;
