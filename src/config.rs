/// Audio quality tiers the feeder is allowed to request, mirroring the
/// service's own bitrate tiers. Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityPreference {
    Low96,
    Normal160,
    High320,
}

impl Default for QualityPreference {
    fn default() -> Self {
        QualityPreference::Normal160
    }
}

/// Configuration for the streaming core.
///
/// Deliberately a plain struct with no env var or CLI parsing: the core is a
/// library, and a host application is expected to populate this itself (see
/// the source spec's "No CLI, no env vars are part of the core").
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Highest quality tier the feeder may select.
    pub preferred_quality: QualityPreference,
    /// Whether episodes may be fetched over the CDN HTTP path instead of the
    /// control channel.
    pub use_cdn: bool,
    /// Per-chunk wait timeout before a stalled read re-issues its request
    /// once and then fails.
    pub chunk_timeout_ms: u64,
    /// Number of chunks beyond the one being read to eagerly request.
    pub prefetch_ahead: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            preferred_quality: QualityPreference::default(),
            use_cdn: true,
            chunk_timeout_ms: 10_000,
            prefetch_ahead: 1,
        }
    }
}

impl StreamingConfig {
    pub fn with_preferred_quality(mut self, quality: QualityPreference) -> Self {
        self.preferred_quality = quality;
        self
    }

    pub fn with_use_cdn(mut self, use_cdn: bool) -> Self {
        self.use_cdn = use_cdn;
        self
    }

    pub fn with_chunk_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.chunk_timeout_ms = timeout_ms;
        self
    }

    pub fn with_prefetch_ahead(mut self, prefetch_ahead: usize) -> Self {
        self.prefetch_ahead = prefetch_ahead;
        self
    }
}
