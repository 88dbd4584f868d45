#![cfg(feature = "test-support")]

mod support;

use std::sync::Arc;
use std::time::Duration;

use trackstream_core::chunk_source::ChunkSource;
use trackstream_core::config::{QualityPreference, StreamingConfig};
use trackstream_core::crypto::FileKey;
use trackstream_core::feeder::{Episode, PlayableId, StreamFeeder, Track};
use trackstream_core::ids::{AudioFile, AudioFileId, AudioFormat, TrackId};
use trackstream_core::testutil::{
    encode_file_body, BoundedLruCacheHandle, FakeAudioKeyProvider, FakeCdnHttpClient,
    FakeChannelClient, FakeMetadataClient,
};

use crate::support::tracing_init;

fn gid(byte: u8) -> TrackId {
    TrackId::from_bytes([byte; 16])
}

fn file_id(byte: u8) -> AudioFileId {
    AudioFileId::from_bytes([byte; 20])
}

#[tokio::test]
async fn happy_channel_load_yields_normalization_and_audio_bytes() {
    tracing_init();
    let runtime = tokio::runtime::Handle::current();

    let track_gid = gid(1);
    let audio_id = file_id(2);
    let key = FileKey::from_bytes([7; 16]);
    let body = encode_file_body([1.0, -2.0, 3.5, 0.0], b"hello decoder, this is audio");

    let metadata = Arc::new(FakeMetadataClient::new());
    metadata.add_track(Track {
        gid: track_gid,
        files: vec![AudioFile {
            id: audio_id,
            format: AudioFormat::Vorbis160,
        }],
    });

    let audio_key = Arc::new(FakeAudioKeyProvider::new());
    audio_key.add_key(track_gid, audio_id, key.clone());

    let channel = Arc::new(FakeChannelClient::new());
    channel.add_file(audio_id, body, key);

    let feeder = StreamFeeder::new(
        metadata,
        audio_key,
        channel,
        None,
        Arc::new(FakeCdnHttpClient::new(Vec::new())),
        runtime,
        StreamingConfig::default(),
    );

    let mut loaded = feeder.load(PlayableId::Track(track_gid)).await.unwrap();
    assert_eq!(loaded.track_gid, track_gid);
    assert_eq!(loaded.normalization_data.0, [1.0, -2.0, 3.5, 0.0]);

    let mut audio = Vec::new();
    std::io::Read::read_to_end(&mut loaded.stream, &mut audio).unwrap();
    assert_eq!(audio, b"hello decoder, this is audio");
}

#[tokio::test]
async fn cdn_episode_load_reads_normalization_before_skipping_preamble() {
    tracing_init();
    let runtime = tokio::runtime::Handle::current();

    let episode_gid = gid(3);
    let audio_id = file_id(4);
    let body = encode_file_body([0.1, 0.2, 0.3, 0.4], b"episode audio payload");

    let metadata = Arc::new(FakeMetadataClient::new());
    metadata.add_episode(Episode {
        gid: episode_gid,
        files: vec![AudioFile {
            id: audio_id,
            format: AudioFormat::Vorbis96,
        }],
        external_url: Some("https://cdn.example.invalid/episode.ogg".to_string()),
    });

    let mut config = StreamingConfig::default();
    config.use_cdn = true;

    let feeder = StreamFeeder::new(
        metadata,
        Arc::new(FakeAudioKeyProvider::new()),
        Arc::new(FakeChannelClient::new()),
        None,
        Arc::new(FakeCdnHttpClient::new(body)),
        runtime,
        config,
    );

    let mut loaded = feeder.load(PlayableId::Episode(episode_gid)).await.unwrap();
    assert_eq!(loaded.normalization_data.0, [0.1, 0.2, 0.3, 0.4]);

    let mut audio = Vec::new();
    std::io::Read::read_to_end(&mut loaded.stream, &mut audio).unwrap();
    assert_eq!(audio, b"episode audio payload");
}

#[tokio::test]
async fn episode_without_external_url_falls_back_to_channel_path() {
    tracing_init();
    let runtime = tokio::runtime::Handle::current();

    let episode_gid = gid(5);
    let audio_id = file_id(6);
    let key = FileKey::from_bytes([9; 16]);
    let body = encode_file_body([0.0, 0.0, 0.0, 0.0], b"channel-served episode");

    let metadata = Arc::new(FakeMetadataClient::new());
    metadata.add_episode(Episode {
        gid: episode_gid,
        files: vec![AudioFile {
            id: audio_id,
            format: AudioFormat::Vorbis160,
        }],
        external_url: None,
    });

    let audio_key = Arc::new(FakeAudioKeyProvider::new());
    audio_key.add_key(episode_gid, audio_id, key.clone());
    let channel = Arc::new(FakeChannelClient::new());
    channel.add_file(audio_id, body, key);

    let mut config = StreamingConfig::default();
    config.use_cdn = true;

    let feeder = StreamFeeder::new(
        metadata,
        audio_key,
        channel,
        None,
        Arc::new(FakeCdnHttpClient::new(Vec::new()).failing(500)),
        runtime,
        config,
    );

    let loaded = feeder.load(PlayableId::Episode(episode_gid)).await.unwrap();
    assert_eq!(loaded.track_gid, episode_gid);
}

#[tokio::test]
async fn unsupported_format_is_rejected_before_any_rpc() {
    tracing_init();
    let runtime = tokio::runtime::Handle::current();

    let track_gid = gid(8);
    let metadata = Arc::new(FakeMetadataClient::new());
    metadata.add_track(Track {
        gid: track_gid,
        files: vec![AudioFile {
            id: file_id(9),
            format: AudioFormat::Mp3320,
        }],
    });

    let feeder = StreamFeeder::new(
        metadata,
        Arc::new(FakeAudioKeyProvider::new()),
        Arc::new(FakeChannelClient::new()),
        None,
        Arc::new(FakeCdnHttpClient::new(Vec::new())),
        runtime,
        StreamingConfig::default().with_preferred_quality(QualityPreference::High320),
    );

    let err = feeder.load(PlayableId::Track(track_gid)).await.unwrap_err();
    assert!(matches!(
        err,
        trackstream_core::feeder::FeederError::UnsupportedFormat
    ));
}

#[tokio::test]
async fn missing_metadata_fails_before_any_decrypt_attempt() {
    tracing_init();
    let runtime = tokio::runtime::Handle::current();
    let feeder = StreamFeeder::new(
        Arc::new(FakeMetadataClient::new()),
        Arc::new(FakeAudioKeyProvider::new()),
        Arc::new(FakeChannelClient::new()),
        None,
        Arc::new(FakeCdnHttpClient::new(Vec::new())),
        runtime,
        StreamingConfig::default(),
    );

    let err = feeder
        .load(PlayableId::Track(gid(42)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        trackstream_core::feeder::FeederError::MetadataNotFound(_)
    ));
}

/// P7: a chunk written through the cache on a miss is served back
/// byte-identical on the next request, without the channel being consulted
/// again, and decrypts to the same plaintext either way.
#[tokio::test]
async fn cache_round_trip_matches_fresh_channel_fetch() {
    tracing_init();

    let key = FileKey::from_bytes([11; 16]);
    let audio_id = file_id(10);
    let plaintext = vec![0x5Au8; trackstream_core::CHUNK_SIZE];

    let channel = Arc::new(FakeChannelClient::new());
    channel.add_file(audio_id, plaintext.clone(), key.clone());
    let cache = Arc::new(BoundedLruCacheHandle::new(8));

    let source = ChunkSource::new(audio_id, channel.clone(), Some(cache.clone()));

    struct CapturingSink(std::sync::Mutex<Vec<u8>>);
    impl trackstream_core::chunk_source::ChunkSink for CapturingSink {
        fn write_chunk(&self, _index: u32, ciphertext: &[u8], _cached: bool) {
            *self.0.lock().unwrap() = ciphertext.to_vec();
        }
        fn write_header(&self, _id: u8, _bytes: &[u8], _cached: bool) {}
        fn stream_error(&self, _code: u8) {}
    }

    let sink_a = Arc::new(CapturingSink(std::sync::Mutex::new(Vec::new())));
    source.request_chunk(0, sink_a.clone()).await.unwrap();
    let from_channel = sink_a.0.lock().unwrap().clone();
    assert_eq!(channel.requests_seen(), vec![0]);

    // Give the best-effort cache-fill spawned task a moment to land.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.write_count(), 1);

    let sink_b = Arc::new(CapturingSink(std::sync::Mutex::new(Vec::new())));
    source.request_chunk(0, sink_b.clone()).await.unwrap();
    let from_cache = sink_b.0.lock().unwrap().clone();

    // Still only the one channel request from before: this request was
    // served entirely from cache.
    assert_eq!(channel.requests_seen(), vec![0]);
    assert_eq!(from_channel, from_cache);

    let decryptor = trackstream_core::crypto::ChunkDecryptor::new(key);
    let decrypted_fresh = decryptor.decrypt(0, &from_channel).unwrap();
    let decrypted_cached = decryptor.decrypt(0, &from_cache).unwrap();
    assert_eq!(decrypted_fresh, decrypted_cached);
    assert_eq!(decrypted_fresh, plaintext);
}
