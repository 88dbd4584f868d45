//! Track Handler (C6): the single-writer command queue that drives one
//! track through load/play/pause/seek/stop.
//!
//! Modeled directly on an actor shape this lineage already uses for its
//! playback service: one `tokio::sync::mpsc::unbounded_channel` of a typed
//! `Command`, drained by one spawned worker task, fronted by a cheap `Clone`
//! handle the rest of the application holds. The "decoder worker" that
//! actually pulls bytes off the loaded stream is an external collaborator;
//! this module owns its lifecycle (spawn, stop) through the `DecoderSpawner`
//! / `DecoderHandle` traits without implementing decoding itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::feeder::{FeederError, LoadedStream, PlayableId, ReadSeek, StreamFeeder};
use crate::ids::TrackId;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler already stopped")]
    HandlerStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Stopped,
}

/// Events the external decoder worker reports back onto the handler's
/// single command queue, keeping state transitions single-writer even
/// though the decoder runs on its own thread.
#[derive(Debug, Clone, Copy)]
pub enum DecoderEvent {
    PositionUpdate(u64),
    NearEndOfTrack,
    EndOfTrack,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Load(PlayableId, bool, u64),
    Play,
    Pause,
    Seek(u64),
    Stop,
    Terminate,
    Decoder(DecoderEvent),
}

/// Lifecycle hooks reported from the command-worker thread. Implementations
/// must not call back into the same handler synchronously.
pub trait Listener: Send + Sync {
    fn started_loading(&self);
    fn finished_loading(&self, position_ms: u64, playing: bool);
    fn loading_error(&self, id: PlayableId, err: &FeederError);
    fn end_of_track(&self);
    fn preload_next_track(&self);
}

/// Owns the lifecycle of the external decoder thread for one loaded stream.
pub trait DecoderHandle: Send {
    fn pause(&mut self);
    fn resume(&mut self);
    fn seek(&mut self, position_ms: u64);
    fn stop(&mut self);
}

/// Spawns a decoder worker over a freshly loaded stream. Supplied by the
/// host application; this crate never decodes audio itself.
pub trait DecoderSpawner: Send + Sync {
    fn spawn(
        &self,
        stream: Box<dyn ReadSeek>,
        start_position_ms: u64,
        play: bool,
    ) -> Box<dyn DecoderHandle>;
}

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    receiver: mpsc::UnboundedReceiver<Command>,
    feeder: Arc<StreamFeeder>,
    decoder_spawner: Arc<dyn DecoderSpawner>,
    listener: Arc<dyn Listener>,
    stopped: Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
    state: HandlerState,
    current_track: Arc<Mutex<Option<TrackId>>>,
    position_ms: Arc<AtomicU64>,
    decoder: Option<Box<dyn DecoderHandle>>,
    loaded_stream: Option<Box<dyn ReadSeek>>,
}

/// Resolves as soon as the stop signal is (or becomes) true. Checking
/// `borrow()` before awaiting `changed()` means a signal sent before this
/// function is even called is still observed, unlike `Notify::notify_waiters`
/// which only wakes tasks already parked on it.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

impl Worker {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            match command {
                Command::Load(id, play, start_pos_ms) => {
                    self.handle_load(id, play, start_pos_ms).await;
                }
                Command::Play => self.handle_play(),
                Command::Pause => self.handle_pause(),
                Command::Seek(pos_ms) => self.handle_seek(pos_ms),
                Command::Stop => self.handle_stop(),
                Command::Decoder(event) => self.handle_decoder_event(event),
                Command::Terminate => {
                    debug!("command worker terminating");
                    break;
                }
            }
        }
    }

    fn cancel_current(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.stop();
        }
        if let Some(stream) = self.loaded_stream.take() {
            stream.close();
        }
    }

    async fn handle_load(&mut self, id: PlayableId, play: bool, start_pos_ms: u64) {
        self.cancel_current();
        self.state = HandlerState::Loading;
        self.listener.started_loading();

        let load_fut = self.feeder.load(id);
        tokio::pin!(load_fut);

        let outcome = tokio::select! {
            result = &mut load_fut => Some(result),
            _ = wait_for_stop(&mut self.stop_rx) => None,
        };

        match outcome {
            None => {
                debug!("load cancelled by a concurrent stop before completion");
                self.state = HandlerState::Stopped;
            }
            Some(Err(err)) => {
                warn!(?err, "load failed");
                self.state = HandlerState::Idle;
                self.listener.loading_error(id, &err);
            }
            Some(Ok(loaded)) => {
                if self.stopped.load(Ordering::Acquire) {
                    debug!("load completed after a concurrent stop, discarding result");
                    loaded.stream.close();
                    self.state = HandlerState::Stopped;
                    return;
                }
                self.install_loaded_stream(loaded, play, start_pos_ms);
            }
        }
    }

    fn install_loaded_stream(&mut self, loaded: LoadedStream, play: bool, start_pos_ms: u64) {
        *self.current_track.lock().unwrap() = Some(loaded.track_gid);
        self.position_ms.store(start_pos_ms, Ordering::Release);
        let decoder = self
            .decoder_spawner
            .spawn(loaded.stream, start_pos_ms, play);
        self.decoder = Some(decoder);
        self.state = if play {
            HandlerState::Playing
        } else {
            HandlerState::Ready
        };
        info!(track = ?loaded.track_gid, play, "finished loading");
        self.listener.finished_loading(start_pos_ms, play);
    }

    fn handle_play(&mut self) {
        match self.state {
            HandlerState::Ready | HandlerState::Paused => {
                if let Some(decoder) = self.decoder.as_mut() {
                    decoder.resume();
                }
                self.state = HandlerState::Playing;
            }
            other => warn!(?other, "Play ignored in current state"),
        }
    }

    fn handle_pause(&mut self) {
        if self.state == HandlerState::Playing {
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.pause();
            }
            self.state = HandlerState::Paused;
        } else {
            let state = self.state;
            warn!(?state, "Pause ignored in current state");
        }
    }

    fn handle_seek(&mut self, pos_ms: u64) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.seek(pos_ms);
            self.position_ms.store(pos_ms, Ordering::Release);
        } else {
            warn!("Seek ignored, no loaded track");
        }
    }

    fn handle_stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel_current();
        self.state = HandlerState::Stopped;
        let _ = self.commands.send(Command::Terminate);
    }

    fn handle_decoder_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::PositionUpdate(pos_ms) => {
                self.position_ms.store(pos_ms, Ordering::Release);
            }
            DecoderEvent::NearEndOfTrack => self.listener.preload_next_track(),
            DecoderEvent::EndOfTrack => {
                self.listener.end_of_track();
                self.handle_stop();
            }
        }
    }
}

/// Read-only view onto a handler's playback position, for a controller UI
/// or an outer "what's playing" surface. Position is reported by the
/// external decoder via `DecoderEvent::PositionUpdate`; this crate never
/// measures it itself.
#[derive(Clone)]
pub struct Controller {
    position_ms: Arc<AtomicU64>,
}

impl Controller {
    pub fn time_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Acquire)
    }
}

/// Cheap, cloneable facade over one track handler's command queue.
#[derive(Clone)]
pub struct TrackHandlerHandle {
    commands: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    current_track: Arc<Mutex<Option<TrackId>>>,
    position_ms: Arc<AtomicU64>,
}

impl TrackHandlerHandle {
    pub fn track(&self) -> Option<TrackId> {
        *self.current_track.lock().unwrap()
    }

    pub fn controller(&self) -> Controller {
        Controller {
            position_ms: self.position_ms.clone(),
        }
    }

    pub fn send_load(&self, id: PlayableId, play: bool, start_pos_ms: u64) -> Result<(), HandlerError> {
        self.send(Command::Load(id, play, start_pos_ms))
    }

    pub fn send_play(&self) -> Result<(), HandlerError> {
        self.send(Command::Play)
    }

    pub fn send_pause(&self) -> Result<(), HandlerError> {
        self.send(Command::Pause)
    }

    pub fn send_seek(&self, pos_ms: u64) -> Result<(), HandlerError> {
        self.send(Command::Seek(pos_ms))
    }

    /// Wakes a worker currently blocked in `handle_load`'s `select!` before
    /// even enqueueing `Stop`: the command queue is strictly FIFO and the
    /// worker won't drain it again until the in-flight load resolves, so
    /// without this direct signal a stop during load would deadlock against
    /// the very load it's meant to cancel. `watch` (rather than `Notify`) is
    /// used because a signal sent before `wait_for_stop` is even polled must
    /// still be observed.
    pub fn send_stop(&self) -> Result<(), HandlerError> {
        let _ = self.stop_tx.send(true);
        self.send(Command::Stop)
    }

    /// Reported by the external decoder worker, not by application code.
    pub fn report_decoder_event(&self, event: DecoderEvent) -> Result<(), HandlerError> {
        self.send(Command::Decoder(event))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> Result<(), HandlerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(HandlerError::HandlerStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| HandlerError::HandlerStopped)
    }
}

/// Spawns the command worker and returns a handle to it. The worker runs
/// until `Terminate` (always preceded by `Stop`), at which point its task
/// exits.
pub fn spawn_handler(
    feeder: Arc<StreamFeeder>,
    decoder_spawner: Arc<dyn DecoderSpawner>,
    listener: Arc<dyn Listener>,
    runtime: &tokio::runtime::Handle,
) -> TrackHandlerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = watch::channel(false);
    let current_track = Arc::new(Mutex::new(None));
    let position_ms = Arc::new(AtomicU64::new(0));

    let worker = Worker {
        commands: tx.clone(),
        receiver: rx,
        feeder,
        decoder_spawner,
        listener,
        stopped: stopped.clone(),
        stop_rx,
        state: HandlerState::Idle,
        current_track: current_track.clone(),
        position_ms: position_ms.clone(),
        decoder: None,
        loaded_stream: None,
    };
    runtime.spawn(worker.run());

    TrackHandlerHandle {
        commands: tx,
        stopped,
        stop_tx,
        current_track,
        position_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_source::{CacheHandle, ChannelClient, ChunkSink, ChunkSourceError};
    use crate::config::StreamingConfig;
    use crate::feeder::{AudioKeyProvider, CdnHeadInfo, CdnHttpClient, Episode, MetadataClient, Track};
    use crate::ids::{AudioFile, AudioFileId, AudioFormat};
    use crate::crypto::FileKey;
    use std::sync::Mutex;

    struct OneShotDecoder {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DecoderHandle for OneShotDecoder {
        fn pause(&mut self) {
            self.log.lock().unwrap().push("pause");
        }
        fn resume(&mut self) {
            self.log.lock().unwrap().push("resume");
        }
        fn seek(&mut self, _position_ms: u64) {
            self.log.lock().unwrap().push("seek");
        }
        fn stop(&mut self) {
            self.log.lock().unwrap().push("stop");
        }
    }

    struct RecordingSpawner {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DecoderSpawner for RecordingSpawner {
        fn spawn(
            &self,
            _stream: Box<dyn ReadSeek>,
            _start_position_ms: u64,
            _play: bool,
        ) -> Box<dyn DecoderHandle> {
            self.log.lock().unwrap().push("spawn");
            Box::new(OneShotDecoder {
                log: self.log.clone(),
            })
        }
    }

    struct RecordingListener {
        events: Mutex<Vec<String>>,
        finished: tokio::sync::Notify,
    }

    impl RecordingListener {
        fn new() -> Self {
            RecordingListener {
                events: Mutex::new(Vec::new()),
                finished: tokio::sync::Notify::new(),
            }
        }
    }

    impl Listener for RecordingListener {
        fn started_loading(&self) {
            self.events.lock().unwrap().push("started_loading".into());
        }
        fn finished_loading(&self, position_ms: u64, playing: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finished_loading({position_ms},{playing})"));
            self.finished.notify_waiters();
        }
        fn loading_error(&self, _id: PlayableId, err: &FeederError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("loading_error({err})"));
            self.finished.notify_waiters();
        }
        fn end_of_track(&self) {
            self.events.lock().unwrap().push("end_of_track".into());
        }
        fn preload_next_track(&self) {
            self.events
                .lock()
                .unwrap()
                .push("preload_next_track".into());
        }
    }

    struct FakeMetadata;
    #[async_trait::async_trait]
    impl MetadataClient for FakeMetadata {
        async fn track(&self, gid: TrackId) -> Result<Track, FeederError> {
            Ok(Track {
                gid,
                files: vec![AudioFile {
                    id: AudioFileId::from_bytes([1; 20]),
                    format: AudioFormat::Vorbis160,
                }],
            })
        }
        async fn episode(&self, gid: TrackId) -> Result<Episode, FeederError> {
            Err(FeederError::MetadataNotFound(gid))
        }
    }

    struct FakeAudioKey;
    #[async_trait::async_trait]
    impl AudioKeyProvider for FakeAudioKey {
        async fn key(&self, _gid: TrackId, _file_id: AudioFileId) -> Result<FileKey, FeederError> {
            Ok(FileKey::from_bytes([2; 16]))
        }
    }

    struct FakeChannel {
        decryptor: crate::crypto::ChunkDecryptor,
    }
    #[async_trait::async_trait]
    impl ChannelClient for FakeChannel {
        async fn request_chunk(
            &self,
            _file_id: AudioFileId,
            index: u32,
            sink: Arc<dyn ChunkSink>,
        ) -> Result<(), ChunkSourceError> {
            assert_eq!(index, 0);
            let mut body = Vec::new();
            body.extend_from_slice(&0.0f32.to_le_bytes());
            body.extend_from_slice(&0.0f32.to_le_bytes());
            body.extend_from_slice(&0.0f32.to_le_bytes());
            body.extend_from_slice(&0.0f32.to_le_bytes());
            body.extend(vec![0xA7u8; crate::OGG_PREAMBLE_LEN]);
            body.extend_from_slice(b"hello world");

            sink.write_header(0x03, &(body.len() as u32).to_be_bytes(), false);
            let ciphertext = self.decryptor.decrypt(0, &body).unwrap();
            sink.write_chunk(0, &ciphertext, false);
            Ok(())
        }
    }

    struct NoCache;
    #[async_trait::async_trait]
    impl CacheHandle for NoCache {
        async fn has_chunk(&self, _file_id: AudioFileId, _index: u32) -> bool {
            false
        }
        async fn read_chunk(&self, _file_id: AudioFileId, _index: u32) -> Option<Vec<u8>> {
            None
        }
        async fn write_chunk(
            &self,
            _file_id: AudioFileId,
            _index: u32,
            _bytes: &[u8],
        ) -> Result<(), ChunkSourceError> {
            Ok(())
        }
    }

    struct UnreachableCdn;
    #[async_trait::async_trait]
    impl CdnHttpClient for UnreachableCdn {
        async fn head(&self, _url: &str) -> Result<CdnHeadInfo, FeederError> {
            Err(FeederError::CdnHttpError(0))
        }
        async fn get(&self, _url: &str) -> Result<Vec<u8>, FeederError> {
            Err(FeederError::CdnHttpError(0))
        }
    }

    fn build_feeder(runtime: tokio::runtime::Handle) -> Arc<StreamFeeder> {
        Arc::new(StreamFeeder::new(
            Arc::new(FakeMetadata),
            Arc::new(FakeAudioKey),
            Arc::new(FakeChannel {
                decryptor: crate::crypto::ChunkDecryptor::new(FileKey::from_bytes([2; 16])),
            }),
            Some(Arc::new(NoCache)),
            Arc::new(UnreachableCdn),
            runtime,
            StreamingConfig::default(),
        ))
    }

    #[tokio::test]
    async fn load_then_play_reaches_playing_state_and_emits_events() {
        let runtime = tokio::runtime::Handle::current();
        let feeder = build_feeder(runtime.clone());
        let spawner_log = Arc::new(Mutex::new(Vec::new()));
        let spawner = Arc::new(RecordingSpawner {
            log: spawner_log.clone(),
        });
        let listener = Arc::new(RecordingListener::new());

        let handle = spawn_handler(feeder, spawner, listener.clone(), &runtime);
        handle
            .send_load(PlayableId::Track(TrackId::from_bytes([1; 16])), true, 0)
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), listener.finished.notified())
            .await
            .unwrap();

        let events = listener.events.lock().unwrap();
        assert_eq!(events[0], "started_loading");
        assert!(events[1].starts_with("finished_loading"));
        assert_eq!(spawner_log.lock().unwrap().as_slice(), ["spawn"]);
    }

    #[tokio::test]
    async fn stop_then_send_fails_with_handler_stopped() {
        let runtime = tokio::runtime::Handle::current();
        let feeder = build_feeder(runtime.clone());
        let spawner = Arc::new(RecordingSpawner {
            log: Arc::new(Mutex::new(Vec::new())),
        });
        let listener = Arc::new(RecordingListener::new());
        let handle = spawn_handler(feeder, spawner, listener, &runtime);

        handle.send_stop().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = handle.send_play().unwrap_err();
        assert!(matches!(err, HandlerError::HandlerStopped));
    }
}
