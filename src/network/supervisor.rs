//! Connection supervisor
//!
//! Owns the stream connection for the lifetime of the receiver. It requests
//! the negotiated sample rate, decodes each message, upsamples PCM into the
//! jitter buffer, and reconnects with backoff whenever the connection ends.
//! Between messages it runs periodic housekeeping: status publication, engine
//! event logging and the idle check on the output device.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{JitterBuffer, PushOutcome};
use crate::audio::playback::{AudioOutput, PlaybackController};
use crate::audio::pull::{EngineControl, EngineEvent};
use crate::config::{PreferenceStore, ReceiverConfig};
use crate::constants::{NORMAL_CLOSE_CODE, PROTOCOL_ERROR_CLOSE_CODE};
use crate::dsp::{RateNegotiator, SpectrumAnalyzer, SpectrumSink, Upsampler};
use crate::error::{NetworkError, ProtocolError};
use crate::network::backoff::Backoff;
use crate::network::transport::{Connection, Connector};
use crate::protocol::{decode, stream_url, DecodedMessage, TransportMessage};
use crate::status::{ReceiverStatus, StatusBoard};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// The playback half of the pipeline, as seen from the network side
pub struct AudioPath<O: AudioOutput> {
    pub output: O,
    /// Output device rate in Hz
    pub native_rate: u32,
    pub buffer: Arc<JitterBuffer>,
    pub control: Arc<EngineControl>,
    pub events: Receiver<EngineEvent>,
}

#[derive(Debug)]
enum Command {
    SetRequestedRate(u32),
    Shutdown,
}

/// Control and observation handle for a running supervisor
///
/// Dropping every handle shuts the supervisor down.
#[derive(Clone)]
pub struct ReceiverHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: StatusBoard,
    legal_rates: Vec<u32>,
}

impl ReceiverHandle {
    /// Ask for a new stream rate; it is snapped to the nearest legal rate
    pub fn set_requested_sample_rate(&self, rate: u32) {
        let _ = self.commands.send(Command::SetRequestedRate(rate));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ReceiverStatus {
        self.status.snapshot()
    }

    /// Rates the UI may offer, highest first
    pub fn legal_sample_rates(&self) -> &[u32] {
        &self.legal_rates
    }
}

/// State of one connection; discarded when it ends
#[derive(Default)]
struct StreamSession {
    upsampler: Option<Upsampler>,
}

enum SessionEnd {
    Closed,
    Failed(NetworkError),
    Protocol(ProtocolError),
    RateChanged,
    Shutdown,
}

enum Flow {
    Continue,
    Reconnect,
    Shutdown,
}

pub struct ConnectionSupervisor<C: Connector, O: AudioOutput> {
    config: ReceiverConfig,
    connector: C,
    negotiator: RateNegotiator,
    preferences: Box<dyn PreferenceStore>,
    buffer: Arc<JitterBuffer>,
    playback: PlaybackController<O>,
    events: Receiver<EngineEvent>,
    status: StatusBoard,
    spectrum: Option<(SpectrumAnalyzer, Box<dyn SpectrumSink>)>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    last_stats: Instant,
}

impl<C: Connector, O: AudioOutput> ConnectionSupervisor<C, O> {
    pub fn new(
        config: ReceiverConfig,
        connector: C,
        audio: AudioPath<O>,
        preferences: Box<dyn PreferenceStore>,
    ) -> (Self, ReceiverHandle) {
        let negotiator = RateNegotiator::new(audio.native_rate, preferences.load_requested_rate());
        let status = StatusBoard::new();
        status.set_requested_sample_rate(negotiator.requested_rate());

        let playback = PlaybackController::new(
            audio.output,
            audio.control,
            audio.buffer.clone(),
            config.idle_stop(),
            config.idle_check(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ReceiverHandle {
            commands: tx,
            status: status.clone(),
            legal_rates: negotiator.legal_rates(),
        };

        info!(
            "Native rate {} Hz, requesting {} Hz",
            negotiator.native_rate(),
            negotiator.requested_rate()
        );

        let supervisor = Self {
            backoff: Backoff::from_config(&config.reconnect),
            config,
            connector,
            negotiator,
            preferences,
            buffer: audio.buffer,
            playback,
            events: audio.events,
            status,
            spectrum: None,
            commands: rx,
            last_stats: Instant::now(),
        };
        (supervisor, handle)
    }

    /// Tap the stream-rate signal into a spectrum sink
    pub fn with_spectrum_sink(mut self, sink: Box<dyn SpectrumSink>) -> Self {
        let analyzer = SpectrumAnalyzer::new(self.config.spectrum.fft_size);
        self.spectrum = Some((analyzer, sink));
        self
    }

    /// Run until shut down
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.status_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let url = stream_url(&self.config.server_url, self.negotiator.requested_rate());
            info!("Connecting to {}", url);

            let end = match self.connect(url, &mut ticker).await {
                Ok(conn) => {
                    info!("Connected");
                    self.backoff.reset();
                    self.run_connection(conn, &mut ticker).await
                }
                Err(end) => end,
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::RateChanged => continue,
                SessionEnd::Closed => info!("Server closed the stream"),
                SessionEnd::Failed(e) => {
                    warn!("{}", e);
                    self.status.report_error(e.to_string());
                }
                SessionEnd::Protocol(e) => warn!("Dropped connection: {}", e),
            }

            let delay = self.backoff.next_delay();
            debug!("Reconnecting in {:?}", delay);
            if let Flow::Shutdown = self.wait(delay, &mut ticker).await {
                break;
            }
        }

        let dropped = self.buffer.flush();
        info!("Receiver stopped ({} queued chunks discarded)", dropped);
    }

    async fn connect(
        &mut self,
        url: String,
        ticker: &mut Interval,
    ) -> Result<Box<dyn Connection>, SessionEnd> {
        let mut connecting = self.connector.connect(url);
        loop {
            tokio::select! {
                result = &mut connecting => return result.map_err(SessionEnd::Failed),
                _ = ticker.tick() => self.housekeeping(Instant::now()),
                cmd = self.commands.recv() => match self.handle_command(cmd) {
                    Flow::Continue => {}
                    Flow::Reconnect => return Err(SessionEnd::RateChanged),
                    Flow::Shutdown => return Err(SessionEnd::Shutdown),
                },
            }
        }
    }

    async fn run_connection(&mut self, mut conn: Box<dyn Connection>, ticker: &mut Interval) -> SessionEnd {
        let mut session = StreamSession::default();
        loop {
            tokio::select! {
                message = conn.next_message() => match message {
                    None => return SessionEnd::Closed,
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    Some(Ok(message)) => {
                        if let Err(e) = self.handle_message(&mut session, message) {
                            self.status.report_error(e.to_string());
                            if let Err(close_err) = conn.close(PROTOCOL_ERROR_CLOSE_CODE, e.to_string()).await {
                                debug!("{}", close_err);
                            }
                            return SessionEnd::Protocol(e);
                        }
                    }
                },
                _ = ticker.tick() => self.housekeeping(Instant::now()),
                cmd = self.commands.recv() => {
                    let end = match self.handle_command(cmd) {
                        Flow::Continue => continue,
                        Flow::Reconnect => SessionEnd::RateChanged,
                        Flow::Shutdown => SessionEnd::Shutdown,
                    };
                    if let Err(e) = conn.close(NORMAL_CLOSE_CODE, String::new()).await {
                        debug!("{}", e);
                    }
                    return end;
                }
            }
        }
    }

    /// Sleep out a reconnect delay while staying responsive
    async fn wait(&mut self, delay: Duration, ticker: &mut Interval) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                _ = ticker.tick() => self.housekeeping(Instant::now()),
                cmd = self.commands.recv() => match self.handle_command(cmd) {
                    Flow::Continue => {}
                    Flow::Reconnect => return Flow::Continue,
                    Flow::Shutdown => return Flow::Shutdown,
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: Option<Command>) -> Flow {
        match cmd {
            Some(Command::SetRequestedRate(preferred)) => {
                let previous = self.negotiator.requested_rate();
                let rate = self.negotiator.set_preference(preferred);
                if let Err(e) = self.preferences.store_requested_rate(rate) {
                    warn!("Failed to save sample rate preference: {}", e);
                }
                self.status.set_requested_sample_rate(rate);
                if rate == previous {
                    return Flow::Continue;
                }
                info!("Requested sample rate changed {} -> {} Hz", previous, rate);
                self.buffer.flush();
                Flow::Reconnect
            }
            Some(Command::Shutdown) | None => Flow::Shutdown,
        }
    }

    fn handle_message(&mut self, session: &mut StreamSession, message: TransportMessage) -> Result<(), ProtocolError> {
        match decode(&message).into_result()? {
            DecodedMessage::Metadata(format) => {
                let native_rate = self.negotiator.native_rate();
                let ratio = self.negotiator.ratio_for(format.stream_sample_rate);
                if native_rate % format.stream_sample_rate != 0 {
                    self.status.report_error(format!(
                        "Stream rate {} Hz does not divide output rate {} Hz",
                        format.stream_sample_rate, native_rate
                    ));
                }
                let upsampler = Upsampler::new(format, native_rate, ratio);
                info!(
                    "Stream format: {} channel(s) at {} Hz, ratio {}, cutoff {:.0} Hz",
                    format.channel_count,
                    format.stream_sample_rate,
                    ratio,
                    upsampler.cutoff_hz()
                );
                session.upsampler = Some(upsampler);
                if let Some((analyzer, _)) = &mut self.spectrum {
                    analyzer.reset();
                }
                Ok(())
            }
            DecodedMessage::PcmFrame(samples) => {
                let upsampler = session.upsampler.as_ref().ok_or(ProtocolError::PcmBeforeMetadata)?;
                let format = upsampler.format();
                let channels = format.channel_count;
                if samples.len() % channels as usize != 0 {
                    return Err(ProtocolError::PartialFrame {
                        samples: samples.len(),
                        channels,
                    });
                }

                if let Some((analyzer, sink)) = &mut self.spectrum {
                    for frame in analyzer.process(&samples, channels, format.stream_sample_rate) {
                        sink.accept(frame);
                    }
                }

                let chunk = upsampler.upsample(&samples);
                if chunk.is_empty() {
                    return Ok(());
                }
                match self.buffer.push(chunk) {
                    PushOutcome::Queued => {
                        if let Err(e) = self.playback.on_chunk_queued() {
                            error!("Failed to start audio output: {}", e);
                            self.status.report_error(e.to_string());
                        }
                    }
                    PushOutcome::ExtremeOverrun { dropped_chunks } => {
                        warn!("Extreme overrun, dropped {} queued chunks", dropped_chunks);
                    }
                }
                Ok(())
            }
            DecodedMessage::Malformed(reason) => Err(ProtocolError::Malformed(reason)),
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::Underrun {
                    missing_frames,
                    requested_frames,
                    consecutive,
                } => {
                    if consecutive {
                        debug!("Underrun again: {} of {} frames", missing_frames, requested_frames);
                    } else {
                        debug!("Underrun: {} of {} frames", missing_frames, requested_frames);
                    }
                }
                EngineEvent::Overrun { dropped_frames } => {
                    debug!("Overrun: dropped {} frames", dropped_frames);
                }
            }
        }

        self.status
            .publish_buffer(self.buffer.publish_status(self.negotiator.native_rate()));
        self.status.expire_error(now);

        if let Err(e) = self.playback.tick(now) {
            error!("Audio output error: {}", e);
            self.status.report_error(e.to_string());
        }

        if now.duration_since(self.last_stats) >= STATS_INTERVAL {
            self.last_stats = now;
            let stats = self.buffer.stats();
            debug!(
                "Buffer: {} chunks / {} samples queued, target {:?}, {} pushed, {} popped, {} extreme overruns",
                stats.queued_chunks,
                stats.queued_samples,
                stats.target_queue_size,
                stats.chunks_pushed,
                stats.chunks_popped,
                stats.extreme_overruns
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::tests::CountingOutput;
    use crate::audio::pull::PullEngine;
    use crate::config::MemoryPreferenceStore;
    use crate::network::transport::memory::MemoryConnector;
    use crate::protocol::{encode_metadata, encode_pcm, StreamFormat};
    use std::sync::atomic::Ordering;

    fn test_config() -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        config.server_url = "ws://radio.test/audio-stream".to_string();
        config.status_interval_ms = 10;
        config.reconnect.initial_delay_ms = 10;
        config.reconnect.max_delay_ms = 20;
        config
    }

    fn audio_path(native_rate: u32) -> (AudioPath<CountingOutput>, PullEngine, CountingOutput) {
        let buffer = Arc::new(JitterBuffer::new());
        let (engine, events) = PullEngine::new(buffer.clone());
        let output = CountingOutput::default();
        let path = AudioPath {
            output: output.clone(),
            native_rate,
            buffer,
            control: engine.control(),
            events,
        };
        (path, engine, output)
    }

    fn metadata(channel_count: u16, rate: u32) -> TransportMessage {
        TransportMessage::Text(encode_metadata(&StreamFormat {
            channel_count,
            stream_sample_rate: rate,
        }))
    }

    fn pcm(samples: &[f32]) -> TransportMessage {
        TransportMessage::Binary(encode_pcm(samples))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_stream_is_upsampled_into_buffer() {
        let (connector, log) = MemoryConnector::new();
        let server = connector.add_session();
        let (audio, _engine, output) = audio_path(48000);
        let buffer = audio.buffer.clone();
        let prefs = Box::new(MemoryPreferenceStore::with_rate(16000));

        let (supervisor, handle) = ConnectionSupervisor::new(test_config(), connector, audio, prefs);
        assert_eq!(handle.status().requested_sample_rate, 16000);
        let task = tokio::spawn(supervisor.run());

        server.send(metadata(1, 16000)).unwrap();
        server.send(pcm(&[0.5, -0.5])).unwrap();
        wait_until(|| buffer.queued_samples() == 12).await;

        let chunk = buffer.pop().unwrap();
        assert_eq!(
            chunk.samples(),
            &[0.5, 0.5, 0.0, 0.0, 0.0, 0.0, -0.5, -0.5, 0.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.lock().urls,
            vec!["ws://radio.test/audio-stream?rate=16000".to_string()]
        );

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pcm_before_metadata_closes_and_reconnects() {
        let (connector, log) = MemoryConnector::new();
        let first = connector.add_session();
        let second = connector.add_session();
        let (audio, _engine, _output) = audio_path(48000);
        let buffer = audio.buffer.clone();

        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        let task = tokio::spawn(supervisor.run());

        first.send(pcm(&[0.1, 0.2])).unwrap();
        wait_until(|| log.lock().urls.len() == 2).await;
        assert_eq!(log.lock().closes[0].0, PROTOCOL_ERROR_CLOSE_CODE);
        assert!(handle.status().error.unwrap().contains("before stream metadata"));
        assert!(buffer.is_empty());

        // The new connection starts from scratch and plays normally
        second.send(metadata(2, 48000)).unwrap();
        second.send(pcm(&[0.1, 0.2])).unwrap();
        wait_until(|| buffer.queued_samples() == 2).await;

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_format_change_mid_stream() {
        let (connector, log) = MemoryConnector::new();
        let server = connector.add_session();
        let (audio, _engine, _output) = audio_path(48000);
        let buffer = audio.buffer.clone();

        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        let task = tokio::spawn(supervisor.run());

        server.send(metadata(1, 16000)).unwrap();
        server.send(pcm(&[0.5])).unwrap();
        server.send(metadata(2, 24000)).unwrap();
        server.send(pcm(&[0.1, 0.2])).unwrap();
        wait_until(|| buffer.queued_samples() == 10).await;

        assert_eq!(buffer.pop().unwrap().samples(), &[0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(buffer.pop().unwrap().samples(), &[0.1, 0.2, 0.0, 0.0]);
        assert!(log.lock().closes.is_empty());
        assert_eq!(handle.status().error, None);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_dividing_rate_plays_without_upsampling() {
        let (connector, log) = MemoryConnector::new();
        let server = connector.add_session();
        let (audio, _engine, _output) = audio_path(48000);
        let buffer = audio.buffer.clone();

        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        let task = tokio::spawn(supervisor.run());

        server.send(metadata(2, 44100)).unwrap();
        server.send(pcm(&[0.1, 0.2, 0.3, 0.4])).unwrap();
        wait_until(|| buffer.queued_samples() == 4).await;

        assert_eq!(buffer.pop().unwrap().samples(), &[0.1, 0.2, 0.3, 0.4]);
        assert!(handle.status().error.unwrap().contains("does not divide"));
        assert!(log.lock().closes.is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_frame_is_protocol_error() {
        let (connector, log) = MemoryConnector::new();
        let server = connector.add_session();
        let (audio, _engine, _output) = audio_path(48000);
        let buffer = audio.buffer.clone();

        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        let task = tokio::spawn(supervisor.run());

        server.send(metadata(2, 24000)).unwrap();
        server.send(pcm(&[0.1, 0.2, 0.3])).unwrap();
        wait_until(|| !log.lock().closes.is_empty()).await;
        assert_eq!(log.lock().closes[0].0, PROTOCOL_ERROR_CLOSE_CODE);
        assert!(buffer.is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_change_flushes_and_reconnects() {
        let (connector, log) = MemoryConnector::new();
        let first = connector.add_session();
        let _second = connector.add_session();
        let (audio, _engine, _output) = audio_path(48000);
        let buffer = audio.buffer.clone();

        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        assert_eq!(handle.legal_sample_rates(), &[48000, 24000, 12000, 6000]);
        let task = tokio::spawn(supervisor.run());

        first.send(metadata(2, 48000)).unwrap();
        first.send(pcm(&[0.1, 0.2, 0.3, 0.4])).unwrap();
        wait_until(|| buffer.queued_samples() == 4).await;

        // 20000 snaps to 24000
        handle.set_requested_sample_rate(20000);
        wait_until(|| log.lock().urls.len() == 2).await;
        assert_eq!(log.lock().urls[1], "ws://radio.test/audio-stream?rate=24000");
        assert_eq!(log.lock().closes[0].0, NORMAL_CLOSE_CODE);
        assert!(buffer.is_empty());
        assert_eq!(handle.status().requested_sample_rate, 24000);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_supervisor() {
        let (connector, _log) = MemoryConnector::new();
        let (audio, _engine, _output) = audio_path(48000);
        let (supervisor, handle) =
            ConnectionSupervisor::new(test_config(), connector, audio, Box::new(MemoryPreferenceStore::default()));
        let task = tokio::spawn(supervisor.run());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
