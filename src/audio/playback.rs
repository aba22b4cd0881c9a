//! Output stream ownership
//!
//! The cpal stream lives on its own thread (it is not `Send` on every
//! platform) and obeys play/pause commands from the network context. The
//! pull engine is moved into the stream callback and never comes back.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::JitterBuffer;
use crate::audio::device::OutputDevice;
use crate::audio::gate::{GateAction, PlaybackGate, PlaybackState};
use crate::audio::pull::{EngineControl, PullEngine};
use crate::constants::OUTPUT_CHANNELS;
use crate::error::AudioError;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Something that can start and stop pulling audio
pub trait AudioOutput: Send {
    fn play(&mut self) -> Result<(), AudioError>;

    fn pause(&mut self) -> Result<(), AudioError>;

    /// Asynchronous stream error, if one happened since the last call
    fn take_error(&mut self) -> Option<AudioError> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputRequest {
    Play,
    Pause,
}

type Reply = Sender<Result<(), AudioError>>;

enum OutputCommand {
    /// Each request carries its own reply channel, so a late answer can never
    /// be mistaken for the result of a later request
    Run { request: OutputRequest, reply: Reply },
    Shutdown,
}

/// Request/reply link to the output thread
struct OutputLink {
    commands: Sender<OutputCommand>,
    timeout: Duration,
}

impl OutputLink {
    fn request(&self, request: OutputRequest) -> Result<(), AudioError> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(OutputCommand::Run { request, reply })
            .map_err(|_| AudioError::OutputClosed)?;
        match wait_blocking(|| answer.recv_timeout(self.timeout)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(AudioError::CommandTimeout(format!("{:?}", request))),
            Err(RecvTimeoutError::Disconnected) => Err(AudioError::OutputClosed),
        }
    }

    fn shutdown(&self) {
        self.link.shutdown();
    }
}

/// Run a blocking wait without stalling other tasks on a multi-threaded runtime
fn wait_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// cpal output stream driven by a [`PullEngine`]
pub struct CpalOutput {
    link: OutputLink,
    errors: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
    native_rate: u32,
    channels: u16,
}

impl CpalOutput {
    /// Open `device` at its default config; the stream starts paused
    pub fn open(device: OutputDevice, mut engine: PullEngine) -> Result<Self, AudioError> {
        let default_config = device.default_config()?;
        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let native_rate = config.sample_rate.0;
        let channels = config.channels;
        let device_name = device.name.clone();

        let (command_tx, command_rx) = bounded::<OutputCommand>(4);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let device_channels = channels as usize;
                let mut scratch: Vec<f32> = Vec::new();

                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if device_channels == OUTPUT_CHANNELS {
                            engine.fill(data);
                            return;
                        }
                        let frames = data.len() / device_channels.max(1);
                        if scratch.len() < frames * OUTPUT_CHANNELS {
                            scratch.resize(frames * OUTPUT_CHANNELS, 0.0);
                        }
                        let stereo = &mut scratch[..frames * OUTPUT_CHANNELS];
                        engine.fill(stereo);
                        map_channels(stereo, data, device_channels);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                // Some backends start immediately; the gate decides when to play
                let _ = stream.pause();
                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = command_rx.recv() {
                    let (request, reply) = match command {
                        OutputCommand::Run { request, reply } => (request, reply),
                        OutputCommand::Shutdown => break,
                    };
                    let result = match request {
                        OutputRequest::Play => stream.play().map_err(|e| e.to_string()),
                        OutputRequest::Pause => stream.pause().map_err(|e| e.to_string()),
                    };
                    // The requester may have timed out and gone away
                    let _ = reply.send(result.map_err(AudioError::StreamError));
                }
                // Stream is dropped here, stopping playback
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::OutputClosed);
            }
        }

        tracing::info!(
            "Opened output {} at {} Hz, {} channels",
            device_name,
            native_rate,
            channels
        );

        Ok(Self {
            link: OutputLink {
                commands: command_tx,
                timeout: COMMAND_TIMEOUT,
            },
            errors: error_rx,
            thread_handle: Some(handle),
            native_rate,
            channels,
        })
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl AudioOutput for CpalOutput {
    fn play(&mut self) -> Result<(), AudioError> {
        self.link.request(OutputRequest::Play)
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.link.request(OutputRequest::Pause)
    }

    fn take_error(&mut self) -> Option<AudioError> {
        self.errors.try_recv().ok()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.link.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spread interleaved stereo onto a device with a different channel count
fn map_channels(stereo: &[f32], out: &mut [f32], device_channels: usize) {
    if device_channels == 0 {
        return;
    }
    for (src, dst) in stereo
        .chunks_exact(OUTPUT_CHANNELS)
        .zip(out.chunks_exact_mut(device_channels))
    {
        if device_channels == 1 {
            dst[0] = (src[0] + src[1]) * 0.5;
            continue;
        }
        dst[0] = src[0];
        dst[1] = src[1];
        for extra in &mut dst[2..] {
            *extra = 0.0;
        }
    }
}

/// Starts and stops an [`AudioOutput`] according to the [`PlaybackGate`]
///
/// Lives on the network context; never touches the audio thread except
/// through the engine's atomic flags.
pub struct PlaybackController<O: AudioOutput> {
    output: O,
    gate: PlaybackGate,
    engine: Arc<EngineControl>,
    buffer: Arc<JitterBuffer>,
}

impl<O: AudioOutput> PlaybackController<O> {
    pub fn new(
        output: O,
        engine: Arc<EngineControl>,
        buffer: Arc<JitterBuffer>,
        idle_timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            output,
            gate: PlaybackGate::new(idle_timeout, check_interval),
            engine,
            buffer,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.gate.state()
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Call after every successful push
    pub fn on_chunk_queued(&mut self) -> Result<(), AudioError> {
        if self.gate.on_chunk_queued() != GateAction::Start {
            return Ok(());
        }

        // A stale held sample would click on resume, and depths recorded
        // before the stop say nothing about the restarted device
        self.engine.request_hold_reset();
        self.buffer.reset_history();
        match self.output.play() {
            Ok(()) => {
                self.gate.on_started();
                tracing::info!("Audio output started");
                Ok(())
            }
            Err(e) => {
                self.gate.on_start_failed();
                Err(e)
            }
        }
    }

    /// Periodic housekeeping; stops the output after a sustained empty queue
    pub fn tick(&mut self, now: Instant) -> Result<(), AudioError> {
        if let Some(e) = self.output.take_error() {
            return Err(e);
        }

        let idle = self.engine.is_starving() && self.buffer.is_empty();
        if self.gate.tick(now, idle) != GateAction::Stop {
            return Ok(());
        }

        let result = self.output.pause();
        self.gate.on_stopped();
        match &result {
            Ok(()) => tracing::info!("Audio output stopped after idle period"),
            Err(e) => tracing::warn!("Failed to pause audio output: {}", e),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::buffer::Chunk;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Output that only counts play/pause calls
    #[derive(Default, Clone)]
    pub(crate) struct CountingOutput {
        pub plays: Arc<AtomicUsize>,
        pub pauses: Arc<AtomicUsize>,
    }

    impl AudioOutput for CountingOutput {
        fn play(&mut self) -> Result<(), AudioError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), AudioError> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingOutput;

    impl AudioOutput for FailingOutput {
        fn play(&mut self) -> Result<(), AudioError> {
            Err(AudioError::StreamError("device unplugged".to_string()))
        }

        fn pause(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    #[test]
    fn test_map_channels() {
        let stereo = [0.2, 0.4, 0.6, 0.8];
        let mut mono = [0.0f32; 2];
        map_channels(&stereo, &mut mono, 1);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] - 0.7).abs() < 1e-6);

        let mut quad = [9.0f32; 8];
        map_channels(&stereo, &mut quad, 4);
        assert_eq!(quad, [0.2, 0.4, 0.0, 0.0, 0.6, 0.8, 0.0, 0.0]);
    }

    #[test]
    fn test_controller_starts_and_stops() {
        let buffer = Arc::new(JitterBuffer::new());
        let (mut engine, _events) = PullEngine::new(buffer.clone());
        let output = CountingOutput::default();
        let mut controller = PlaybackController::new(
            output.clone(),
            engine.control(),
            buffer.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        buffer.push(Chunk::new(vec![0.5; 4]));
        controller.on_chunk_queued().unwrap();
        buffer.push(Chunk::new(vec![0.5; 4]));
        controller.on_chunk_queued().unwrap();
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), PlaybackState::Running);

        // Drain everything; the engine starts starving
        let mut out = [0.0f32; 16];
        engine.fill(&mut out);
        assert!(engine.control().is_starving());

        let t0 = Instant::now();
        controller.tick(t0).unwrap();
        controller.tick(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(output.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), PlaybackState::Stopped);

        // Resuming clears the held 0.5 before audio flows again
        buffer.push(Chunk::new(vec![0.25; 4]));
        controller.on_chunk_queued().unwrap();
        assert_eq!(output.plays.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.target_queue_size(), None);
        buffer.flush();
        let mut out = [1.0f32; 8];
        engine.fill(&mut out);
        assert_eq!(out, [0.0; 8]);
    }

    /// Output thread stand-in: `Play` answers after `play_delay`, `Pause` fails
    fn slow_output_thread(play_delay: Duration) -> (OutputLink, JoinHandle<()>) {
        let (commands, command_rx) = bounded::<OutputCommand>(4);
        let handle = thread::spawn(move || {
            while let Ok(command) = command_rx.recv() {
                let OutputCommand::Run { request, reply } = command else {
                    break;
                };
                let result = match request {
                    OutputRequest::Play => {
                        thread::sleep(play_delay);
                        Ok(())
                    }
                    OutputRequest::Pause => Err(AudioError::StreamError("pause failed".to_string())),
                };
                let _ = reply.send(result);
            }
        });
        let link = OutputLink {
            commands,
            timeout: Duration::from_millis(20),
        };
        (link, handle)
    }

    #[test]
    fn test_late_reply_does_not_answer_next_request() {
        let (link, handle) = slow_output_thread(Duration::from_millis(100));

        assert!(matches!(
            link.request(OutputRequest::Play),
            Err(AudioError::CommandTimeout(_))
        ));
        // Let the late Ok for Play arrive; it must not be read as the Pause result
        thread::sleep(Duration::from_millis(150));
        match link.request(OutputRequest::Pause) {
            Err(AudioError::StreamError(msg)) => assert_eq!(msg, "pause failed"),
            other => panic!("unexpected pause result: {:?}", other),
        }
        assert!(link.request(OutputRequest::Pause).is_err());

        link.shutdown();
        handle.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_inside_runtime() {
        let (link, handle) = slow_output_thread(Duration::from_millis(1));
        let link = OutputLink {
            timeout: Duration::from_millis(500),
            ..link
        };
        assert!(link.request(OutputRequest::Play).is_ok());
        link.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_start_failure_is_reported() {
        let buffer = Arc::new(JitterBuffer::new());
        let (engine, _events) = PullEngine::new(buffer.clone());
        let mut controller = PlaybackController::new(
            FailingOutput,
            engine.control(),
            buffer.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        buffer.push(Chunk::new(vec![0.5; 4]));
        assert!(controller.on_chunk_queued().is_err());
        assert_eq!(controller.state(), PlaybackState::Stopped);
    }
}
