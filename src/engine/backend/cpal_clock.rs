//! CPAL-based precise clock for desktop platforms (Linux, macOS, Windows)
//!
//! The output stream's frame counter *is* the clock: `now()` is the number
//! of frames rendered so far divided by the sample rate. Render requests are
//! converted to absolute frame indices and sent to the audio callback through
//! a lock-free SPSC queue, so each click starts on the exact frame it was
//! scheduled for regardless of when the poll loop got around to sending it.
//!
//! Thread safety:
//! - cpal streams are not `Send`, so the stream lives on a dedicated thread
//!   that only waits for a shutdown signal
//! - frames: AtomicU64 advanced by the audio callback
//! - render commands: rtrb SPSC queue, producer guarded by a mutex on the
//!   (non real-time) scheduling side

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use futures::future::BoxFuture;
use rtrb::{Consumer, Producer, RingBuffer};
use tokio::sync::oneshot;

use crate::error::{log_clock_error, ClockError};

use super::{AudioClock, RenderHandle};

/// Capacity of the render command queue and of the callback's pending list
const RENDER_QUEUE_CAPACITY: usize = 256;

/// Peak amplitude of a click
const CLICK_AMPLITUDE: f32 = 0.5;

/// Command sent from the scheduler to the audio callback
#[derive(Debug, Clone, Copy, PartialEq)]
enum RenderCommand {
    Frequency {
        tone: u64,
        frequency_hz: f32,
        at_frame: u64,
    },
    Envelope {
        envelope: u64,
        at_frame: u64,
        attack_frames: u64,
        decay_frames: u64,
    },
    Release {
        handle: u64,
    },
}

impl RenderCommand {
    fn at_frame(&self) -> u64 {
        match self {
            RenderCommand::Frequency { at_frame, .. } => *at_frame,
            RenderCommand::Envelope { at_frame, .. } => *at_frame,
            RenderCommand::Release { .. } => 0,
        }
    }
}

/// State shared between the clock handle and the audio callback
///
/// `frames` counts from the start of the current stream. Time rendered by
/// earlier streams is folded into `base_bits` (f64 seconds) when a new
/// stream begins, so `now()` stays monotonic across a re-acquire at a
/// different sample rate.
struct SharedClock {
    frames: AtomicU64,
    sample_rate: AtomicU32,
    base_bits: AtomicU64,
}

impl SharedClock {
    fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            base_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    fn base(&self) -> f64 {
        f64::from_bits(self.base_bits.load(Ordering::Acquire))
    }

    fn now(&self) -> f64 {
        let sample_rate = self.sample_rate.load(Ordering::Acquire);
        if sample_rate == 0 {
            return self.base();
        }
        self.base() + self.frames.load(Ordering::Acquire) as f64 / sample_rate as f64
    }

    /// Fold the elapsed time into the base and restart the frame count.
    ///
    /// Only called while no stream is rendering.
    fn begin_stream(&self, sample_rate: u32) {
        let elapsed = self.now();
        self.base_bits.store(elapsed.to_bits(), Ordering::Release);
        self.frames.store(0, Ordering::Release);
        self.sample_rate.store(sample_rate, Ordering::Release);
    }

    /// Absolute clock time to a frame index of the current stream.
    fn seconds_to_frame(&self, seconds: f64) -> u64 {
        self.duration_to_frames(seconds - self.base())
    }

    fn duration_to_frames(&self, seconds: f64) -> u64 {
        let sample_rate = self.sample_rate.load(Ordering::Acquire) as f64;
        if seconds.is_nan() {
            return 0;
        }
        (seconds.max(0.0) * sample_rate).round() as u64
    }
}

/// Live output stream owned by its dedicated thread
struct StreamWorker {
    producer: Producer<RenderCommand>,
    shutdown_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Precise clock backed by the default output device
pub struct CpalClock {
    shared: Arc<SharedClock>,
    worker: Mutex<Option<StreamWorker>>,
    next_handle: AtomicU64,
}

impl CpalClock {
    /// Create a clock without touching the audio device.
    ///
    /// The device is opened lazily by the first `resume_if_suspended`.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedClock::new(0)),
            worker: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<StreamWorker>> {
        self.worker.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn is_live(&self) -> bool {
        self.lock_worker().is_some()
    }

    fn send(&self, command: RenderCommand) -> Result<(), ClockError> {
        match self.lock_worker().as_mut() {
            Some(worker) => worker
                .producer
                .push(command)
                .map_err(|_| ClockError::QueueFull),
            None => Err(ClockError::Closed),
        }
    }

    fn allocate(&self) -> Result<RenderHandle, ClockError> {
        if !self.is_live() {
            return Err(ClockError::Closed);
        }
        Ok(RenderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn acquire(&self) -> Result<(), ClockError> {
        if self.is_live() {
            return Ok(());
        }

        let (producer, consumer) = RingBuffer::new(RENDER_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);

        let thread = std::thread::Builder::new()
            .name("metronome-clock".to_string())
            .spawn(move || run_stream(shared, consumer, ready_tx, shutdown_rx))
            .map_err(|e| ClockError::ResumeFailed {
                reason: format!("Failed to spawn clock thread: {}", e),
            })?;

        let sample_rate = ready_rx.await.map_err(|_| ClockError::ResumeFailed {
            reason: "Clock thread exited before the stream was ready".to_string(),
        })??;

        let mut guard = self.lock_worker();
        if guard.is_some() {
            // A concurrent resume won the race; retire this stream.
            let _ = shutdown_tx.send(());
            let _ = thread.join();
            return Ok(());
        }
        *guard = Some(StreamWorker {
            producer,
            shutdown_tx,
            thread,
        });
        log::info!("[CpalClock] Output stream live at {} Hz", sample_rate);
        Ok(())
    }
}

impl Default for CpalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalClock {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioClock for CpalClock {
    fn now(&self) -> f64 {
        self.shared.now()
    }

    fn resume_if_suspended(&self) -> BoxFuture<'_, Result<(), ClockError>> {
        Box::pin(self.acquire())
    }

    fn create_tone_source(&self) -> Result<RenderHandle, ClockError> {
        self.allocate()
    }

    fn create_envelope_control(&self) -> Result<RenderHandle, ClockError> {
        self.allocate()
    }

    fn schedule_frequency(
        &self,
        tone: RenderHandle,
        frequency_hz: f64,
        at_time: f64,
    ) -> Result<(), ClockError> {
        self.send(RenderCommand::Frequency {
            tone: tone.0,
            frequency_hz: frequency_hz as f32,
            at_frame: self.shared.seconds_to_frame(at_time),
        })
    }

    fn schedule_envelope(
        &self,
        envelope: RenderHandle,
        at_time: f64,
        attack_time: f64,
        decay_time: f64,
    ) -> Result<(), ClockError> {
        self.send(RenderCommand::Envelope {
            envelope: envelope.0,
            at_frame: self.shared.seconds_to_frame(at_time),
            attack_frames: self.shared.duration_to_frames(attack_time),
            decay_frames: self.shared.duration_to_frames(decay_time),
        })
    }

    fn release(&self, handle: RenderHandle) {
        if let Err(err) = self.send(RenderCommand::Release { handle: handle.0 }) {
            if err != ClockError::Closed {
                log_clock_error(&err, "release");
            }
        }
    }

    fn close(&self) {
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(());
            if worker.thread.join().is_err() {
                log::warn!("[CpalClock] Clock thread panicked during shutdown");
            }
            log::info!("[CpalClock] Output stream closed");
        }
    }
}

/// Body of the dedicated stream thread.
fn run_stream(
    shared: Arc<SharedClock>,
    consumer: Consumer<RenderCommand>,
    ready_tx: oneshot::Sender<Result<u32, ClockError>>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let stream = match open_output_stream(Arc::clone(&shared), consumer) {
        Ok(stream) => stream,
        Err(err) => {
            log_clock_error(&err, "open_output_stream");
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(ClockError::ResumeFailed {
            reason: format!("Output start failed: {}", e),
        }));
        return;
    }

    let _ = ready_tx.send(Ok(shared.sample_rate.load(Ordering::Acquire)));

    // Blocks until close() signals or the clock handle is dropped.
    let _ = shutdown_rx.recv();
    drop(stream);
}

fn open_output_stream(
    shared: Arc<SharedClock>,
    consumer: Consumer<RenderCommand>,
) -> Result<cpal::Stream, ClockError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ClockError::DeviceUnavailable {
            reason: "No default output device found".to_string(),
        })?;

    let config = device
        .default_output_config()
        .map_err(|e| ClockError::StreamOpenFailed {
            reason: format!("Failed to get default output config: {:?}", e),
        })?;

    if config.sample_format() != cpal::SampleFormat::F32 {
        return Err(ClockError::StreamOpenFailed {
            reason: "Only F32 sample format is currently supported for output".to_string(),
        });
    }

    let stream_config: cpal::StreamConfig = config.into();
    let channels = stream_config.channels as usize;
    shared.begin_stream(stream_config.sample_rate.0);

    let mut renderer = ToneRenderer::new(consumer, shared, stream_config.sample_rate.0);
    let err_fn = |err| log::error!("[CpalClock] Output stream error: {}", err);

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                renderer.render(data, channels);
            },
            err_fn,
            None,
        )
        .map_err(|e| ClockError::StreamOpenFailed {
            reason: format!("{:?}", e),
        })
}

/// Real-time side: a single sine voice gated by an attack/decay envelope.
///
/// Real-time safe: the pending list is pre-allocated and never grows past
/// its capacity; commands that do not fit are dropped.
struct ToneRenderer {
    consumer: Consumer<RenderCommand>,
    shared: Arc<SharedClock>,
    pending: Vec<RenderCommand>,
    sample_rate: f32,
    tone: Option<u64>,
    envelope: Option<u64>,
    frequency_hz: f32,
    phase: f32,
    envelope_start: Option<u64>,
    attack_frames: u64,
    decay_frames: u64,
}

impl ToneRenderer {
    fn new(consumer: Consumer<RenderCommand>, shared: Arc<SharedClock>, sample_rate: u32) -> Self {
        Self {
            consumer,
            shared,
            pending: Vec::with_capacity(RENDER_QUEUE_CAPACITY),
            sample_rate: sample_rate as f32,
            tone: None,
            envelope: None,
            frequency_hz: 0.0,
            phase: 0.0,
            envelope_start: None,
            attack_frames: 0,
            decay_frames: 0,
        }
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        while let Ok(command) = self.consumer.pop() {
            if self.pending.len() < self.pending.capacity() {
                self.pending.push(command);
            }
        }

        let frame_count = data.len() / channels;
        let frame_start = self.shared.frames.load(Ordering::Acquire);

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            let frame_idx = frame_start + i as u64;
            if !self.pending.is_empty() {
                self.apply_due(frame_idx);
            }

            let sample = self.next_sample(frame_idx);
            frame.fill(sample);
        }

        self.shared
            .frames
            .fetch_add(frame_count as u64, Ordering::Release);
    }

    fn apply_due(&mut self, frame_idx: u64) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].at_frame() <= frame_idx {
                let command = self.pending.swap_remove(i);
                let rescan = matches!(command, RenderCommand::Release { .. });
                self.apply(command, frame_idx);
                if rescan {
                    i = 0;
                }
            } else {
                i += 1;
            }
        }
    }

    fn apply(&mut self, command: RenderCommand, frame_idx: u64) {
        match command {
            RenderCommand::Frequency {
                tone, frequency_hz, ..
            } => {
                self.tone = Some(tone);
                self.frequency_hz = frequency_hz;
            }
            RenderCommand::Envelope {
                envelope,
                attack_frames,
                decay_frames,
                ..
            } => {
                self.envelope = Some(envelope);
                self.envelope_start = Some(frame_idx);
                self.attack_frames = attack_frames;
                self.decay_frames = decay_frames;
                self.phase = 0.0;
            }
            RenderCommand::Release { handle } => {
                if self.tone == Some(handle) {
                    self.tone = None;
                }
                if self.envelope == Some(handle) {
                    self.envelope = None;
                    self.envelope_start = None;
                }
                self.pending.retain(|pending| match pending {
                    RenderCommand::Frequency { tone, .. } => *tone != handle,
                    RenderCommand::Envelope { envelope, .. } => *envelope != handle,
                    RenderCommand::Release { .. } => true,
                });
            }
        }
    }

    fn next_sample(&mut self, frame_idx: u64) -> f32 {
        let (Some(start), Some(_)) = (self.envelope_start, self.tone) else {
            return 0.0;
        };
        let elapsed = frame_idx.saturating_sub(start);
        let gain = if elapsed < self.attack_frames {
            elapsed as f32 / self.attack_frames as f32
        } else if elapsed < self.attack_frames + self.decay_frames {
            let decayed = (elapsed - self.attack_frames) as f32 / self.decay_frames as f32;
            (1.0 - decayed) * (1.0 - decayed)
        } else {
            self.envelope_start = None;
            return 0.0;
        };

        let sample = (self.phase * TAU).sin() * gain * CLICK_AMPLITUDE;
        self.phase = (self.phase + self.frequency_hz / self.sample_rate).fract();
        sample
    }
}
