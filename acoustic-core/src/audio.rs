//! # Audio Input Module
//!
//! Sample blocks and the sources that produce them. A [`SampleSource`] is an
//! exclusive, scoped resource: it is opened when a capture session is armed
//! and closed on every path out of capture.
//!
//! ## Sources
//! - [`ChannelSource`]: blocks pushed from another thread (audio callback)
//! - [`BufferSource`]: playback of an in-memory recording
//! - `MicrophoneSource`: the default input device via CPAL (`microphone` feature)

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, warn};

use crate::error::AudioError;

/// Default number of samples per analysis block.
///
/// Larger blocks give more frequency resolution but increase latency.
pub const BUFFER_SIZE: usize = 2048;

/// A fixed-length run of mono samples in `[-1, 1]` tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration covered by this block in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Root-mean-square level of the block.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root-mean-square level of a slice; zero for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (energy / samples.len() as f64).sqrt() as f32
}

/// A live (or replayed) mono stream delivering fixed-size blocks.
pub trait SampleSource {
    /// Acquire the underlying device. Calling `open` on an open source is a no-op.
    fn open(&mut self) -> Result<(), AudioError>;

    /// Release the underlying device. Must be safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn sample_rate(&self) -> u32;

    fn block_size(&self) -> usize;

    /// Returns the next complete block, or `None` if no block is ready yet.
    fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn open(&mut self) -> Result<(), AudioError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError> {
        (**self).next_block()
    }
}

/// Accumulates arbitrarily sized chunks (as delivered by an audio callback)
/// into fixed-size [`SampleBlock`]s.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Appends `data` and hands every complete block to `emit`.
    pub fn feed(&mut self, data: &[f32], mut emit: impl FnMut(SampleBlock)) {
        self.pending.extend_from_slice(data);

        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            emit(SampleBlock::new(block, self.sample_rate));
        }
    }

    /// Number of buffered samples not yet forming a full block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Producer half of a [`ChannelSource`], meant to live inside an audio callback.
#[derive(Debug)]
pub struct BlockSender {
    assembler: BlockAssembler,
    sender: Sender<SampleBlock>,
}

impl BlockSender {
    /// Pushes raw samples. Blocks that do not fit in the queue are dropped
    /// rather than stalling the producer.
    pub fn push_samples(&mut self, data: &[f32]) {
        let sender = &self.sender;
        self.assembler.feed(data, |block| match sender.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Sample queue full, dropping block"),
            Err(TrySendError::Disconnected(_)) => {}
        });
    }

    /// Pushes an already assembled block.
    pub fn push_block(&self, block: SampleBlock) -> bool {
        self.sender.try_send(block).is_ok()
    }
}

/// A [`SampleSource`] fed through a bounded crossbeam channel.
#[derive(Debug)]
pub struct ChannelSource {
    receiver: Receiver<SampleBlock>,
    sample_rate: u32,
    block_size: usize,
    open: bool,
}

/// Creates a connected producer/consumer pair holding at most `capacity` blocks.
pub fn channel_source(
    sample_rate: u32,
    block_size: usize,
    capacity: usize,
) -> (BlockSender, ChannelSource) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    let producer = BlockSender {
        assembler: BlockAssembler::new(block_size, sample_rate),
        sender,
    };
    let consumer = ChannelSource {
        receiver,
        sample_rate,
        block_size,
        open: false,
    };
    (producer, consumer)
}

impl ChannelSource {
    fn drain_stale(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl SampleSource for ChannelSource {
    fn open(&mut self) -> Result<(), AudioError> {
        if !self.open {
            let stale = self.drain_stale();
            if stale > 0 {
                debug!("Discarded {} stale blocks on open", stale);
            }
            self.open = true;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.drain_stale();
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError> {
        if !self.open {
            return Err(AudioError::SourceClosed);
        }
        match self.receiver.try_recv() {
            Ok(block) => Ok(Some(block)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                warn!("Sample producer disconnected");
                Err(AudioError::Stream("producer disconnected".into()))
            }
        }
    }
}

/// Plays back an in-memory recording one block at a time.
///
/// The trailing partial block is never emitted.
#[derive(Debug, Clone)]
pub struct BufferSource {
    samples: Vec<f32>,
    sample_rate: u32,
    block_size: usize,
    position: usize,
    open: bool,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            samples,
            sample_rate,
            block_size,
            position: 0,
            open: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.position + self.block_size > self.samples.len()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl SampleSource for BufferSource {
    fn open(&mut self) -> Result<(), AudioError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError> {
        if !self.open {
            return Err(AudioError::SourceClosed);
        }
        if self.is_exhausted() {
            return Ok(None);
        }
        let end = self.position + self.block_size;
        let block = SampleBlock::new(self.samples[self.position..end].to_vec(), self.sample_rate);
        self.position = end;
        Ok(Some(block))
    }
}

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneSource;

#[cfg(feature = "microphone")]
mod microphone {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BuildStreamError, SupportedStreamConfigRange};
    use log::{error, info, warn};

    use super::{BlockSender, ChannelSource, SampleBlock, SampleSource, channel_source};
    use crate::error::AudioError;

    /// Blocks buffered between the device callback and the audio tick.
    const QUEUE_CAPACITY: usize = 16;

    /// Captures from the default input device using CPAL.
    ///
    /// The device is only held between [`SampleSource::open`] and
    /// [`SampleSource::close`]; dropping the source closes it as well.
    pub struct MicrophoneSource {
        target_rate: u32,
        block_size: usize,
        sample_rate: u32,
        stream: Option<cpal::Stream>,
        consumer: Option<ChannelSource>,
    }

    impl MicrophoneSource {
        pub fn new(target_rate: u32, block_size: usize) -> Self {
            Self {
                target_rate,
                block_size,
                sample_rate: target_rate,
                stream: None,
                consumer: None,
            }
        }

        fn start_stream(&mut self) -> Result<(), AudioError> {
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or(AudioError::NoDevice)?;

            info!(
                "Using audio input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let configs = device
                .supported_input_configs()
                .map_err(|e| AudioError::Enumeration(e.to_string()))?
                .collect::<Vec<_>>();
            let supported = find_supported_config(configs, self.target_rate)
                .ok_or(AudioError::UnsupportedFormat)?;

            let rate = self
                .target_rate
                .clamp(supported.min_sample_rate().0, supported.max_sample_rate().0);
            let config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).into();
            let channels = config.channels.max(1) as usize;
            info!("Selected sample rate: {} Hz, {} channel(s)", rate, channels);

            let (mut producer, consumer): (BlockSender, ChannelSource) =
                channel_source(rate, self.block_size, QUEUE_CAPACITY);
            let mut mono = Vec::with_capacity(self.block_size);

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if channels == 1 {
                            producer.push_samples(data);
                        } else {
                            mono.clear();
                            mono.extend(data.chunks(channels).map(|frame| frame[0]));
                            producer.push_samples(&mono);
                        }
                    },
                    |err| error!("An error occurred on the audio stream: {}", err),
                    None,
                )
                .map_err(map_build_error)?;

            stream
                .play()
                .map_err(|e| AudioError::Stream(e.to_string()))?;

            let mut consumer = consumer;
            consumer.open()?;
            self.sample_rate = rate;
            self.stream = Some(stream);
            self.consumer = Some(consumer);
            Ok(())
        }
    }

    impl SampleSource for MicrophoneSource {
        fn open(&mut self) -> Result<(), AudioError> {
            if self.stream.is_some() {
                return Ok(());
            }
            self.start_stream()
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                if let Err(e) = stream.pause() {
                    warn!("Error pausing stream: {}", e);
                }
                drop(stream);
                info!("Audio input released");
            }
            if let Some(mut consumer) = self.consumer.take() {
                consumer.close();
            }
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn block_size(&self) -> usize {
            self.block_size
        }

        fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError> {
            match self.consumer.as_mut() {
                Some(consumer) => consumer.next_block(),
                None => Err(AudioError::SourceClosed),
            }
        }
    }

    impl Drop for MicrophoneSource {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn map_build_error(err: BuildStreamError) -> AudioError {
        match err {
            BuildStreamError::DeviceNotAvailable => AudioError::NoDevice,
            BuildStreamError::StreamConfigNotSupported => AudioError::UnsupportedFormat,
            BuildStreamError::BackendSpecific { err } => {
                let description = err.description.to_lowercase();
                if description.contains("permission") || description.contains("denied") {
                    AudioError::PermissionDenied
                } else {
                    AudioError::Stream(err.description)
                }
            }
            other => AudioError::Stream(other.to_string()),
        }
    }

    /// Picks an f32 input configuration, preferring mono, closest to `target_rate`.
    fn find_supported_config(
        configs: Vec<SupportedStreamConfigRange>,
        target_rate: u32,
    ) -> Option<SupportedStreamConfigRange> {
        configs
            .into_iter()
            .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
            .min_by_key(|c| {
                let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
                let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
                let in_range = c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0;
                let rate_cost = if in_range { 0 } else { min_diff.min(max_diff) };
                (c.channels() != 1, rate_cost)
            })
    }
}
