use cpal::{
    SampleRate, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{AudioFormat, StereoDownmixer};
use crate::media::{MediaError, Result};

/// How long a single `write` waits for room in the line before giving up
const WRITE_WAIT: Duration = Duration::from_millis(20);

/// Blocking platform audio output line
#[cfg_attr(test, mockall::automock)]
pub trait AudioSink: Send {
    /// Format the line accepts
    fn format(&self) -> AudioFormat;

    /// Write interleaved bytes, returning how many were accepted.
    ///
    /// Blocks while the line is full; may accept fewer bytes than offered
    /// (always whole frames) and returns 0 if no room opened up in time.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Discard anything queued in the line but not yet played
    fn flush(&mut self);
}

/// Opens an audio line for a session's audio format
#[cfg_attr(test, mockall::automock)]
pub trait AudioSinkFactory: Send {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioSink>>;
}

/// Sample ring between `write` and the device callback
struct Line {
    samples: Mutex<VecDeque<f32>>,
    space: Condvar,
    capacity: usize,
}

impl Line {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Fill `out` from the ring, padding with silence on underrun
    fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut samples = self.samples.lock();
        let available = samples.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(samples.drain(..available)) {
            *dst = src;
        }
        out[available..].fill(0.0);
        drop(samples);

        self.space.notify_all();
        available
    }
}

enum DeviceCommand {
    Play,
    Pause,
}

/// Audio output line on the default cpal device
///
/// cpal streams are not `Send`, so the stream lives on a small owner thread
/// and is driven through a command channel; samples flow through a shared
/// ring that the device callback drains.
pub struct CpalAudioSink {
    input: AudioFormat,
    output_channels: u16,
    line: Arc<Line>,
    commands: Option<Sender<DeviceCommand>>,
    device_thread: Option<JoinHandle<()>>,
}

impl CpalAudioSink {
    /// Open the default output device for `format`
    ///
    /// # Arguments
    /// * `format` - Format of the blocks that will be written
    /// * `line_buffer_ms` - Size of the ring between writer and device
    pub fn open(format: AudioFormat, line_buffer_ms: u32) -> Result<Self> {
        let output_channels = Self::negotiate(format)?;
        let capacity =
            (line_buffer_ms as usize * format.sample_rate as usize / 1000) * output_channels as usize;
        let line = Arc::new(Line::new(capacity.max(output_channels as usize)));

        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);
        let (command_tx, command_rx) = channel::unbounded::<DeviceCommand>();
        let device_line = line.clone();

        let device_thread = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(format.sample_rate, output_channels, device_line)
                {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Runs until the sink drops its sender
                for command in command_rx.iter() {
                    let result = match command {
                        DeviceCommand::Play => stream.play().map_err(|e| e.to_string()),
                        DeviceCommand::Pause => stream.pause().map_err(|e| e.to_string()),
                    };
                    if let Err(e) = result {
                        tracing::error!("Audio stream control failed: {}", e);
                    }
                }
            })
            .map_err(|e| MediaError::AudioLineUnavailable(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| MediaError::AudioLineUnavailable("audio device thread exited".into()))??;

        tracing::info!(
            "Audio line open: {} Hz, {} -> {} channels, {} ms buffer",
            format.sample_rate,
            format.channels,
            output_channels,
            line_buffer_ms
        );

        Ok(Self {
            input: format,
            output_channels,
            line,
            commands: Some(command_tx),
            device_thread: Some(device_thread),
        })
    }

    /// Pick the output channel count: the native count when the device
    /// supports it at this rate, otherwise stereo.
    fn negotiate(format: AudioFormat) -> Result<u16> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::AudioLineUnavailable("no output device".into()))?;

        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| MediaError::AudioLineUnavailable(e.to_string()))?
            .collect();

        let supports = |channels: u16| {
            supported.iter().any(|range| {
                range.channels() == channels
                    && range.sample_format() == cpal::SampleFormat::F32
                    && range.min_sample_rate() <= SampleRate(format.sample_rate)
                    && range.max_sample_rate() >= SampleRate(format.sample_rate)
            })
        };

        if supports(format.channels) {
            Ok(format.channels)
        } else if supports(2) {
            tracing::warn!(
                "Output device does not support {} channels, falling back to stereo",
                format.channels
            );
            Ok(2)
        } else {
            Err(MediaError::AudioLineUnavailable(format!(
                "no f32 output config at {} Hz",
                format.sample_rate
            )))
        }
    }

    fn build_stream(sample_rate: u32, channels: u16, line: Arc<Line>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::AudioLineUnavailable("no output device".into()))?;

        tracing::info!(
            "Using audio device: {}",
            device.name().unwrap_or("Unknown".to_string())
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let written = line.pop_into(data);
                    if written < data.len() {
                        tracing::trace!("Audio line underrun: {} samples padded", data.len() - written);
                    }
                },
                |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::AudioLineUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::AudioLineUnavailable(e.to_string()))?;

        Ok(stream)
    }

    fn send(&self, command: DeviceCommand) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(command);
        }
    }
}

impl AudioSink for CpalAudioSink {
    fn format(&self) -> AudioFormat {
        self.input
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let frame_size = self.input.frame_size();
        if frame_size == 0 || data.len() < frame_size {
            return Ok(0);
        }

        let mut samples = self.line.samples.lock();
        if samples.len() + self.output_channels as usize > self.line.capacity {
            self.line.space.wait_for(&mut samples, WRITE_WAIT);
        }

        let room_frames = (self.line.capacity.saturating_sub(samples.len()))
            / self.output_channels as usize;
        let frames = (data.len() / frame_size).min(room_frames);
        if frames == 0 {
            return Ok(0);
        }

        let accepted = &data[..frames * frame_size];
        let converted;
        let (bytes, channels) = if self.input.channels != self.output_channels {
            converted = StereoDownmixer::downmix_interleaved(
                accepted,
                self.input.channels,
                self.input.sample_format,
            );
            (&converted[..], 2)
        } else {
            (accepted, self.input.channels)
        };
        debug_assert_eq!(channels, self.output_channels);

        let width = self.input.sample_format.bytes_per_sample();
        samples.extend(
            bytes
                .chunks_exact(width)
                .map(|s| self.input.sample_format.read(s)),
        );

        Ok(frames * frame_size)
    }

    fn pause(&mut self) {
        self.send(DeviceCommand::Pause);
    }

    fn resume(&mut self) {
        self.send(DeviceCommand::Play);
    }

    fn flush(&mut self) {
        self.line.samples.lock().clear();
        self.line.space.notify_all();
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        // Closing the channel ends the device thread, which drops the stream
        self.commands.take();
        if let Some(handle) = self.device_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Opens `CpalAudioSink`s on the default device
#[derive(Debug, Clone, Copy)]
pub struct CpalAudioFactory {
    line_buffer_ms: u32,
}

impl CpalAudioFactory {
    pub fn new(line_buffer_ms: u32) -> Self {
        Self { line_buffer_ms }
    }
}

impl AudioSinkFactory for CpalAudioFactory {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalAudioSink::open(format, self.line_buffer_ms)?))
    }
}
