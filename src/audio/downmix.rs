use bytes::Bytes;

use super::{AudioBlock, SampleFormat};
use crate::media::{MediaError, Result};

/// Reduces interleaved blocks of any channel count to 2-channel interleaved
/// output at the same sample depth.
///
/// Mono is duplicated to both sides. For more than two channels the
/// even-indexed channels are averaged into the left output and the
/// odd-indexed channels into the right output (so L/R/C/LFE/Ls/Rs folds the
/// centre and surrounds into their side). Stereo input is returned unchanged.
pub struct StereoDownmixer;

impl StereoDownmixer {
    pub fn downmix(block: &AudioBlock) -> Result<AudioBlock> {
        let format = block.format;
        if format.channels == 0 {
            return Err(MediaError::UnsupportedFormat(
                "audio block with zero channels".to_string(),
            ));
        }
        if format.channels == 2 {
            return Ok(block.clone());
        }

        let data = Self::downmix_interleaved(&block.data, format.channels, format.sample_format);
        Ok(AudioBlock {
            pts: block.pts,
            format: format.stereo(),
            data: Bytes::from(data),
        })
    }

    /// Downmix raw interleaved bytes; a trailing partial frame is discarded
    pub fn downmix_interleaved(data: &[u8], channels: u16, format: SampleFormat) -> Vec<u8> {
        let width = format.bytes_per_sample();
        let channels = channels as usize;
        let frame_size = width * channels;
        if frame_size == 0 {
            return Vec::new();
        }
        if channels == 2 {
            return data[..data.len() - data.len() % frame_size].to_vec();
        }

        let frames = data.len() / frame_size;
        let mut out = Vec::with_capacity(frames * width * 2);
        for frame in data.chunks_exact(frame_size) {
            let (left, right) = if channels == 1 {
                (&frame[..width], &frame[..width])
            } else {
                (frame, &frame[width..])
            };
            // Even channels start at 0, odd channels start one sample in
            mix_side(left, width, channels, format, &mut out);
            mix_side(right, width, channels, format, &mut out);
        }
        out
    }
}

/// Average every second sample of `frame` (starting at its first sample)
fn mix_side(frame: &[u8], width: usize, channels: usize, format: SampleFormat, out: &mut Vec<u8>) {
    if channels == 1 {
        out.extend_from_slice(&frame[..width]);
        return;
    }

    let samples = frame.chunks_exact(width).step_by(2);
    match format {
        SampleFormat::F32 => {
            let (sum, count) = samples.fold((0.0f64, 0u32), |(sum, count), s| {
                (sum + format.read(s) as f64, count + 1)
            });
            let mean = if count == 0 { 0.0 } else { sum / count as f64 };
            out.extend_from_slice(&(mean as f32).to_le_bytes());
        }
        _ => {
            let (sum, count) = samples.fold((0i64, 0i64), |(sum, count), s| {
                (sum + read_int(s, format), count + 1)
            });
            let mean = if count == 0 { 0 } else { sum / count };
            write_int(mean, format, out);
        }
    }
}

fn read_int(bytes: &[u8], format: SampleFormat) -> i64 {
    match format {
        SampleFormat::U8 => bytes[0] as i64,
        SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        SampleFormat::S24 => (i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8) as i64,
        SampleFormat::S32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        SampleFormat::F32 => unreachable!("float samples are mixed separately"),
    }
}

fn write_int(value: i64, format: SampleFormat, out: &mut Vec<u8>) {
    match format {
        SampleFormat::U8 => out.push(value as u8),
        SampleFormat::S16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
        SampleFormat::S24 => out.extend_from_slice(&(value as i32).to_le_bytes()[..3]),
        SampleFormat::S32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
        SampleFormat::F32 => unreachable!("float samples are mixed separately"),
    }
}
