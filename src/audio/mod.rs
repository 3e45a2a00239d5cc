/// Audio downmixing, output queue and device sink
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod downmix;
pub mod output;
pub mod sink;

pub use downmix::StereoDownmixer;
pub use output::{AudioOutputStage, AudioQueue};
pub use sink::{AudioSink, AudioSinkFactory, CpalAudioFactory, CpalAudioSink};

/// Interleaved little-endian PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }

    /// Read one sample from `bytes` as a value in [-1.0, 1.0]
    pub fn read(&self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
            SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            SampleFormat::S24 => {
                // Sign-extend through the top byte of an i32
                let v = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
                v as f32 / 8_388_608.0
            }
            SampleFormat::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / 2_147_483_648.0
            }
            SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Layout of an audio block or output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Same rate and depth with two channels
    pub fn stereo(&self) -> Self {
        Self {
            channels: 2,
            ..*self
        }
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }
}

/// Decoded, interleaved audio samples with their presentation timestamp
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Presentation timestamp in microseconds
    pub pts: i64,
    pub format: AudioFormat,
    pub data: Bytes,
}

impl AudioBlock {
    pub fn new(pts: i64, format: AudioFormat, data: impl Into<Bytes>) -> Self {
        Self {
            pts,
            format,
            data: data.into(),
        }
    }

    /// Number of complete frames in the block
    pub fn frames(&self) -> usize {
        let frame_size = self.format.frame_size();
        if frame_size == 0 {
            0
        } else {
            self.data.len() / frame_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_read() {
        assert_eq!(SampleFormat::U8.read(&[128]), 0.0);
        assert_eq!(SampleFormat::S16.read(&(-32768i16).to_le_bytes()), -1.0);
        assert_eq!(SampleFormat::S24.read(&[0x00, 0x00, 0x80]), -1.0);
        assert_eq!(SampleFormat::S24.read(&[0x00, 0x00, 0x40]), 0.5);
        assert_eq!(SampleFormat::F32.read(&0.25f32.to_le_bytes()), 0.25);
    }

    #[test]
    fn test_block_frames() {
        let format = AudioFormat::new(44100, 6, SampleFormat::S16);
        assert_eq!(format.frame_size(), 12);
        assert_eq!(format.stereo().frame_size(), 4);

        let block = AudioBlock::new(0, format, vec![0u8; 12 * 10 + 5]);
        assert_eq!(block.frames(), 10);
    }
}
