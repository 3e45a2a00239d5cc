use bytes::Bytes;
use ffmpeg::format::Pixel;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::software::resampling::Context as ResamplingContext;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg::{ChannelLayout, Rational};
use ffmpeg_next as ffmpeg;
use std::path::Path;
use std::time::Duration;

use super::{AudioStreamInfo, MediaError, MediaInfo, MediaSource, Packet, Result, VideoStreamInfo};
use crate::audio::{AudioBlock, AudioFormat, SampleFormat};
use crate::video::{PixelFormat, VideoFrame};

/// Convert a stream timestamp to microseconds
fn to_micros(ts: i64, time_base: Rational) -> i64 {
    let num = time_base.numerator() as i128;
    let den = time_base.denominator() as i128;
    if den == 0 {
        return 0;
    }
    let micros = (ts as i128) * 1_000_000 * num / den;
    micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

struct VideoStream {
    index: usize,
    time_base: Rational,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ScalingContext>,
    scaler_input: Option<(Pixel, u32, u32)>,
    output_format: PixelFormat,
    last_pts: i64,
}

impl VideoStream {
    /// Collect every frame the decoder can emit right now
    fn receive_frames(&mut self, fallback_pts: i64) -> Result<Vec<VideoFrame>> {
        let mut frames = Vec::new();
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().unwrap_or(fallback_pts);
                    self.last_pts = pts;
                    frames.push(self.convert(&decoded, pts)?);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(frames)
    }

    /// Convert a decoded frame to a packed `VideoFrame` in the output format
    fn convert(&mut self, frame: &ffmpeg::frame::Video, pts: i64) -> Result<VideoFrame> {
        let width = frame.width();
        let height = frame.height();
        let src_format = frame.format();
        let dst_format = self.output_format.to_ffmpeg();

        let data = if src_format == dst_format {
            self.extract_frame_data(frame)
        } else {
            let input = (src_format, width, height);
            if self.scaler_input != Some(input) {
                self.scaler = Some(ScalingContext::get(
                    src_format,
                    width,
                    height,
                    dst_format,
                    width,
                    height,
                    Flags::BILINEAR,
                )?);
                self.scaler_input = Some(input);
            }
            let Some(scaler) = self.scaler.as_mut() else {
                return Err(MediaError::Decode("scaler unavailable".into()));
            };

            let mut converted = ffmpeg::frame::Video::empty();
            scaler.run(frame, &mut converted)?;
            self.extract_frame_data(&converted)
        };

        Ok(VideoFrame::new(pts, width, height, self.output_format, data))
    }

    /// Copy the frame's planes into one contiguous buffer, dropping row padding
    fn extract_frame_data(&self, frame: &ffmpeg::frame::Video) -> Vec<u8> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let mut buffer = Vec::with_capacity(self.output_format.image_size(frame.width(), frame.height()));

        let planes: &[(usize, usize, usize)] = match self.output_format {
            PixelFormat::RGBA => &[(0, width * 4, height)],
            PixelFormat::YUV420P => &[
                (0, width, height),
                (1, width / 2, height / 2),
                (2, width / 2, height / 2),
            ],
            PixelFormat::NV12 => &[(0, width, height), (1, width, height / 2)],
        };

        for &(plane, row_bytes, rows) in planes {
            let stride = frame.stride(plane);
            let data = frame.data(plane);
            for y in 0..rows {
                let row_start = y * stride;
                buffer.extend_from_slice(&data[row_start..row_start + row_bytes]);
            }
        }
        buffer
    }
}

struct AudioStream {
    index: usize,
    time_base: Rational,
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<ResamplingContext>,
    format: AudioFormat,

    /// Expected timestamp of the next block
    last_pts: i64,
}

impl AudioStream {
    /// Collect every block the decoder can emit right now
    fn receive_blocks(&mut self, fallback_pts: i64) -> Result<Vec<AudioBlock>> {
        let mut blocks = Vec::new();
        let mut next_pts = fallback_pts;
        let mut decoded = ffmpeg::frame::Audio::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().unwrap_or(next_pts);
                    let rate = self.format.sample_rate.max(1) as i64;
                    next_pts = pts.saturating_add(decoded.samples() as i64 * 1_000_000 / rate);
                    self.last_pts = next_pts;
                    if let Some(block) = self.convert(&mut decoded, pts)? {
                        blocks.push(block);
                    }
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(blocks)
    }

    fn layout(&self, frame: &ffmpeg::frame::Audio) -> ChannelLayout {
        let layout = frame.channel_layout();
        if layout.is_empty() {
            ChannelLayout::default(self.format.channels as i32)
        } else {
            layout
        }
    }

    /// (Re)build the resampler when the decoder's output parameters change
    fn ensure_resampler(&mut self, frame: &ffmpeg::frame::Audio) -> Result<()> {
        let src_format = frame.format();
        let src_rate = frame.rate();
        let src_layout = self.layout(frame);

        let needs_recreate = match &self.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != src_format
                    || input.rate != src_rate
                    || input.channel_layout != src_layout
            }
        };

        if needs_recreate {
            self.resampler = Some(ResamplingContext::get(
                src_format,
                src_layout,
                src_rate,
                ffmpeg::format::Sample::I16(SampleType::Packed),
                src_layout,
                self.format.sample_rate,
            )?);
        }
        Ok(())
    }

    /// Interleave a decoded frame as packed S16 at the stream's own layout
    fn convert(&mut self, frame: &mut ffmpeg::frame::Audio, pts: i64) -> Result<Option<AudioBlock>> {
        if frame.channel_layout().is_empty() {
            let layout = self.layout(frame);
            frame.set_channel_layout(layout);
        }
        self.ensure_resampler(frame)?;
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(MediaError::Decode("resampler unavailable".into()));
        };

        let mut output = ffmpeg::frame::Audio::empty();
        resampler.run(frame, &mut output)?;

        let samples = output.samples();
        if samples == 0 {
            return Ok(None);
        }
        let raw = output.data(0);
        let len = (samples * self.format.frame_size()).min(raw.len());
        Ok(Some(AudioBlock::new(
            pts,
            self.format,
            Bytes::copy_from_slice(&raw[..len]),
        )))
    }
}

/// Local file demuxer with one decoder per selected stream
///
/// Video is converted to RGBA, audio to packed S16 at the stream's own rate
/// and channel count. Timestamps handed out are microseconds.
pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    info: MediaInfo,
    video: Option<VideoStream>,
    audio: Option<AudioStream>,

    /// Container position of the last seek, until the next packet is read
    seeked_to: Option<i64>,
}

// SAFETY: the demuxer, decoders and sws/swr contexts are only ever used by
// whichever thread owns the source; ownership moves, access is never shared.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    /// Open a local media file and select its best video and audio streams
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        ffmpeg::init()?;

        let path = path.as_ref();
        let input = ffmpeg::format::input(&path)
            .map_err(|e| MediaError::Open(format!("{}: {}", path.display(), e)))?;

        let video = match input.streams().best(ffmpeg::media::Type::Video) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
                match context.decoder().video() {
                    Ok(decoder) => Some(VideoStream {
                        index: stream.index(),
                        time_base: stream.time_base(),
                        decoder,
                        scaler: None,
                        scaler_input: None,
                        output_format: PixelFormat::RGBA,
                        last_pts: 0,
                    }),
                    Err(e) => {
                        tracing::warn!("No decoder for video stream {}: {}", stream.index(), e);
                        None
                    }
                }
            }
            None => None,
        };

        let audio = match input.streams().best(ffmpeg::media::Type::Audio) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
                match context.decoder().audio() {
                    Ok(decoder) => {
                        let format = AudioFormat::new(
                            decoder.rate(),
                            decoder.channels(),
                            SampleFormat::S16,
                        );
                        Some(AudioStream {
                            index: stream.index(),
                            time_base: stream.time_base(),
                            decoder,
                            resampler: None,
                            format,
                            last_pts: 0,
                        })
                    }
                    Err(e) => {
                        tracing::warn!("No decoder for audio stream {}: {}", stream.index(), e);
                        None
                    }
                }
            }
            None => None,
        };

        let duration = (input.duration() > 0)
            .then(|| Duration::from_micros(input.duration() as u64));

        let info = MediaInfo {
            video: video.as_ref().map(|v| VideoStreamInfo {
                index: v.index,
                width: v.decoder.width(),
                height: v.decoder.height(),
            }),
            audio: audio.as_ref().map(|a| AudioStreamInfo {
                index: a.index,
                format: a.format,
            }),
            duration,
        };

        tracing::info!(
            "Opened {}: video {:?}, audio {:?}, duration {:?}",
            path.display(),
            info.video,
            info.audio,
            info.duration
        );

        Ok(Self {
            input,
            info,
            video,
            audio,
            seeked_to: None,
        })
    }

    fn time_base(&self, stream_index: usize) -> Option<Rational> {
        self.video
            .as_ref()
            .filter(|v| v.index == stream_index)
            .map(|v| v.time_base)
            .or_else(|| {
                self.audio
                    .as_ref()
                    .filter(|a| a.index == stream_index)
                    .map(|a| a.time_base)
            })
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> MediaInfo {
        self.info.clone()
    }

    fn next_packet(&mut self) -> Result<Option<Packet>> {
        self.seeked_to = None;
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let stream_index = packet.stream();
            // Streams we do not decode are skipped here
            let Some(time_base) = self.time_base(stream_index) else {
                continue;
            };

            let pts = packet
                .pts()
                .or(packet.dts())
                .map(|ts| to_micros(ts, time_base))
                .unwrap_or(0);

            return Ok(Some(Packet {
                stream_index,
                pts,
                data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
            }));
        }
    }

    fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>> {
        let stream = self
            .video
            .as_mut()
            .ok_or_else(|| MediaError::Decode("no video stream".into()))?;

        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(Some(packet.pts));
        stream.decoder.send_packet(&av_packet)?;
        stream.receive_frames(packet.pts)
    }

    fn decode_audio(&mut self, packet: &Packet) -> Result<Vec<AudioBlock>> {
        let stream = self
            .audio
            .as_mut()
            .ok_or_else(|| MediaError::Decode("no audio stream".into()))?;

        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(Some(packet.pts));
        stream.decoder.send_packet(&av_packet)?;
        stream.receive_blocks(packet.pts)
    }

    fn flush_video(&mut self) -> Result<Vec<VideoFrame>> {
        let Some(stream) = self.video.as_mut() else {
            return Ok(Vec::new());
        };
        let fallback_pts = stream.last_pts;
        stream.decoder.send_eof()?;
        stream.receive_frames(fallback_pts)
    }

    fn flush_audio(&mut self) -> Result<Vec<AudioBlock>> {
        let Some(stream) = self.audio.as_mut() else {
            return Ok(Vec::new());
        };
        let fallback_pts = stream.last_pts;
        stream.decoder.send_eof()?;
        stream.receive_blocks(fallback_pts)
    }

    fn seek(&mut self, stream_index: usize, target: i64) -> Result<()> {
        // Container seeks move every stream; only the first request since the
        // last read repositions, later ones just flush their decoder
        if self.seeked_to != Some(target) {
            self.input.seek(target, ..)?;
            self.seeked_to = Some(target);
        }

        if let Some(video) = self.video.as_mut().filter(|v| v.index == stream_index) {
            video.decoder.flush();
        } else if let Some(audio) = self.audio.as_mut().filter(|a| a.index == stream_index) {
            audio.decoder.flush();
            audio.resampler = None;
        } else {
            return Err(MediaError::Decode(format!("unknown stream {}", stream_index)));
        }
        tracing::debug!("Stream {} repositioned at {}us", stream_index, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_micros() {
        assert_eq!(to_micros(90_000, Rational::new(1, 90_000)), 1_000_000);
        assert_eq!(to_micros(1001, Rational::new(1, 30_000)), 33_366);
        assert_eq!(to_micros(48_000, Rational::new(1, 48_000)), 1_000_000);
        assert_eq!(to_micros(5, Rational::new(1, 0)), 0);
        assert_eq!(to_micros(i64::MAX, Rational::new(1, 1)), i64::MAX);
        assert_eq!(to_micros(i64::MIN, Rational::new(1, 1)), i64::MIN);
    }

    #[test]
    fn test_open_missing_file() {
        let result = FfmpegSource::open("/nonexistent/clip.mp4");
        assert!(matches!(result, Err(MediaError::Open(_))));
    }
}
