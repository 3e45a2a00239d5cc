/// Decoded video frames handed to the renderer
use bytes::Bytes;

/// Pixel format for decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    YUV420P,
    NV12,
    RGBA,
}

impl PixelFormat {
    pub fn to_ffmpeg(&self) -> ffmpeg_next::format::Pixel {
        use ffmpeg_next::format::Pixel;
        match self {
            PixelFormat::YUV420P => Pixel::YUV420P,
            PixelFormat::NV12 => Pixel::NV12,
            PixelFormat::RGBA => Pixel::RGBA,
        }
    }

    /// Size in bytes of a tightly packed `width` x `height` image
    pub fn image_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::RGBA => w * h * 4,
            // Full-size luma plus two quarter-size chroma planes
            PixelFormat::YUV420P | PixelFormat::NV12 => w * h + 2 * ((w / 2) * (h / 2)),
        }
    }
}

/// Decoded video frame with metadata
///
/// The pixel data is reference counted, so clones are cheap and listeners
/// can keep a frame past the callback.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp in microseconds
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn new(pts: i64, width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            pts,
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Get stride (bytes per row) of the first plane
    pub fn stride(&self) -> usize {
        match self.format {
            PixelFormat::RGBA => self.width as usize * 4,
            PixelFormat::YUV420P | PixelFormat::NV12 => self.width as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size() {
        assert_eq!(PixelFormat::RGBA.image_size(4, 2), 32);
        assert_eq!(PixelFormat::YUV420P.image_size(4, 2), 12);
        assert_eq!(PixelFormat::NV12.image_size(4, 2), 12);
    }

    #[test]
    fn test_stride() {
        let frame = VideoFrame::new(0, 640, 480, PixelFormat::RGBA, Bytes::new());
        assert_eq!(frame.stride(), 2560);
    }
}
