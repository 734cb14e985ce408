use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes per pixel of the packed RGB24 layout every backend normalises to
pub const RGB_CHANNELS: usize = 3;

/// Frame data plus capture metadata.
///
/// Frames are not cloned: whichever pipeline stage holds one owns it, and it
/// goes back to the [`FramePool`](super::FramePool) once that stage is done.
#[derive(Debug)]
pub struct Frame {
    /// Packed RGB24 pixels, `width * height * 3` bytes once filled
    pub data: Vec<u8>,

    pub info: FrameInfo,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Store this frame belongs to
    pub store_id: String,
    /// Stream this frame belongs to
    pub stream_id: u32,
    /// Monotonic per stream, assigned on successful capture
    pub frame_id: u64,
    /// Event this frame belongs to, 0 while no event is open
    pub action_id: u32,
    /// Capture time
    pub timestamp: Option<SystemTime>,
    pub width: u32,
    pub height: u32,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuyv4,
    Mjpeg,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            info: FrameInfo::default(),
        }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            info: FrameInfo::default(),
        }
    }

    /// Drop image content and zero metadata, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.info = FrameInfo::default();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.info.width == 0 || self.info.height == 0
    }

    /// Borrowed RGB view, `None` when the buffer does not match the dimensions
    pub fn view(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        let expected = self.info.width as usize * self.info.height as usize * RGB_CHANNELS;
        if self.data.len() != expected || expected == 0 {
            return None;
        }
        ImageBuffer::from_raw(self.info.width, self.info.height, self.data.as_slice())
    }

    /// Replace the pixels, reusing the existing allocation
    pub fn set_pixels(&mut self, width: u32, height: u32, pixels: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(pixels);
        self.info.width = width;
        self.info.height = height;
    }

    /// Capture time as seconds since the unix epoch
    pub fn unix_timestamp(&self) -> u64 {
        self.info
            .timestamp
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_requires_matching_buffer() {
        let mut frame = Frame::new();
        assert!(frame.view().is_none());

        frame.set_pixels(2, 2, &[7u8; 12]);
        let view = frame.view().expect("view");
        assert_eq!(view.dimensions(), (2, 2));
        assert_eq!(view.get_pixel(1, 1).0, [7, 7, 7]);

        frame.data.pop();
        assert!(frame.view().is_none());
    }

    #[test]
    fn clear_keeps_allocation() {
        let mut frame = Frame::with_capacity(64);
        frame.set_pixels(2, 2, &[1u8; 12]);
        frame.info.frame_id = 9;
        frame.info.action_id = 3;
        frame.clear();

        assert!(frame.data.is_empty());
        assert!(frame.data.capacity() >= 12);
        assert_eq!(frame.info, FrameInfo::default());
    }
}
