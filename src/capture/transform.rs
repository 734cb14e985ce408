//! Image transforms used by sources, the motion detector and the recorder.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GenericImageView, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Rotation applied to every frame read from a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    CounterClockwise90,
    Rotate180,
}

impl Rotation {
    /// 90 degree rotations swap the reported width and height
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Clockwise90 | Rotation::CounterClockwise90)
    }

    pub fn apply_to_size(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

impl TryFrom<u8> for Rotation {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::None),
            1 => Ok(Rotation::Clockwise90),
            2 => Ok(Rotation::CounterClockwise90),
            3 => Ok(Rotation::Rotate180),
            other => Err(format!("invalid rotation {other}, expected 0..=3")),
        }
    }
}

impl From<Rotation> for u8 {
    fn from(rotation: Rotation) -> Self {
        rotation as u8
    }
}

pub fn rotate<I>(image: &I, rotation: Rotation) -> Option<RgbImage>
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    match rotation {
        Rotation::None => None,
        Rotation::Clockwise90 => Some(imageops::rotate90(image)),
        Rotation::CounterClockwise90 => Some(imageops::rotate270(image)),
        Rotation::Rotate180 => Some(imageops::rotate180(image)),
    }
}

/// Bilinear resize to an exact size
pub fn resize<I>(image: &I, width: u32, height: u32) -> RgbImage
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    imageops::resize(image, width.max(1), height.max(1), FilterType::Triangle)
}

/// Shrink both axes by an integer factor
pub fn downscale<I>(image: &I, factor: u32) -> RgbImage
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    let (width, height) = image.dimensions();
    let factor = factor.max(1);
    resize(image, width / factor, height / factor)
}

pub fn to_gray<I>(image: &I) -> GrayImage
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    let (width, height) = image.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| image.get_pixel(x, y).to_luma())
}

/// Per-pixel absolute difference of two same-sized intensity images
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let data = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&p, &q)| p.abs_diff(q))
        .collect();
    GrayImage::from_raw(a.width(), a.height(), data).unwrap_or_else(|| GrayImage::new(0, 0))
}

/// Binary threshold in place: pixels above `thresh` become 255, the rest 0
pub fn threshold(image: &mut GrayImage, thresh: u8) {
    for Luma([p]) in image.pixels_mut() {
        *p = if *p > thresh { u8::MAX } else { 0 };
    }
}

pub fn count_nonzero(image: &GrayImage) -> u32 {
    image.as_raw().iter().filter(|&&p| p != 0).count() as u32
}

/// Encode RGB pixels as a baseline JPEG
pub fn encode_jpeg<I>(image: &I, quality: u8) -> Result<Bytes>
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode_image(image)?;
    }
    Ok(Bytes::from(out.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn rotation_swaps_reported_size() {
        assert_eq!(Rotation::Clockwise90.apply_to_size(640, 480), (480, 640));
        assert_eq!(Rotation::Rotate180.apply_to_size(640, 480), (640, 480));

        let img = gradient(4, 2);
        let rotated = rotate(&img, Rotation::Clockwise90).unwrap();
        assert_eq!(rotated.dimensions(), (2, 4));
        // Top-left of a clockwise rotation is the old bottom-left
        assert_eq!(rotated.get_pixel(0, 0).0, [0, 1, 0]);
        assert!(rotate(&img, Rotation::None).is_none());
    }

    #[test]
    fn rotation_parses_from_config_numbers() {
        assert_eq!(Rotation::try_from(2), Ok(Rotation::CounterClockwise90));
        assert!(Rotation::try_from(4).is_err());
    }

    #[test]
    fn downscale_divides_each_axis() {
        let img = gradient(60, 30);
        assert_eq!(downscale(&img, 6).dimensions(), (10, 5));
        assert_eq!(downscale(&img, 0).dimensions(), (60, 30));
    }

    #[test]
    fn diff_threshold_count() {
        let a = GrayImage::from_raw(4, 1, vec![0, 10, 100, 255]).unwrap();
        let b = GrayImage::from_raw(4, 1, vec![0, 60, 50, 0]).unwrap();
        let mut diff = abs_diff(&a, &b);
        assert_eq!(diff.as_raw(), &vec![0, 50, 50, 255]);

        threshold(&mut diff, 45);
        assert_eq!(diff.as_raw(), &vec![0, 255, 255, 255]);
        assert_eq!(count_nonzero(&diff), 3);
    }

    #[test]
    fn encodes_jpeg() {
        let bytes = encode_jpeg(&gradient(16, 16), 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
    }
}
