use crate::capture::frame::{PixelFormat, RGB_CHANNELS};
use crate::error::{Error, Result};

/// A decoded image normalised to packed RGB24
pub struct Decoded {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode one captured buffer into RGB24
pub fn decode_frame(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Decoded> {
    match format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 => {
            // Already in RGB format
            Ok(Decoded {
                pixels: data.to_vec(),
                width,
                height,
            })
        }
        PixelFormat::Yuyv4 => Ok(Decoded {
            pixels: yuyv_to_rgb(data, width, height)?,
            width,
            height,
        }),
    }
}

#[cfg(feature = "fast-jpeg")]
pub fn decode_jpeg(data: &[u8]) -> Result<Decoded> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| Error::Decode(format!("{e:?}")))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| Error::Decode("missing jpeg dimensions".into()))?;
    let channels = pixels.len() / (width * height).max(1);
    normalise(pixels, width as u32, height as u32, channels)
}

#[cfg(not(feature = "fast-jpeg"))]
pub fn decode_jpeg(data: &[u8]) -> Result<Decoded> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder.decode().map_err(|e| Error::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| Error::Decode("missing jpeg header".into()))?;
    let channels = match info.pixel_format {
        jpeg_decoder::PixelFormat::L8 => 1,
        jpeg_decoder::PixelFormat::RGB24 => RGB_CHANNELS,
        other => return Err(Error::Decode(format!("unsupported jpeg pixel format {other:?}"))),
    };
    normalise(pixels, info.width as u32, info.height as u32, channels)
}

fn normalise(pixels: Vec<u8>, width: u32, height: u32, channels: usize) -> Result<Decoded> {
    let pixels = match channels {
        RGB_CHANNELS => pixels,
        1 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        n => return Err(Error::Decode(format!("unexpected {n} channel jpeg output"))),
    };
    Ok(Decoded {
        pixels,
        width,
        height,
    })
}

/// Packed YUYV 4:2:2 to RGB24 (BT.601, integer math)
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * 2;
    if data.len() < expected {
        return Err(Error::Decode(format!(
            "short yuyv buffer: {} < {expected}",
            data.len()
        )));
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * RGB_CHANNELS);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::transform::encode_jpeg;
    use image::{ImageBuffer, Rgb, RgbImage};

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let img: RgbImage = ImageBuffer::from_pixel(24, 16, Rgb([120, 120, 120]));
        let jpeg = encode_jpeg(&img, 90).unwrap();

        let decoded = decode_frame(&jpeg, PixelFormat::Mjpeg, 0, 0).unwrap();
        assert_eq!((decoded.width, decoded.height), (24, 16));
        assert_eq!(decoded.pixels.len(), 24 * 16 * 3);
        let mean = decoded.pixels.iter().map(|&p| p as u32).sum::<u32>() / decoded.pixels.len() as u32;
        assert!((115..=125).contains(&mean), "mean {mean}");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode_jpeg(b"not a jpeg"), Err(Error::Decode(_))));
    }

    #[test]
    fn yuyv_gray_maps_to_gray() {
        let decoded = decode_frame(&[126, 128, 126, 128], PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(decoded.pixels.len(), 6);
        assert!(decoded.pixels.iter().all(|&p| (125..=130).contains(&p)));
        assert!(decode_frame(&[0, 0], PixelFormat::Yuyv4, 2, 1).is_err());
    }
}
