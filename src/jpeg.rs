use image::RgbImage;
use turbojpeg::{Image, PixelFormat, Subsamp};

#[derive(thiserror::Error, Debug)]
pub(crate) enum EncodeError {
    #[error("JPEG compression failed: {0}")]
    Jpeg(#[from] turbojpeg::Error),
    #[error("cannot encode an empty frame")]
    EmptyFrame,
}

/// Compresses an RGB frame with libjpeg-turbo. `quality` is 1..=100.
pub(crate) fn encode_jpeg(image: &RgbImage, quality: i32) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyFrame);
    }

    let jpeg = turbojpeg::compress(
        Image {
            pixels: image.as_raw().as_slice(),
            width: width as usize,
            pitch: width as usize * PixelFormat::RGB.size(),
            height: height as usize,
            format: PixelFormat::RGB,
        },
        quality,
        Subsamp::Sub2x2,
    )?;
    Ok(jpeg.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_jpeg_markers() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 40, 10]));
        let jpeg = encode_jpeg(&image, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn decodes_back_to_same_size() {
        let image = RgbImage::from_pixel(40, 30, image::Rgb([0, 128, 255]));
        let jpeg = encode_jpeg(&image, 90).unwrap();
        let header = turbojpeg::read_header(&jpeg).unwrap();
        assert_eq!((header.width, header.height), (40, 30));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(matches!(
            encode_jpeg(&RgbImage::new(0, 4), 85),
            Err(EncodeError::EmptyFrame)
        ));
    }
}
