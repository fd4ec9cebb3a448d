use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use tch::{Device, Tensor};

use super::model::InferenceError;
use crate::config::PreprocessingConfig;

/// Resize, scale to `[0, 1]`, normalise per channel, CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    pub fn new(config: &PreprocessingConfig) -> Self {
        Self {
            image_size: config.image_size,
            mean: config.mean,
            std: config.std,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Decodes any supported format and forces three colour channels.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, InferenceError> {
        let image = image::load_from_memory(bytes)?;
        Ok(image.to_rgb8())
    }

    pub fn to_array(&self, image: &RgbImage) -> Array3<f32> {
        let size = self.image_size;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        Array3::from_shape_fn(
            (3, size as usize, size as usize),
            |(channel, y, x)| {
                let value = resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0;
                (value - self.mean[channel]) / self.std[channel]
            },
        )
    }

    /// Full pipeline from raw upload bytes to a `[1, 3, H, W]` tensor on `device`.
    pub fn to_tensor(&self, bytes: &[u8], device: Device) -> Result<Tensor, InferenceError> {
        let image = self.decode(bytes)?;
        let array = self.to_array(&image);
        let (data, offset) = array.into_raw_vec_and_offset();
        if offset != Some(0) {
            return Err(InferenceError::Preprocess(format!(
                "unexpected buffer offset {:?}",
                offset
            )));
        }

        let size = self.image_size as i64;
        let tensor = Tensor::f_from_slice(&data)?
            .f_view([1, 3, size, size])?
            .to_device(device);
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(&PreprocessingConfig::default())
    }

    fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), format).unwrap();
        buffer
    }

    #[test]
    fn output_is_channel_first_at_configured_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([10, 20, 30]));
        let array = preprocessor().to_array(&image);
        assert_eq!(array.shape(), &[3, 224, 224]);
    }

    #[test]
    fn white_image_normalises_to_constants() {
        let config = PreprocessingConfig::default();
        let image = RgbImage::from_pixel(50, 50, Rgb([255, 255, 255]));
        let array = preprocessor().to_array(&image);

        for channel in 0..3 {
            let expected = (1.0 - config.mean[channel]) / config.std[channel];
            let actual = array[[channel, 100, 100]];
            assert!(
                (actual - expected).abs() < 1e-5,
                "channel {}: {} != {}",
                channel,
                actual,
                expected
            );
        }
    }

    #[test]
    fn channels_stay_separate() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        let array = preprocessor().to_array(&image);
        assert!(array[[0, 0, 0]] > 0.0);
        assert!(array[[1, 0, 0]] < 0.0);
        assert!(array[[2, 0, 0]] < 0.0);
    }

    #[test]
    fn grayscale_input_is_expanded_to_rgb() {
        let gray = image::GrayImage::from_pixel(16, 16, image::Luma([128]));
        let mut buffer = Vec::new();
        gray.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();

        let rgb = preprocessor().decode(&buffer).unwrap();
        assert_eq!(rgb.get_pixel(3, 3), &Rgb([128, 128, 128]));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = preprocessor().decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, InferenceError::Decode(_)));
    }

    #[test]
    fn tensor_has_batch_dimension() {
        let image = RgbImage::from_pixel(32, 32, Rgb([90, 90, 90]));
        let bytes = encode(&image, ImageFormat::Jpeg);
        let tensor = preprocessor().to_tensor(&bytes, Device::Cpu).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 224, 224]);
        assert_eq!(tensor.kind(), tch::Kind::Float);
    }
}
