use embedded_graphics::{
    pixelcolor::{Rgb888, RgbColor},
    prelude::Point,
};
use image::{
    imageops::{self, FilterType},
    Rgb, RgbImage,
};

use crate::{camera_controller::CameraConfig, canvas::draw_lines, colormap::LUT_SIZE};

const FILTER_SIGMA: f32 = 1.5;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Interpolation {
    pub(crate) name: &'static str,
    pub(crate) filter: FilterType,
}

pub(crate) const INTERPOLATIONS: [Interpolation; 5] = [
    Interpolation {
        name: "nearest",
        filter: FilterType::Nearest,
    },
    Interpolation {
        name: "linear",
        filter: FilterType::Triangle,
    },
    Interpolation {
        name: "cubic",
        filter: FilterType::CatmullRom,
    },
    Interpolation {
        name: "gaussian",
        filter: FilterType::Gaussian,
    },
    Interpolation {
        name: "lanczos",
        filter: FilterType::Lanczos3,
    },
];

#[derive(thiserror::Error, Debug)]
pub(crate) enum RenderError {
    #[error("temperature field has {actual} readings, expected {expected}")]
    FieldSize { expected: usize, actual: usize },
    #[error("temperature field holds no finite readings")]
    NoValidReadings,
    #[error("cannot scale a {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },
}

/// Raw sensor output in degrees Celsius, row major.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TemperatureField<'a> {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) celsius: &'a [f32],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FieldStats {
    pub(crate) min: f32,
    pub(crate) max: f32,
}

impl TemperatureField<'_> {
    fn validate(&self) -> Result<(), RenderError> {
        let expected = (self.width * self.height) as usize;
        if expected != self.celsius.len() {
            return Err(RenderError::FieldSize {
                expected,
                actual: self.celsius.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> Result<FieldStats, RenderError> {
        self.celsius
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .fold(None, |acc: Option<FieldStats>, t| {
                Some(match acc {
                    None => FieldStats { min: t, max: t },
                    Some(s) => FieldStats {
                        min: s.min.min(t),
                        max: s.max.max(t),
                    },
                })
            })
            .ok_or(RenderError::NoValidReadings)
    }
}

pub(crate) fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/**
 * Turns a temperature field into a displayable frame: colormap lookup against
 * the configured min/max, upscale with the selected interpolation, optional
 * blur, and a min/max readout in the selected unit.
 */
pub(crate) fn render_thermal_image(
    field: &TemperatureField,
    config: &CameraConfig,
    output_size: (u32, u32),
) -> Result<RgbImage, RenderError> {
    field.validate()?;
    let stats = field.stats()?;

    let lut = config.colormap().lookup_table();
    let span = (config.max_temp - config.min_temp).max(f32::EPSILON);
    let mut small = RgbImage::new(field.width, field.height);
    for (pixel, celsius) in small.pixels_mut().zip(field.celsius.iter()) {
        let normalized = (celsius - config.min_temp) / span;
        *pixel = Rgb(lut[_lut_index(normalized)]);
    }

    let mut image = scale_image(&small, output_size, config.interpolation().filter)?;
    if config.filter_image {
        image = imageops::blur(&image, FILTER_SIGMA);
    }

    _draw_readout(&mut image, &stats, config);
    Ok(image)
}

/// Resizes `image` to `size`, failing on empty source or target dimensions.
pub(crate) fn scale_image(
    image: &RgbImage,
    (width, height): (u32, u32),
    filter: FilterType,
) -> Result<RgbImage, RenderError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(RenderError::EmptyImage {
            width: image.width(),
            height: image.height(),
        });
    }
    if width == 0 || height == 0 {
        return Err(RenderError::EmptyImage { width, height });
    }
    if image.dimensions() == (width, height) {
        return Ok(image.clone());
    }
    Ok(imageops::resize(image, width, height, filter))
}

fn _lut_index(normalized: f32) -> usize {
    if normalized.is_nan() {
        return 0;
    }
    (normalized.clamp(0.0, 1.0) * (LUT_SIZE - 1) as f32).round() as usize
}

fn _draw_readout(image: &mut RgbImage, stats: &FieldStats, config: &CameraConfig) {
    let (min, max) = if config.use_fahrenheit {
        (
            celsius_to_fahrenheit(stats.min),
            celsius_to_fahrenheit(stats.max),
        )
    } else {
        (stats.min, stats.max)
    };
    let readout = format!(
        "Tmin={:.1}{unit} Tmax={:.1}{unit}",
        min,
        max,
        unit = config.unit_suffix()
    );
    draw_lines(
        image,
        &[&readout],
        Point::new(4, 4),
        Rgb888::WHITE,
        Some(Rgb888::BLACK),
    );
}
