use std::convert::Infallible;

use embedded_graphics::{
    mono_font::{ascii::FONT_10X20, MonoTextStyleBuilder},
    pixelcolor::{Rgb888, RgbColor},
    prelude::*,
    text::{Baseline, Text},
};
use image::{Rgb, RgbImage};

/// Height of one line of `FONT_10X20` text, including spacing.
pub(crate) const LINE_HEIGHT: i32 = 22;

/// embedded-graphics draw target backed by an `RgbImage`.
pub(crate) struct Canvas<'a> {
    image: &'a mut RgbImage,
}

impl<'a> Canvas<'a> {
    pub(crate) fn new(image: &'a mut RgbImage) -> Self {
        Self { image }
    }
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.image.dimensions();
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            let (x, y) = (point.x as u32, point.y as u32);
            if x < width && y < height {
                self.image
                    .put_pixel(x, y, Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

/**
 * Builds a black image of `size` with `lines` of white text from the top
 * left. Used for status and error screens.
 */
pub(crate) fn text_screen(size: (u32, u32), lines: &[&str]) -> RgbImage {
    let mut image = RgbImage::new(size.0, size.1);
    draw_lines(&mut image, lines, Point::zero(), Rgb888::WHITE, None);
    image
}

pub(crate) fn draw_lines(
    image: &mut RgbImage,
    lines: &[&str],
    origin: Point,
    color: Rgb888,
    background: Option<Rgb888>,
) {
    let mut style = MonoTextStyleBuilder::new()
        .font(&FONT_10X20)
        .text_color(color);
    if let Some(background) = background {
        style = style.background_color(background);
    }
    let style = style.build();

    let mut canvas = Canvas::new(image);
    for (row, line) in lines.iter().enumerate() {
        let position = origin + Point::new(0, row as i32 * LINE_HEIGHT);
        let _ = Text::with_baseline(line, position, style, Baseline::Top).draw(&mut canvas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_screen_draws_white_pixels() {
        let image = text_screen((100, 30), &["Hi"]);
        assert!(image.pixels().any(|p| p.0 == [255, 255, 255]));
        assert!(image.pixels().any(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn drawing_off_canvas_is_ignored() {
        let mut image = RgbImage::new(10, 10);
        draw_lines(
            &mut image,
            &["far away"],
            Point::new(-200, 500),
            Rgb888::WHITE,
            None,
        );
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}
