use palette::{LinSrgb, Mix, Srgb};

/// Number of entries in a colormap lookup table.
pub(crate) const LUT_SIZE: usize = 256;

/**
 * A colormap described by evenly spaced sRGB stops. Values between stops are
 * mixed in linear RGB.
 */
#[derive(Debug)]
pub(crate) struct Colormap {
    pub(crate) name: &'static str,
    stops: &'static [(u8, u8, u8)],
}

pub(crate) const COLORMAPS: [Colormap; 8] = [
    Colormap {
        name: "jet",
        stops: &[
            (0, 0, 128),
            (0, 0, 255),
            (0, 128, 255),
            (0, 255, 255),
            (128, 255, 128),
            (255, 255, 0),
            (255, 128, 0),
            (255, 0, 0),
            (128, 0, 0),
        ],
    },
    Colormap {
        name: "bwr",
        stops: &[(0, 0, 255), (255, 255, 255), (255, 0, 0)],
    },
    Colormap {
        name: "seismic",
        stops: &[
            (0, 0, 77),
            (0, 0, 255),
            (255, 255, 255),
            (255, 0, 0),
            (128, 0, 0),
        ],
    },
    Colormap {
        name: "coolwarm",
        stops: &[
            (59, 76, 192),
            (141, 176, 254),
            (221, 221, 221),
            (244, 154, 123),
            (180, 4, 38),
        ],
    },
    Colormap {
        name: "PiYG_r",
        stops: &[
            (39, 100, 25),
            (127, 188, 65),
            (247, 247, 247),
            (222, 119, 174),
            (142, 1, 82),
        ],
    },
    Colormap {
        name: "gnuplot2",
        stops: &[
            (0, 0, 0),
            (0, 0, 255),
            (128, 0, 255),
            (255, 64, 192),
            (255, 255, 0),
            (255, 255, 255),
        ],
    },
    Colormap {
        name: "brg",
        stops: &[(0, 0, 255), (255, 0, 0), (0, 255, 0)],
    },
    Colormap {
        name: "inferno",
        stops: &[
            (0, 0, 4),
            (87, 16, 110),
            (188, 55, 84),
            (249, 142, 9),
            (252, 255, 164),
        ],
    },
];

impl Colormap {
    /// Colormap for a (possibly out of range) index, wrapping around.
    pub(crate) fn by_index(index: usize) -> &'static Colormap {
        &COLORMAPS[index % COLORMAPS.len()]
    }

    /// Maps `value` in `[0, 1]` to a color. Out of range values are clamped and
    /// NaN maps to the coldest color.
    pub(crate) fn color_at(&self, value: f32) -> [u8; 3] {
        let value = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        };

        let segments = self.stops.len() - 1;
        let position = value * segments as f32;
        let idx = (position.floor() as usize).min(segments - 1);
        let factor = position - idx as f32;

        let from = _to_linear(self.stops[idx]);
        let to = _to_linear(self.stops[idx + 1]);
        let mixed: Srgb<u8> = Srgb::<f32>::from_linear(from.mix(to, factor)).into_format();
        [mixed.red, mixed.green, mixed.blue]
    }

    /// Precomputed table so the per-pixel path is a single index.
    pub(crate) fn lookup_table(&self) -> Vec<[u8; 3]> {
        (0..LUT_SIZE)
            .map(|i| self.color_at(i as f32 / (LUT_SIZE - 1) as f32))
            .collect()
    }
}

fn _to_linear((r, g, b): (u8, u8, u8)) -> LinSrgb {
    Srgb::new(r, g, b).into_format::<f32>().into_linear()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_match_first_and_last_stops() {
        for colormap in &COLORMAPS {
            let (r, g, b) = colormap.stops[0];
            assert_eq!(colormap.color_at(0.0), [r, g, b], "{}", colormap.name);
            let (r, g, b) = colormap.stops[colormap.stops.len() - 1];
            assert_eq!(colormap.color_at(1.0), [r, g, b], "{}", colormap.name);
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let jet = Colormap::by_index(0);
        assert_eq!(jet.color_at(-3.0), jet.color_at(0.0));
        assert_eq!(jet.color_at(7.5), jet.color_at(1.0));
        assert_eq!(jet.color_at(f32::NAN), jet.color_at(0.0));
    }

    #[test]
    fn midpoint_of_bwr_is_white() {
        let bwr = Colormap::by_index(1);
        assert_eq!(bwr.name, "bwr");
        assert_eq!(bwr.color_at(0.5), [255, 255, 255]);
    }

    #[test]
    fn index_wraps() {
        assert_eq!(Colormap::by_index(COLORMAPS.len()).name, COLORMAPS[0].name);
    }

    #[test]
    fn lookup_table_spans_the_map() {
        let inferno = Colormap::by_index(7);
        let lut = inferno.lookup_table();
        assert_eq!(lut.len(), LUT_SIZE);
        assert_eq!(lut[0], inferno.color_at(0.0));
        assert_eq!(lut[LUT_SIZE - 1], inferno.color_at(1.0));
    }
}
