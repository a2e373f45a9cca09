use std::{
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use json::JsonValue;

use crate::sensor::MLX90640_RESOLUTION;

pub(crate) const DEFAULT_CONFIG_DIR: &str = "./config";
const CONFIG_FILE: &str = "thermalcam.json";

#[derive(thiserror::Error, Debug)]
pub(crate) enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse config as JSON: {0}")]
    Parse(#[from] json::Error),
    #[error("`{key}` must be {expected}")]
    InvalidField { key: String, expected: &'static str },
    #[error("`{key}` is invalid: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum SensorSource {
    /// Synthetic scene, no hardware needed.
    Simulated,
    /// Little-endian f32 frames read from `sensor.path`.
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerSettings {
    pub(crate) port: u16,
    pub(crate) output_folder: PathBuf,
    pub(crate) jpeg_quality: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImageSettings {
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// Initial colormap range in degrees Celsius and the step used by the controls.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TemperatureSettings {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) step: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SensorSettings {
    pub(crate) source: SensorSource,
    pub(crate) path: Option<PathBuf>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) frame_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DisplaySettings {
    pub(crate) enabled: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) spi_bus: u8,
    pub(crate) chip_select: u8,
    pub(crate) dc_pin: u8,
    /// `false` in the config file means no backlight pin.
    pub(crate) backlight_pin: Option<u8>,
    pub(crate) speed_hz: u32,
    pub(crate) rotation: u16,
    pub(crate) offset_left: u16,
    pub(crate) offset_top: u16,
    pub(crate) refresh_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EncoderSettings {
    pub(crate) enabled: bool,
    pub(crate) pin_a: u8,
    pub(crate) pin_b: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LedSettings {
    pub(crate) enabled: bool,
    pub(crate) red_pin: u8,
    pub(crate) green_pin: u8,
    pub(crate) blue_pin: u8,
    pub(crate) brightness: f32,
    pub(crate) common_anode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrackballSettings {
    pub(crate) enabled: bool,
    pub(crate) bus: u8,
    pub(crate) address: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InputSettings {
    pub(crate) poll_interval_ms: u64,
    pub(crate) message_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct UserConfig {
    pub(crate) server: ServerSettings,
    pub(crate) image: ImageSettings,
    pub(crate) temperature: TemperatureSettings,
    pub(crate) sensor: SensorSettings,
    pub(crate) display: DisplaySettings,
    pub(crate) encoder: EncoderSettings,
    pub(crate) led: LedSettings,
    pub(crate) trackball: TrackballSettings,
    pub(crate) input: InputSettings,
}

///////////////////
// Defaults
///////////////////
impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8000,
            output_folder: PathBuf::from("/home/pi/pithermalcam/saved_snapshots"),
            jpeg_quality: 85,
        }
    }
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            min: 20.0,
            max: 35.0,
            step: 1.0,
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            source: SensorSource::Simulated,
            path: None,
            width: MLX90640_RESOLUTION.0,
            height: MLX90640_RESOLUTION.1,
            frame_interval_ms: 125,
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        // Pimoroni 1.3" square LCD in the front breakout garden slot.
        Self {
            enabled: true,
            width: 240,
            height: 240,
            spi_bus: 0,
            chip_select: 1,
            dc_pin: 9,
            backlight_pin: Some(19),
            speed_hz: 80_000_000,
            rotation: 90,
            offset_left: 0,
            offset_top: 0,
            refresh_ms: 250,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pin_a: 17,
            pin_b: 27,
        }
    }
}

impl Default for LedSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            red_pin: 22,
            green_pin: 23,
            blue_pin: 24,
            brightness: 0.5,
            common_anode: false,
        }
    }
}

impl Default for TrackballSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bus: 1,
            address: 0x0A,
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            message_secs: 3,
        }
    }
}

///////////////////
// Parsing
///////////////////

/// One JSON object of the config file. Missing keys fall back to defaults,
/// keys of the wrong type are errors.
struct Section<'a> {
    name: &'static str,
    json: &'a JsonValue,
}

impl<'a> Section<'a> {
    fn root(json: &'a JsonValue) -> Result<Self, ConfigError> {
        if !json.is_object() {
            return Err(ConfigError::InvalidField {
                key: "<root>".to_string(),
                expected: "an object",
            });
        }
        Ok(Self { name: "", json })
    }

    fn child(&self, name: &'static str) -> Result<Section<'a>, ConfigError> {
        let json = &self.json[name];
        if !json.is_null() && !json.is_object() {
            return Err(self._invalid(name, "an object"));
        }
        Ok(Section { name, json })
    }

    fn _invalid(&self, key: &str, expected: &'static str) -> ConfigError {
        let key = if self.name.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.name, key)
        };
        ConfigError::InvalidField { key, expected }
    }

    fn _get<T>(
        &self,
        key: &str,
        default: T,
        expected: &'static str,
        convert: impl FnOnce(&JsonValue) -> Option<T>,
    ) -> Result<T, ConfigError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        convert(value).ok_or_else(|| self._invalid(key, expected))
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        self._get(key, default, "a boolean", JsonValue::as_bool)
    }

    fn u8(&self, key: &str, default: u8) -> Result<u8, ConfigError> {
        self._get(key, default, "an integer in 0..=255", JsonValue::as_u8)
    }

    fn u16(&self, key: &str, default: u16) -> Result<u16, ConfigError> {
        self._get(key, default, "an integer in 0..=65535", JsonValue::as_u16)
    }

    fn u32(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        self._get(key, default, "a non-negative integer", JsonValue::as_u32)
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        self._get(key, default, "a non-negative integer", JsonValue::as_u64)
    }

    fn i32(&self, key: &str, default: i32) -> Result<i32, ConfigError> {
        self._get(key, default, "an integer", JsonValue::as_i32)
    }

    fn f32(&self, key: &str, default: f32) -> Result<f32, ConfigError> {
        self._get(key, default, "a number", JsonValue::as_f32)
    }

    fn path(&self, key: &str, default: PathBuf) -> Result<PathBuf, ConfigError> {
        self._get(key, default, "a string", |v| v.as_str().map(PathBuf::from))
    }

    fn optional_path(&self, key: &str) -> Result<Option<PathBuf>, ConfigError> {
        self._get(key, None, "a string", |v| v.as_str().map(|s| Some(PathBuf::from(s))))
    }

    /// A pin number, or `false` for "not connected".
    fn optional_pin(&self, key: &str, default: Option<u8>) -> Result<Option<u8>, ConfigError> {
        self._get(key, default, "a pin number or false", |v| match v.as_bool() {
            Some(false) => Some(None),
            Some(true) => None,
            None => v.as_u8().map(Some),
        })
    }

    fn sensor_source(&self, key: &str, default: SensorSource) -> Result<SensorSource, ConfigError> {
        self._get(key, default, "\"simulated\" or \"stream\"", |v| {
            v.as_str()
                .and_then(|s| SensorSource::from_str(s, true).ok())
        })
    }
}

impl UserConfig {
    /**
     * Reads `<config_dir>/thermalcam.json`. A missing file yields the
     * defaults; an unreadable or malformed one is an error.
     */
    pub(crate) fn read(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        match read_to_string(&path) {
            Ok(raw) => Self::from_json(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let json = json::parse(raw)?;
        let root = Section::root(&json)?;

        let server = {
            let d = ServerSettings::default();
            ServerSettings {
                port: root.u16("port", d.port)?,
                output_folder: root.path("output_folder", d.output_folder)?,
                jpeg_quality: root.i32("jpeg_quality", d.jpeg_quality)?,
            }
        };

        let image = {
            let s = root.child("image")?;
            let d = ImageSettings::default();
            ImageSettings {
                width: s.u32("width", d.width)?,
                height: s.u32("height", d.height)?,
            }
        };

        let temperature = {
            let s = root.child("temperature")?;
            let d = TemperatureSettings::default();
            TemperatureSettings {
                min: s.f32("min", d.min)?,
                max: s.f32("max", d.max)?,
                step: s.f32("step", d.step)?,
            }
        };

        let sensor = {
            let s = root.child("sensor")?;
            let d = SensorSettings::default();
            SensorSettings {
                source: s.sensor_source("source", d.source)?,
                path: s.optional_path("path")?,
                width: s.u32("width", d.width)?,
                height: s.u32("height", d.height)?,
                frame_interval_ms: s.u64("frame_interval_ms", d.frame_interval_ms)?,
            }
        };

        let display = {
            let s = root.child("display")?;
            let d = DisplaySettings::default();
            DisplaySettings {
                enabled: s.bool("enabled", d.enabled)?,
                width: s.u32("width", d.width)?,
                height: s.u32("height", d.height)?,
                spi_bus: s.u8("spi_bus", d.spi_bus)?,
                chip_select: s.u8("chip_select", d.chip_select)?,
                dc_pin: s.u8("dc_pin", d.dc_pin)?,
                backlight_pin: s.optional_pin("backlight_pin", d.backlight_pin)?,
                speed_hz: s.u32("speed_hz", d.speed_hz)?,
                rotation: s.u16("rotation", d.rotation)?,
                offset_left: s.u16("offset_left", d.offset_left)?,
                offset_top: s.u16("offset_top", d.offset_top)?,
                refresh_ms: s.u64("refresh_ms", d.refresh_ms)?,
            }
        };

        let encoder = {
            let s = root.child("encoder")?;
            let d = EncoderSettings::default();
            EncoderSettings {
                enabled: s.bool("enabled", d.enabled)?,
                pin_a: s.u8("pin_a", d.pin_a)?,
                pin_b: s.u8("pin_b", d.pin_b)?,
            }
        };

        let led = {
            let s = root.child("led")?;
            let d = LedSettings::default();
            LedSettings {
                enabled: s.bool("enabled", d.enabled)?,
                red_pin: s.u8("red_pin", d.red_pin)?,
                green_pin: s.u8("green_pin", d.green_pin)?,
                blue_pin: s.u8("blue_pin", d.blue_pin)?,
                brightness: s.f32("brightness", d.brightness)?,
                common_anode: s.bool("common_anode", d.common_anode)?,
            }
        };

        let trackball = {
            let s = root.child("trackball")?;
            let d = TrackballSettings::default();
            TrackballSettings {
                enabled: s.bool("enabled", d.enabled)?,
                bus: s.u8("bus", d.bus)?,
                address: s.u16("address", d.address)?,
            }
        };

        let input = {
            let s = root.child("input")?;
            let d = InputSettings::default();
            InputSettings {
                poll_interval_ms: s.u64("poll_interval_ms", d.poll_interval_ms)?,
                message_secs: s.u64("message_secs", d.message_secs)?,
            }
        };

        Ok(Self {
            server,
            image,
            temperature,
            sensor,
            display,
            encoder,
            led,
            trackball,
            input,
        })
    }

    /// Cross-field checks. Run after command line overrides are applied.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidValue {
                key,
                reason: reason.into(),
            })
        }

        if !(1..=100).contains(&self.server.jpeg_quality) {
            return invalid("jpeg_quality", "must be within 1..=100");
        }
        if self.image.width == 0 || self.image.height == 0 {
            return invalid("image", "width and height must be non-zero");
        }
        let t = &self.temperature;
        if !(t.min < t.max) {
            return invalid(
                "temperature",
                format!("min ({}) must be below max ({})", t.min, t.max),
            );
        }
        if !(t.step > 0.0) {
            return invalid("temperature.step", "must be positive");
        }
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return invalid("sensor", "width and height must be non-zero");
        }
        if self.sensor.source == SensorSource::Stream && self.sensor.path.is_none() {
            return invalid("sensor.path", "required for the stream sensor");
        }
        if !matches!(self.display.rotation, 0 | 90 | 180 | 270) {
            return invalid("display.rotation", "must be 0, 90, 180 or 270");
        }
        let d = &self.display;
        for (key, size, offset) in [
            ("display.width", d.width, d.offset_left),
            ("display.height", d.height, d.offset_top),
        ] {
            if size == 0 || u64::from(offset) + u64::from(size) - 1 > u64::from(u16::MAX) {
                return invalid(
                    key,
                    format!("{} at offset {} leaves the 16-bit panel window", size, offset),
                );
            }
        }
        if self.display.refresh_ms == 0 {
            return invalid("display.refresh_ms", "must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.led.brightness) {
            return invalid("led.brightness", "must be within 0.0..=1.0");
        }
        if self.input.poll_interval_ms == 0 {
            return invalid("input.poll_interval_ms", "must be non-zero");
        }
        Ok(())
    }
}
