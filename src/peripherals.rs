use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use embedded_graphics::pixelcolor::{IntoStorage, Rgb565, Rgb888};
use image::{imageops, RgbImage};
use rppal::{
    gpio::{Gpio, InputPin, Level, OutputPin, Trigger},
    i2c::I2c,
    spi::{Bus, Mode, SlaveSelect, Spi},
};

use crate::user_config::{DisplaySettings, EncoderSettings, LedSettings, TrackballSettings};

#[derive(thiserror::Error, Debug)]
pub(crate) enum PeripheralError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),
    #[error("SPI error: {0}")]
    Spi(#[from] rppal::spi::Error),
    #[error("unexpected chip id {found:#06x}, expected {expected:#06x}")]
    UnexpectedChip { expected: u16, found: u16 },
    #[error("image is {actual:?}, screen expects {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("invalid peripheral setting: {0}")]
    Setting(String),
}

/// A rotary encoder with an interrupt line and an absolute step count.
pub(crate) trait RotaryEncoder: Send {
    /// Returns whether the encoder moved since the last call, clearing the flag.
    fn take_interrupt(&mut self) -> Result<bool, PeripheralError>;
    fn read_count(&mut self) -> Result<i64, PeripheralError>;
}

pub(crate) trait RgbLed: Send {
    fn set_rgb(&mut self, rgb: [u8; 3]) -> Result<(), PeripheralError>;
}

/// Movement since the previous read, plus whether the ball was pressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TrackballReading {
    pub(crate) left: u8,
    pub(crate) right: u8,
    pub(crate) up: u8,
    pub(crate) down: u8,
    pub(crate) clicked: bool,
}

pub(crate) trait Trackball: Send {
    fn read(&mut self) -> Result<TrackballReading, PeripheralError>;
}

/// A frame-buffer display. `display` takes an image of exactly `size()`.
pub(crate) trait Screen: Send {
    fn size(&self) -> (u32, u32);
    fn display(&mut self, image: &RgbImage) -> Result<(), PeripheralError>;
}

//////////////////////////// Rotary Encoder Start ////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Idle,
    CwStep1,
    CwStep2,
    CcwStep1,
    CcwStep2,
}

/**
 * Quadrature state machine for a pulled-up encoder (both lines idle high).
 *
 * CW:  (1,1) -> (0,1) -> (0,0) -> A or B high => +1
 * CCW: (1,1) -> (1,0) -> (0,0) -> A or B high => -1
 *
 * Bounces back to (1,1) before the middle step reset to idle without counting.
 */
#[derive(Debug)]
pub(crate) struct QuadratureDecoder {
    a: bool,
    b: bool,
    state: DecoderState,
    count: i64,
    signalled: bool,
}

impl QuadratureDecoder {
    pub(crate) fn new(a: bool, b: bool) -> Self {
        Self {
            a,
            b,
            state: DecoderState::Idle,
            count: 0,
            signalled: false,
        }
    }

    pub(crate) fn update_a(&mut self, a: bool) {
        self.update(a, self.b);
    }

    pub(crate) fn update_b(&mut self, b: bool) {
        self.update(self.a, b);
    }

    pub(crate) fn update(&mut self, a: bool, b: bool) {
        if a == self.a && b == self.b {
            return;
        }
        if let Some(step) = self.decode(a, b) {
            self.count += step;
            self.signalled = true;
        }
        self.a = a;
        self.b = b;
    }

    fn decode(&mut self, a: bool, b: bool) -> Option<i64> {
        match self.state {
            DecoderState::Idle => {
                if !a && b {
                    self.state = DecoderState::CwStep1;
                } else if a && !b {
                    self.state = DecoderState::CcwStep1;
                }
                None
            }
            DecoderState::CwStep1 => {
                if !a && !b {
                    self.state = DecoderState::CwStep2;
                } else if a && b {
                    self.state = DecoderState::Idle;
                }
                None
            }
            DecoderState::CwStep2 => {
                if a || b {
                    self.state = DecoderState::Idle;
                    return Some(1);
                }
                None
            }
            DecoderState::CcwStep1 => {
                if !a && !b {
                    self.state = DecoderState::CcwStep2;
                } else if a && b {
                    self.state = DecoderState::Idle;
                }
                None
            }
            DecoderState::CcwStep2 => {
                if a || b {
                    self.state = DecoderState::Idle;
                    return Some(-1);
                }
                None
            }
        }
    }

    pub(crate) fn take_signal(&mut self) -> bool {
        std::mem::replace(&mut self.signalled, false)
    }

    pub(crate) fn count(&self) -> i64 {
        self.count
    }
}

fn _lock_decoder(decoder: &Mutex<QuadratureDecoder>) -> MutexGuard<'_, QuadratureDecoder> {
    decoder.lock().unwrap_or_else(PoisonError::into_inner)
}

/**
 * Encoder wired straight to two GPIO lines. Edges on either line are fed to
 * the decoder from rppal's interrupt threads.
 */
pub(crate) struct GpioEncoder {
    // Dropping a pin cancels its interrupt callback.
    _pin_a: InputPin,
    _pin_b: InputPin,
    decoder: Arc<Mutex<QuadratureDecoder>>,
}

impl GpioEncoder {
    pub(crate) fn new(settings: &EncoderSettings) -> Result<Self, PeripheralError> {
        let gpio = Gpio::new()?;
        let mut pin_a = gpio.get(settings.pin_a)?.into_input_pullup();
        let mut pin_b = gpio.get(settings.pin_b)?.into_input_pullup();

        let decoder = Arc::new(Mutex::new(QuadratureDecoder::new(
            pin_a.is_high(),
            pin_b.is_high(),
        )));

        let on_a = decoder.clone();
        pin_a.set_async_interrupt(Trigger::Both, move |level| {
            _lock_decoder(&on_a).update_a(level == Level::High);
        })?;
        let on_b = decoder.clone();
        pin_b.set_async_interrupt(Trigger::Both, move |level| {
            _lock_decoder(&on_b).update_b(level == Level::High);
        })?;

        Ok(Self {
            _pin_a: pin_a,
            _pin_b: pin_b,
            decoder,
        })
    }
}

impl RotaryEncoder for GpioEncoder {
    fn take_interrupt(&mut self) -> Result<bool, PeripheralError> {
        Ok(_lock_decoder(&self.decoder).take_signal())
    }

    fn read_count(&mut self) -> Result<i64, PeripheralError> {
        Ok(_lock_decoder(&self.decoder).count())
    }
}
//////////////////////////// Rotary Encoder End ////////////////////////////

//////////////////////////// RGB LED Start ////////////////////////////
const LED_PWM_FREQUENCY_HZ: f64 = 1000.0;

/// Three-pin RGB LED driven with rppal's software PWM.
pub(crate) struct PwmLed {
    pins: [OutputPin; 3],
    common_anode: bool,
}

impl PwmLed {
    pub(crate) fn new(settings: &LedSettings) -> Result<Self, PeripheralError> {
        let gpio = Gpio::new()?;
        Ok(Self {
            pins: [
                gpio.get(settings.red_pin)?.into_output(),
                gpio.get(settings.green_pin)?.into_output(),
                gpio.get(settings.blue_pin)?.into_output(),
            ],
            common_anode: settings.common_anode,
        })
    }
}

pub(crate) fn duty_cycle(level: u8, common_anode: bool) -> f64 {
    let duty = level as f64 / 255.0;
    if common_anode {
        1.0 - duty
    } else {
        duty
    }
}

impl RgbLed for PwmLed {
    fn set_rgb(&mut self, rgb: [u8; 3]) -> Result<(), PeripheralError> {
        for (pin, level) in self.pins.iter_mut().zip(rgb) {
            pin.set_pwm_frequency(LED_PWM_FREQUENCY_HZ, duty_cycle(level, self.common_anode))?;
        }
        Ok(())
    }
}
//////////////////////////// RGB LED End ////////////////////////////

//////////////////////////// Trackball Start ////////////////////////////
const TRACKBALL_REG_LEFT: u8 = 0x04;
const TRACKBALL_REG_CHIP_ID_L: u8 = 0xFA;
const TRACKBALL_CHIP_ID: u16 = 0xBA11;
const TRACKBALL_SWITCH_PRESSED: u8 = 0b1000_0000;

/// Pimoroni I2C trackball breakout.
pub(crate) struct I2cTrackball {
    i2c: I2c,
    was_pressed: bool,
}

impl I2cTrackball {
    pub(crate) fn new(settings: &TrackballSettings) -> Result<Self, PeripheralError> {
        let mut i2c = I2c::with_bus(settings.bus)?;
        i2c.set_slave_address(settings.address)?;

        let mut chip_id = [0u8; 2];
        i2c.write_read(&[TRACKBALL_REG_CHIP_ID_L], &mut chip_id)?;
        let found = u16::from_le_bytes(chip_id);
        if found != TRACKBALL_CHIP_ID {
            return Err(PeripheralError::UnexpectedChip {
                expected: TRACKBALL_CHIP_ID,
                found,
            });
        }

        Ok(Self {
            i2c,
            was_pressed: false,
        })
    }
}

/// Decodes the left/right/up/down/switch register block. A click is reported
/// once, on the press edge.
pub(crate) fn decode_trackball_registers(registers: [u8; 5], was_pressed: &mut bool) -> TrackballReading {
    let pressed = registers[4] & TRACKBALL_SWITCH_PRESSED != 0;
    let clicked = pressed && !*was_pressed;
    *was_pressed = pressed;
    TrackballReading {
        left: registers[0],
        right: registers[1],
        up: registers[2],
        down: registers[3],
        clicked,
    }
}

impl Trackball for I2cTrackball {
    fn read(&mut self) -> Result<TrackballReading, PeripheralError> {
        let mut registers = [0u8; 5];
        self.i2c.write_read(&[TRACKBALL_REG_LEFT], &mut registers)?;
        Ok(decode_trackball_registers(registers, &mut self.was_pressed))
    }
}
//////////////////////////// Trackball End ////////////////////////////

//////////////////////////// ST7789 Start ////////////////////////////
const ST7789_SWRESET: u8 = 0x01;
const ST7789_SLPOUT: u8 = 0x11;
const ST7789_INVON: u8 = 0x21;
const ST7789_DISPON: u8 = 0x29;
const ST7789_CASET: u8 = 0x2A;
const ST7789_RASET: u8 = 0x2B;
const ST7789_RAMWR: u8 = 0x2C;
const ST7789_MADCTL: u8 = 0x36;
const ST7789_COLMOD: u8 = 0x3A;

/// spidev rejects transfers larger than its default buffer.
const SPI_CHUNK_BYTES: usize = 4096;

/// Register writes after reset, as (command, data).
const ST7789_INIT_SEQUENCE: [(u8, &[u8]); 13] = [
    (ST7789_MADCTL, &[0x70]),
    (0xB2, &[0x0C, 0x0C, 0x00, 0x33, 0x33]),
    (ST7789_COLMOD, &[0x05]),
    (0xB7, &[0x14]),
    (0xBB, &[0x37]),
    (0xC0, &[0x2C]),
    (0xC2, &[0x01]),
    (0xC3, &[0x12]),
    (0xC4, &[0x20]),
    (0xD0, &[0xA4, 0xA1]),
    (0xC6, &[0x0F]),
    (
        0xE0,
        &[0xD0, 0x04, 0x0D, 0x11, 0x13, 0x2B, 0x3F, 0x54, 0x4C, 0x18, 0x0D, 0x0B, 0x1F, 0x23],
    ),
    (
        0xE1,
        &[0xD0, 0x04, 0x0C, 0x11, 0x13, 0x2C, 0x3F, 0x44, 0x51, 0x2F, 0x1F, 0x1F, 0x20, 0x23],
    ),
];

/// ST7789 LCD on SPI with a data/command GPIO line, fed RGB565 frames.
pub(crate) struct St7789 {
    spi: Spi,
    dc: OutputPin,
    _backlight: Option<OutputPin>,
    width: u32,
    height: u32,
    rotation: u16,
    /// Panel RAM window as `[x0, x1, y0, y1]`, inclusive.
    window: [u16; 4],
    buffer: Vec<u8>,
}

/// Panel RAM window covered by the configured size and offsets. Fails when the
/// size is zero or the window runs past the 16-bit address range.
pub(crate) fn display_window(settings: &DisplaySettings) -> Result<[u16; 4], PeripheralError> {
    fn span(offset: u16, size: u32, axis: &str) -> Result<(u16, u16), PeripheralError> {
        u16::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(1))
            .and_then(|last| offset.checked_add(last))
            .map(|end| (offset, end))
            .ok_or_else(|| {
                PeripheralError::Setting(format!("{} {} at offset {}", axis, size, offset))
            })
    }

    let (x0, x1) = span(settings.offset_left, settings.width, "width")?;
    let (y0, y1) = span(settings.offset_top, settings.height, "height")?;
    Ok([x0, x1, y0, y1])
}

impl St7789 {
    pub(crate) fn new(settings: &DisplaySettings) -> Result<Self, PeripheralError> {
        let bus = match settings.spi_bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            other => return Err(PeripheralError::Setting(format!("SPI bus {}", other))),
        };
        let slave_select = match settings.chip_select {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            other => return Err(PeripheralError::Setting(format!("chip select {}", other))),
        };
        if !matches!(settings.rotation, 0 | 90 | 180 | 270) {
            return Err(PeripheralError::Setting(format!(
                "rotation {}",
                settings.rotation
            )));
        }
        let window = display_window(settings)?;

        let spi = Spi::new(bus, slave_select, settings.speed_hz, Mode::Mode0)?;
        let gpio = Gpio::new()?;
        let dc = gpio.get(settings.dc_pin)?.into_output();
        let backlight = match settings.backlight_pin {
            Some(pin) => {
                let mut backlight = gpio.get(pin)?.into_output();
                backlight.set_high();
                Some(backlight)
            }
            None => None,
        };

        let mut display = Self {
            spi,
            dc,
            _backlight: backlight,
            width: settings.width,
            height: settings.height,
            rotation: settings.rotation,
            window,
            buffer: Vec::with_capacity(settings.width as usize * settings.height as usize * 2),
        };
        display.init()?;
        Ok(display)
    }

    fn init(&mut self) -> Result<(), PeripheralError> {
        self.command(ST7789_SWRESET, &[])?;
        thread::sleep(Duration::from_millis(150));
        for (command, data) in ST7789_INIT_SEQUENCE {
            self.command(command, data)?;
        }
        self.command(ST7789_INVON, &[])?;
        self.command(ST7789_SLPOUT, &[])?;
        self.command(ST7789_DISPON, &[])?;
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    fn command(&mut self, command: u8, data: &[u8]) -> Result<(), PeripheralError> {
        self.dc.set_low();
        self.spi.write(&[command])?;
        if !data.is_empty() {
            self.dc.set_high();
            for chunk in data.chunks(SPI_CHUNK_BYTES) {
                self.spi.write(chunk)?;
            }
        }
        Ok(())
    }

    fn set_window(&mut self) -> Result<(), PeripheralError> {
        let [x0, x1, y0, y1] = self.window;
        let [x0_hi, x0_lo] = x0.to_be_bytes();
        let [x1_hi, x1_lo] = x1.to_be_bytes();
        let [y0_hi, y0_lo] = y0.to_be_bytes();
        let [y1_hi, y1_lo] = y1.to_be_bytes();
        self.command(ST7789_CASET, &[x0_hi, x0_lo, x1_hi, x1_lo])?;
        self.command(ST7789_RASET, &[y0_hi, y0_lo, y1_hi, y1_lo])
    }
}

pub(crate) fn rgb565_bytes([r, g, b]: [u8; 3]) -> [u8; 2] {
    Rgb565::from(Rgb888::new(r, g, b)).into_storage().to_be_bytes()
}

/// Rotates a logical image into the panel's native orientation.
fn _to_native(image: &RgbImage, rotation: u16) -> RgbImage {
    match rotation {
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        _ => image.clone(),
    }
}

impl Screen for St7789 {
    fn size(&self) -> (u32, u32) {
        if matches!(self.rotation, 90 | 270) {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    fn display(&mut self, image: &RgbImage) -> Result<(), PeripheralError> {
        if image.dimensions() != self.size() {
            return Err(PeripheralError::FrameSize {
                expected: self.size(),
                actual: image.dimensions(),
            });
        }

        let native = _to_native(image, self.rotation);
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        buffer.extend(native.pixels().flat_map(|pixel| rgb565_bytes(pixel.0)));

        self.set_window()?;
        let written = self.command(ST7789_RAMWR, &buffer);
        self.buffer = buffer;
        written
    }
}
//////////////////////////// ST7789 End ////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut QuadratureDecoder, levels: &[(bool, bool)]) {
        for &(a, b) in levels {
            decoder.update(a, b);
        }
    }

    #[test]
    fn clockwise_detent_counts_up() {
        let mut decoder = QuadratureDecoder::new(true, true);
        feed(&mut decoder, &[(false, true), (false, false), (true, false), (true, true)]);
        assert_eq!(decoder.count(), 1);
        assert!(decoder.take_signal());
        assert!(!decoder.take_signal());
    }

    #[test]
    fn counter_clockwise_detent_counts_down() {
        let mut decoder = QuadratureDecoder::new(true, true);
        for _ in 0..3 {
            feed(&mut decoder, &[(true, false), (false, false), (false, true), (true, true)]);
        }
        assert_eq!(decoder.count(), -3);
    }

    #[test]
    fn bounce_does_not_count() {
        let mut decoder = QuadratureDecoder::new(true, true);
        feed(&mut decoder, &[(false, true), (true, true), (false, true), (true, true)]);
        assert_eq!(decoder.count(), 0);
        assert!(!decoder.take_signal());
    }

    #[test]
    fn single_line_updates_use_last_level_of_the_other() {
        let mut decoder = QuadratureDecoder::new(true, true);
        decoder.update_a(false);
        decoder.update_b(false);
        decoder.update_a(true);
        assert_eq!(decoder.count(), 1);
    }

    #[test]
    fn trackball_click_reported_on_press_edge_only() {
        let mut was_pressed = false;
        let held = [0, 2, 1, 0, TRACKBALL_SWITCH_PRESSED | 1];

        let first = decode_trackball_registers(held, &mut was_pressed);
        assert_eq!(
            first,
            TrackballReading {
                left: 0,
                right: 2,
                up: 1,
                down: 0,
                clicked: true
            }
        );
        assert!(!decode_trackball_registers(held, &mut was_pressed).clicked);
        assert!(!decode_trackball_registers([0; 5], &mut was_pressed).clicked);
        assert!(decode_trackball_registers(held, &mut was_pressed).clicked);
    }

    #[test]
    fn window_covers_size_from_offset() {
        let settings = DisplaySettings {
            width: 240,
            height: 135,
            offset_left: 40,
            offset_top: 53,
            ..DisplaySettings::default()
        };
        assert_eq!(display_window(&settings).unwrap(), [40, 279, 53, 187]);

        let edge = DisplaySettings {
            width: 1,
            height: u32::from(u16::MAX),
            offset_left: u16::MAX,
            offset_top: 0,
            ..DisplaySettings::default()
        };
        assert_eq!(display_window(&edge).unwrap(), [u16::MAX, u16::MAX, 0, u16::MAX - 1]);
    }

    #[test]
    fn window_rejects_zero_or_overflowing_size() {
        let zero = DisplaySettings {
            width: 0,
            ..DisplaySettings::default()
        };
        assert!(matches!(display_window(&zero), Err(PeripheralError::Setting(_))));

        let past_end = DisplaySettings {
            height: 10,
            offset_top: u16::MAX - 5,
            ..DisplaySettings::default()
        };
        assert!(matches!(display_window(&past_end), Err(PeripheralError::Setting(_))));

        let too_wide = DisplaySettings {
            width: 70_000,
            offset_left: 0,
            ..DisplaySettings::default()
        };
        assert!(display_window(&too_wide).is_err());
    }

    #[test]
    fn rgb565_packing() {
        assert_eq!(rgb565_bytes([255, 255, 255]), [0xFF, 0xFF]);
        assert_eq!(rgb565_bytes([255, 0, 0]), [0xF8, 0x00]);
        assert_eq!(rgb565_bytes([0, 0, 255]), [0x00, 0x1F]);
        assert_eq!(rgb565_bytes([0, 0, 0]), [0x00, 0x00]);
    }

    #[test]
    fn led_duty_cycle_inverts_for_common_anode() {
        assert_eq!(duty_cycle(255, false), 1.0);
        assert_eq!(duty_cycle(0, false), 0.0);
        assert_eq!(duty_cycle(255, true), 0.0);
    }
}
