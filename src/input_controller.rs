use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use palette::{FromColor, Hsv, Srgb};
use tracing::{debug, info};

use crate::{
    common::{spawn_supervised, AppContext, RESTART_DELAY},
    peripherals::{PeripheralError, RgbLed, RotaryEncoder, Trackball, TrackballReading},
    user_config::InputSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisplayMode {
    Status,
    Thermal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gesture {
    ColormapForward,
    ColormapBack,
}

#[derive(Debug, Clone)]
pub(crate) struct TransientMessage {
    pub(crate) text: String,
    pub(crate) expires: Instant,
}

/// UI state derived from the encoder and the trackball.
#[derive(Debug, Default)]
pub(crate) struct InputState {
    /// Encoder count when polling started; modes and hue are relative to it.
    pub(crate) encoder_offset: i64,
    pub(crate) encoder_count: i64,
    pub(crate) hue: f32,
    pub(crate) state_x: i32,
    pub(crate) state_y: i32,
    pub(crate) clicks: u64,
    pub(crate) message: Option<TransientMessage>,
}

/// `((count - offset) mod 360) / 360`, always in `[0, 1)`.
pub(crate) fn hue_for_count(count: i64, offset: i64) -> f32 {
    let degrees = (count as i128 - offset as i128).rem_euclid(360);
    degrees as f32 / 360.0
}

/// Fully saturated RGB for `hue` in turns, scaled by `brightness` in `[0, 1]`.
pub(crate) fn hue_to_rgb(hue: f32, brightness: f32) -> [u8; 3] {
    let hsv: Hsv = Hsv::new(hue * 360.0, 1.0, brightness.clamp(0.0, 1.0));
    let rgb: Srgb<u8> = Srgb::<f32>::from_color(hsv).into_format();
    [rgb.red, rgb.green, rgb.blue]
}

impl InputState {
    pub(crate) fn relative_count(&self) -> i64 {
        self.encoder_count.wrapping_sub(self.encoder_offset)
    }

    pub(crate) fn display_mode(&self) -> DisplayMode {
        match self.relative_count().rem_euclid(2) {
            0 => DisplayMode::Status,
            _ => DisplayMode::Thermal,
        }
    }

    /// Starts counting from `count`.
    pub(crate) fn calibrate(&mut self, count: i64) {
        self.encoder_offset = count;
        self.encoder_count = count;
        self.hue = 0.0;
    }

    /// Records a new absolute count and returns the hue it maps to.
    pub(crate) fn set_encoder_count(&mut self, count: i64) -> f32 {
        self.encoder_count = count;
        self.hue = hue_for_count(count, self.encoder_offset);
        self.hue
    }

    /**
     * Folds a trackball reading into the gesture counters.
     *
     * Horizontal movement accumulates in `state_x`; vertical movement moves
     * `state_y` within -1..=1. With the ball held "up" (`state_y == 1`), two
     * net steps right or left fire a colormap step and reset `state_x`.
     */
    pub(crate) fn apply_trackball(&mut self, reading: &TrackballReading) -> Option<Gesture> {
        self.state_x += reading.right as i32 - reading.left as i32;
        self.state_y = (self.state_y + reading.up as i32 - reading.down as i32).clamp(-1, 1);
        if reading.clicked {
            self.clicks += 1;
        }

        if self.state_y != 1 {
            return None;
        }
        if self.state_x > 1 {
            self.state_x = 0;
            Some(Gesture::ColormapForward)
        } else if self.state_x < -1 {
            self.state_x = 0;
            Some(Gesture::ColormapBack)
        } else {
            None
        }
    }

    pub(crate) fn set_message(&mut self, text: String, ttl: Duration, now: Instant) {
        self.message = Some(TransientMessage {
            text,
            expires: now + ttl,
        });
    }

    pub(crate) fn active_message(&self, now: Instant) -> Option<&str> {
        self.message
            .as_ref()
            .filter(|message| message.expires > now)
            .map(|message| message.text.as_str())
    }
}

/**
 * Polls whichever input peripherals are present. Missing ones are skipped, so
 * a headless build runs the same loop with nothing attached.
 */
pub(crate) struct InputPoller {
    encoder: Option<Box<dyn RotaryEncoder>>,
    led: Option<Box<dyn RgbLed>>,
    trackball: Option<Box<dyn Trackball>>,
    brightness: f32,
    poll_interval: Duration,
    message_ttl: Duration,
    calibrated: bool,
}

impl InputPoller {
    pub(crate) fn new(settings: &InputSettings, brightness: f32) -> Self {
        Self {
            encoder: None,
            led: None,
            trackball: None,
            brightness,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            message_ttl: Duration::from_secs(settings.message_secs),
            calibrated: false,
        }
    }

    pub(crate) fn with_encoder(mut self, encoder: Box<dyn RotaryEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub(crate) fn with_led(mut self, led: Box<dyn RgbLed>) -> Self {
        self.led = Some(led);
        self
    }

    pub(crate) fn with_trackball(mut self, trackball: Box<dyn Trackball>) -> Self {
        self.trackball = Some(trackball);
        self
    }

    pub(crate) fn has_devices(&self) -> bool {
        self.encoder.is_some() || self.trackball.is_some()
    }

    pub(crate) fn poll_once(&mut self, ctx: &AppContext, now: Instant) -> Result<(), PeripheralError> {
        if let Some(encoder) = self.encoder.as_mut() {
            if !self.calibrated {
                let count = encoder.read_count()?;
                ctx.lock_input().calibrate(count);
                self.calibrated = true;
                debug!("Encoder offset set to {}", count);
            }

            if encoder.take_interrupt()? {
                let count = encoder.read_count()?;
                let hue = ctx.lock_input().set_encoder_count(count);
                if let Some(led) = self.led.as_mut() {
                    led.set_rgb(hue_to_rgb(hue, self.brightness))?;
                }
            }
        }

        if let Some(trackball) = self.trackball.as_mut() {
            let reading = trackball.read()?;
            let (gesture, clicks) = {
                let mut input = ctx.lock_input();
                (input.apply_trackball(&reading), input.clicks)
            };
            if reading.clicked {
                debug!("Trackball clicked ({} total)", clicks);
            }
            if let Some(gesture) = gesture {
                let name = ctx
                    .camera_config
                    .step_colormap(gesture == Gesture::ColormapForward);
                info!("Trackball changed colormap to {}", name);
                ctx.lock_input()
                    .set_message(format!("Colormap: {}", name), self.message_ttl, now);
            }
        }
        Ok(())
    }

    pub(crate) fn run(&mut self, ctx: &AppContext) -> Result<(), PeripheralError> {
        while ctx.is_running() {
            self.poll_once(ctx, Instant::now())?;
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }
}

pub(crate) fn start_input_controller(
    ctx: Arc<AppContext>,
    mut poller: InputPoller,
) -> io::Result<JoinHandle<()>> {
    let loop_ctx = ctx.clone();
    spawn_supervised("input", ctx, RESTART_DELAY, move || poller.run(&loop_ctx))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use proptest::prelude::*;

    use super::*;
    use crate::{colormap::COLORMAPS, common::test_context};

    struct FakeEncoder {
        counts: VecDeque<i64>,
        current: i64,
    }

    impl RotaryEncoder for FakeEncoder {
        fn take_interrupt(&mut self) -> Result<bool, PeripheralError> {
            match self.counts.pop_front() {
                Some(count) => {
                    self.current = count;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        fn read_count(&mut self) -> Result<i64, PeripheralError> {
            Ok(self.current)
        }
    }

    struct FakeLed(Arc<Mutex<Vec<[u8; 3]>>>);

    impl RgbLed for FakeLed {
        fn set_rgb(&mut self, rgb: [u8; 3]) -> Result<(), PeripheralError> {
            self.0.lock().unwrap().push(rgb);
            Ok(())
        }
    }

    struct FakeTrackball(VecDeque<TrackballReading>);

    impl Trackball for FakeTrackball {
        fn read(&mut self) -> Result<TrackballReading, PeripheralError> {
            Ok(self.0.pop_front().unwrap_or_default())
        }
    }

    fn settings() -> InputSettings {
        InputSettings {
            poll_interval_ms: 1,
            message_secs: 3,
        }
    }

    fn moved(right: u8, left: u8, up: u8, down: u8) -> TrackballReading {
        TrackballReading {
            left,
            right,
            up,
            down,
            clicked: false,
        }
    }

    proptest! {
        #[test]
        fn hue_is_normalised(count in any::<i64>(), offset in any::<i64>()) {
            let hue = hue_for_count(count, offset);
            prop_assert!((0.0..1.0).contains(&hue));
            let degrees = (count as i128 - offset as i128).rem_euclid(360);
            prop_assert_eq!(hue, degrees as f32 / 360.0);
        }
    }

    #[test]
    fn hue_examples() {
        assert_eq!(hue_for_count(370, 10), 0.0);
        assert_eq!(hue_for_count(0, 90), 0.75);
        assert_eq!(hue_for_count(180, 0), 0.5);
    }

    #[test]
    fn hue_colors() {
        assert_eq!(hue_to_rgb(0.0, 1.0), [255, 0, 0]);
        assert_eq!(hue_to_rgb(0.25, 0.0), [0, 0, 0]);
    }

    #[test]
    fn display_mode_follows_parity() {
        let mut state = InputState::default();
        state.calibrate(7);
        assert_eq!(state.display_mode(), DisplayMode::Status);
        state.set_encoder_count(8);
        assert_eq!(state.display_mode(), DisplayMode::Thermal);
        state.set_encoder_count(5);
        assert_eq!(state.display_mode(), DisplayMode::Status);
        state.set_encoder_count(4);
        assert_eq!(state.display_mode(), DisplayMode::Thermal);
    }

    #[test]
    fn swipe_right_while_up_steps_forward_once() {
        let mut state = InputState::default();
        assert_eq!(state.apply_trackball(&moved(0, 0, 1, 0)), None);
        assert_eq!(state.apply_trackball(&moved(1, 0, 0, 0)), None);
        assert_eq!(
            state.apply_trackball(&moved(1, 0, 0, 0)),
            Some(Gesture::ColormapForward)
        );
        assert_eq!(state.state_x, 0);
        assert_eq!(state.state_y, 1);
        assert_eq!(state.apply_trackball(&moved(1, 0, 0, 0)), None);
    }

    #[test]
    fn swipe_left_while_up_steps_back() {
        let mut state = InputState::default();
        assert_eq!(
            state.apply_trackball(&moved(0, 2, 3, 0)),
            Some(Gesture::ColormapBack)
        );
        assert_eq!(state.state_x, 0);
    }

    #[test]
    fn horizontal_movement_without_up_accumulates() {
        let mut state = InputState::default();
        assert_eq!(state.apply_trackball(&moved(5, 0, 0, 1)), None);
        assert_eq!(state.state_x, 5);
        assert_eq!(state.state_y, -1);
        assert_eq!(
            state.apply_trackball(&moved(0, 0, 2, 0)),
            Some(Gesture::ColormapForward)
        );
    }

    #[test]
    fn clicks_are_counted() {
        let mut state = InputState::default();
        state.apply_trackball(&TrackballReading {
            clicked: true,
            ..TrackballReading::default()
        });
        assert_eq!(state.clicks, 1);
    }

    #[test]
    fn message_expires() {
        let mut state = InputState::default();
        let now = Instant::now();
        state.set_message("hello".to_string(), Duration::from_secs(3), now);
        assert_eq!(state.active_message(now), Some("hello"));
        assert_eq!(state.active_message(now + Duration::from_secs(3)), None);
    }

    #[test]
    fn poll_drives_led_from_encoder() {
        let ctx = test_context();
        let colors = Arc::new(Mutex::new(Vec::new()));
        let encoder = FakeEncoder {
            counts: VecDeque::from([100, 190]),
            current: 100,
        };
        let mut poller = InputPoller::new(&settings(), 1.0)
            .with_encoder(Box::new(encoder))
            .with_led(Box::new(FakeLed(colors.clone())));

        let now = Instant::now();
        poller.poll_once(&ctx, now).unwrap();
        assert_eq!(ctx.lock_input().encoder_offset, 100);
        poller.poll_once(&ctx, now).unwrap();

        let input = ctx.lock_input();
        assert_eq!(input.relative_count(), 90);
        assert_eq!(input.hue, 0.25);
        assert_eq!(input.display_mode(), DisplayMode::Status);
        assert_eq!(colors.lock().unwrap().len(), 2);
        assert_eq!(colors.lock().unwrap()[0], [255, 0, 0]);
    }

    #[test]
    fn poll_applies_trackball_gesture_to_camera_config() {
        let ctx = test_context();
        let readings = VecDeque::from([moved(0, 0, 1, 0), moved(2, 0, 0, 0)]);
        let mut poller =
            InputPoller::new(&settings(), 1.0).with_trackball(Box::new(FakeTrackball(readings)));

        let now = Instant::now();
        poller.poll_once(&ctx, now).unwrap();
        poller.poll_once(&ctx, now).unwrap();

        assert_eq!(ctx.camera_config.snapshot().colormap_index, 1);
        let expected = format!("Colormap: {}", COLORMAPS[1].name);
        assert_eq!(
            ctx.lock_input().active_message(now),
            Some(expected.as_str())
        );
    }

    #[test]
    fn input_thread_stops_on_shutdown() {
        let ctx = test_context();
        let poller = InputPoller::new(&settings(), 1.0);
        let handle = start_input_controller(ctx.clone(), poller).unwrap();
        ctx.shutdown();
        handle.join().unwrap();
    }
}
