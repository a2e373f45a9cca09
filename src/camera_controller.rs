use std::{
    io,
    sync::{Arc, PoisonError, RwLock},
    thread::JoinHandle,
    time::SystemTime,
};

use tracing::{debug, info, warn};

use crate::{
    colormap::{Colormap, COLORMAPS},
    common::{spawn_supervised, AppContext, Frame, RESTART_DELAY},
    sensor::{SensorError, ThermalSensor},
    thermal_image::{
        render_thermal_image, Interpolation, RenderError, TemperatureField, INTERPOLATIONS,
    },
    user_config::TemperatureSettings,
};

/// Display settings of the thermal camera, mutated from the HTTP controls and
/// the trackball.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CameraConfig {
    pub(crate) use_fahrenheit: bool,
    pub(crate) colormap_index: usize,
    pub(crate) filter_image: bool,
    pub(crate) interpolation_index: usize,
    /// Colormap floor, degrees Celsius.
    pub(crate) min_temp: f32,
    /// Colormap ceiling, degrees Celsius.
    pub(crate) max_temp: f32,
    pub(crate) temp_step: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::from(&TemperatureSettings::default())
    }
}

impl From<&TemperatureSettings> for CameraConfig {
    fn from(settings: &TemperatureSettings) -> Self {
        Self {
            use_fahrenheit: false,
            colormap_index: 0,
            filter_image: false,
            interpolation_index: 2,
            min_temp: settings.min,
            max_temp: settings.max,
            temp_step: settings.step,
        }
    }
}

impl CameraConfig {
    pub(crate) fn colormap(&self) -> &'static Colormap {
        Colormap::by_index(self.colormap_index)
    }

    pub(crate) fn interpolation(&self) -> Interpolation {
        INTERPOLATIONS[self.interpolation_index % INTERPOLATIONS.len()]
    }

    pub(crate) fn unit_suffix(&self) -> &'static str {
        if self.use_fahrenheit {
            "F"
        } else {
            "C"
        }
    }
}

fn _step_index(index: usize, len: usize, forward: bool) -> usize {
    if forward {
        (index + 1) % len
    } else {
        (index + len - 1) % len
    }
}

/**
 * `CameraConfig` behind a single lock. Every control is one short write, so
 * readers always get a consistent snapshot and the last write wins.
 */
#[derive(Debug)]
pub(crate) struct SharedCameraConfig {
    inner: RwLock<CameraConfig>,
}

impl SharedCameraConfig {
    pub(crate) fn new(config: CameraConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub(crate) fn snapshot(&self) -> CameraConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, change: impl FnOnce(&mut CameraConfig) -> R) -> R {
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut config)
    }

    pub(crate) fn toggle_units(&self) -> bool {
        self.update(|c| {
            c.use_fahrenheit = !c.use_fahrenheit;
            c.use_fahrenheit
        })
    }

    pub(crate) fn toggle_filter(&self) -> bool {
        self.update(|c| {
            c.filter_image = !c.filter_image;
            c.filter_image
        })
    }

    /// Steps the colormap and returns the name of the new one.
    pub(crate) fn step_colormap(&self, forward: bool) -> &'static str {
        self.update(|c| {
            c.colormap_index = _step_index(c.colormap_index, COLORMAPS.len(), forward);
            c.colormap().name
        })
    }

    pub(crate) fn step_interpolation(&self, forward: bool) -> &'static str {
        self.update(|c| {
            c.interpolation_index =
                _step_index(c.interpolation_index, INTERPOLATIONS.len(), forward);
            c.interpolation().name
        })
    }

    /// Moves the colormap floor by one step. A step that would reach the
    /// ceiling is ignored.
    pub(crate) fn change_min_temp(&self, increase: bool) -> f32 {
        self.update(|c| {
            let next = if increase {
                c.min_temp + c.temp_step
            } else {
                c.min_temp - c.temp_step
            };
            if next < c.max_temp {
                c.min_temp = next;
            }
            c.min_temp
        })
    }

    /// Moves the colormap ceiling by one step. A step that would reach the
    /// floor is ignored.
    pub(crate) fn change_max_temp(&self, increase: bool) -> f32 {
        self.update(|c| {
            let next = if increase {
                c.max_temp + c.temp_step
            } else {
                c.max_temp - c.temp_step
            };
            if next > c.min_temp {
                c.max_temp = next;
            }
            c.max_temp
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum CaptureError {
    #[error("sensor read failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("could not render frame: {0}")]
    Render(#[from] RenderError),
}

/**
 * The camera driver: owns the sensor and turns each temperature field into an
 * RGB frame of `output_size`.
 */
pub(crate) struct ThermalCamera {
    sensor: Box<dyn ThermalSensor>,
    readings: Vec<f32>,
    output_size: (u32, u32),
}

impl ThermalCamera {
    pub(crate) fn new(sensor: Box<dyn ThermalSensor>, output_size: (u32, u32)) -> Self {
        let (width, height) = sensor.resolution();
        Self {
            sensor,
            readings: vec![0.0; (width * height) as usize],
            output_size,
        }
    }

    pub(crate) fn update_image_frame(
        &mut self,
        config: &CameraConfig,
    ) -> Result<Frame, CaptureError> {
        self.sensor.read_frame(&mut self.readings)?;
        let captured_at = SystemTime::now();

        let (width, height) = self.sensor.resolution();
        let field = TemperatureField {
            width,
            height,
            celsius: &self.readings,
        };
        let image = render_thermal_image(&field, config, self.output_size)?;
        Ok(Frame { image, captured_at })
    }
}

/**
 * Entry point for the capture thread. Frames go into `ctx.frames` until the
 * context stops running or the camera handle in it is cleared. The loop drops
 * the camera itself on the way out, so a shutdown never has to wait for a
 * capture to finish.
 */
pub(crate) fn start_camera_controller(ctx: Arc<AppContext>) -> io::Result<JoinHandle<()>> {
    let loop_ctx = ctx.clone();
    spawn_supervised("capture", ctx, RESTART_DELAY, move || {
        _capture_loop(&loop_ctx);
        Ok::<(), CaptureError>(())
    })
}

fn _capture_loop(ctx: &AppContext) {
    let mut frames_captured: u64 = 0;
    loop {
        if !ctx.is_running() {
            ctx.lock_camera().take();
            break;
        }

        let config = ctx.camera_config.snapshot();
        let captured = {
            let mut camera = ctx.lock_camera();
            match camera.as_mut() {
                Some(camera) => camera.update_image_frame(&config),
                None => break,
            }
        };

        match captured {
            Ok(frame) => {
                ctx.frames.write(frame);
                frames_captured += 1;
                if frames_captured % 100 == 0 {
                    debug!("Captured {} frames", frames_captured);
                }
            }
            // Retry at the sensor's own pace.
            Err(err) => warn!("Frame capture failed, continuing: {}", err),
        }
    }

    info!("Camera released, stopping capture");
    ctx.frames.close();
}
