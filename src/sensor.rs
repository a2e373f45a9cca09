use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use tracing::info;

/// MLX90640 array size.
pub(crate) const MLX90640_RESOLUTION: (u32, u32) = (32, 24);

const AMBIENT_CELSIUS: f32 = 22.0;
const HOT_SPOT_CELSIUS: f32 = 14.0;
const HOT_SPOT_SIGMA: f32 = 3.0;

#[derive(thiserror::Error, Debug)]
pub(crate) enum SensorError {
    #[error("sensor I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("sensor stream ended")]
    EndOfStream,
    #[error("output buffer holds {actual} readings, sensor produces {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/**
 * A thermal array sensor. `read_frame` blocks until the next frame is
 * available and fills `celsius` row major.
 */
pub(crate) trait ThermalSensor: Send {
    fn resolution(&self) -> (u32, u32);
    fn read_frame(&mut self, celsius: &mut [f32]) -> Result<(), SensorError>;
}

fn _check_buffer(resolution: (u32, u32), celsius: &[f32]) -> Result<(), SensorError> {
    let expected = (resolution.0 * resolution.1) as usize;
    if celsius.len() != expected {
        return Err(SensorError::BufferSize {
            expected,
            actual: celsius.len(),
        });
    }
    Ok(())
}

/**
 * Produces a room-temperature scene with a warm spot circling the centre.
 * Deterministic, so frames can be compared in tests.
 */
pub(crate) struct SimulatedSensor {
    width: u32,
    height: u32,
    frame_interval: Duration,
    tick: u64,
}

impl SimulatedSensor {
    pub(crate) fn new(width: u32, height: u32, frame_interval: Duration) -> Self {
        Self {
            width,
            height,
            frame_interval,
            tick: 0,
        }
    }
}

impl ThermalSensor for SimulatedSensor {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame(&mut self, celsius: &mut [f32]) -> Result<(), SensorError> {
        _check_buffer(self.resolution(), celsius)?;
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }

        let phase = self.tick as f32 * 0.15;
        let center_x = self.width as f32 / 2.0 + self.width as f32 / 4.0 * phase.cos();
        let center_y = self.height as f32 / 2.0 + self.height as f32 / 4.0 * phase.sin();

        for (idx, value) in celsius.iter_mut().enumerate() {
            let x = (idx as u32 % self.width) as f32;
            let y = (idx as u32 / self.width) as f32;
            let distance_sq = (x - center_x).powi(2) + (y - center_y).powi(2);
            let spot = HOT_SPOT_CELSIUS * (-distance_sq / (2.0 * HOT_SPOT_SIGMA.powi(2))).exp();
            *value = AMBIENT_CELSIUS + spot + 0.2 * (x * 0.7 + phase).sin();
        }

        self.tick += 1;
        Ok(())
    }
}

/**
 * Reads frames of little-endian `f32` readings from a byte stream, e.g. a
 * pipe fed by an external sensor driver process.
 */
pub(crate) struct StreamSensor<R> {
    reader: R,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl<R: Read> StreamSensor<R> {
    pub(crate) fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            buffer: vec![0; (width * height) as usize * 4],
        }
    }
}

impl<R: Read + Send> ThermalSensor for StreamSensor<R> {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame(&mut self, celsius: &mut [f32]) -> Result<(), SensorError> {
        _check_buffer(self.resolution(), celsius)?;
        match self.reader.read_exact(&mut self.buffer) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SensorError::EndOfStream)
            }
            Err(err) => return Err(err.into()),
        }

        for (value, bytes) in celsius.iter_mut().zip(self.buffer.chunks_exact(4)) {
            *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(())
    }
}

/**
 * `StreamSensor` over a file path. At end of stream the path is opened again:
 * a FIFO then blocks until the driver reconnects, and a recording replays
 * from the start.
 */
pub(crate) struct ReopeningFileSensor {
    path: PathBuf,
    inner: StreamSensor<BufReader<File>>,
}

impl ReopeningFileSensor {
    pub(crate) fn open(path: &Path, width: u32, height: u32) -> Result<Self, SensorError> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: StreamSensor::new(BufReader::new(file), width, height),
        })
    }
}

impl ThermalSensor for ReopeningFileSensor {
    fn resolution(&self) -> (u32, u32) {
        self.inner.resolution()
    }

    fn read_frame(&mut self, celsius: &mut [f32]) -> Result<(), SensorError> {
        match self.inner.read_frame(celsius) {
            Err(SensorError::EndOfStream) => {
                info!("Sensor stream {} ended, reopening", self.path.display());
                let (width, height) = self.inner.resolution();
                let file = File::open(&self.path)?;
                self.inner = StreamSensor::new(BufReader::new(file), width, height);
                self.inner.read_frame(celsius)
            }
            other => other,
        }
    }
}
