mod camera_controller;
mod canvas;
mod colormap;
mod common;
mod input_controller;
mod jpeg;
mod network;
mod peripherals;
mod screen_controller;
mod sensor;
mod stream_server;
mod thermal_image;
mod user_config;

use std::{
    fs::OpenOptions,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    camera_controller::{start_camera_controller, CameraConfig, ThermalCamera},
    common::{join_with_deadline, AppContext},
    input_controller::{start_input_controller, InputPoller},
    network::{detect_local_ip, SystemNetwork},
    peripherals::{GpioEncoder, I2cTrackball, PwmLed, St7789},
    screen_controller::{start_screen_controller, ScreenController},
    sensor::{ReopeningFileSensor, SimulatedSensor, ThermalSensor},
    stream_server::{create_router, shutdown_signal},
    user_config::{SensorSettings, SensorSource, UserConfig, DEFAULT_CONFIG_DIR},
};

/// How long shutdown waits for background threads before leaving them behind.
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Streams a thermal camera over HTTP and drives the attached LCD, encoder and trackball.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding thermalcam.json
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on. Defaults to the detected LAN address.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Where /save writes snapshots
    #[arg(long)]
    output_folder: Option<PathBuf>,

    #[arg(long, value_enum)]
    sensor: Option<SensorSource>,

    /// File or FIFO for the stream sensor
    #[arg(long)]
    sensor_path: Option<PathBuf>,

    /// Run without LCD, encoder, LED or trackball
    #[arg(long)]
    headless: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut UserConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(output_folder) = &self.output_folder {
            config.server.output_folder = output_folder.clone();
        }
        if let Some(source) = self.sensor {
            config.sensor.source = source;
        }
        if let Some(path) = &self.sensor_path {
            config.sensor.path = Some(path.clone());
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Could not open log file {}", path.display()))?;
            subscriber.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => subscriber.init(),
    }
    Ok(())
}

fn open_sensor(settings: &SensorSettings) -> anyhow::Result<Box<dyn ThermalSensor>> {
    match settings.source {
        SensorSource::Simulated => {
            info!(
                "Using simulated {}x{} sensor",
                settings.width, settings.height
            );
            Ok(Box::new(SimulatedSensor::new(
                settings.width,
                settings.height,
                Duration::from_millis(settings.frame_interval_ms),
            )))
        }
        SensorSource::Stream => {
            let path = settings
                .path
                .as_deref()
                .context("The stream sensor needs a path")?;
            info!("Reading sensor frames from {}", path.display());
            let sensor = ReopeningFileSensor::open(path, settings.width, settings.height)
                .with_context(|| format!("Could not open sensor stream {}", path.display()))?;
            Ok(Box::new(sensor))
        }
    }
}

/// Starts the input and screen threads for whatever hardware answers.
/// Devices that fail to open are logged and skipped.
fn start_peripherals(
    ctx: &Arc<AppContext>,
    config: &UserConfig,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    let mut poller = InputPoller::new(&config.input, config.led.brightness);
    if config.encoder.enabled {
        match GpioEncoder::new(&config.encoder) {
            Ok(encoder) => poller = poller.with_encoder(Box::new(encoder)),
            Err(err) => warn!("Rotary encoder unavailable: {}", err),
        }
    }
    if config.led.enabled {
        match PwmLed::new(&config.led) {
            Ok(led) => poller = poller.with_led(Box::new(led)),
            Err(err) => warn!("RGB LED unavailable: {}", err),
        }
    }
    if config.trackball.enabled {
        match I2cTrackball::new(&config.trackball) {
            Ok(trackball) => poller = poller.with_trackball(Box::new(trackball)),
            Err(err) => warn!("Trackball unavailable: {}", err),
        }
    }
    if poller.has_devices() {
        handles.push(start_input_controller(ctx.clone(), poller)?);
    }

    if config.display.enabled {
        match St7789::new(&config.display) {
            Ok(screen) => {
                let controller = ScreenController::new(
                    Box::new(screen),
                    Box::new(SystemNetwork),
                    config.server.port,
                    Duration::from_millis(config.display.refresh_ms),
                );
                handles.push(start_screen_controller(ctx.clone(), controller)?);
            }
            Err(err) => warn!("Display unavailable: {}", err),
        }
    }
    Ok(handles)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let mut config = UserConfig::read(&args.config_dir)?;
    args.apply(&mut config);
    config.validate()?;

    let sensor = open_sensor(&config.sensor)?;
    let camera = ThermalCamera::new(sensor, (config.image.width, config.image.height));
    let ctx = Arc::new(AppContext::new(
        camera,
        CameraConfig::from(&config.temperature),
        config.server.clone(),
    ));

    let mut handles = vec![start_camera_controller(ctx.clone())?];
    if args.headless {
        info!("Headless mode, peripherals disabled");
    } else {
        handles.extend(start_peripherals(&ctx, &config)?);
    }

    let ip = match args.bind {
        Some(ip) => ip,
        None => detect_local_ip().unwrap_or_else(|err| {
            warn!("Could not detect local IP ({}), listening on all interfaces", err);
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }),
    };
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;
    info!("Server can be found at {}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    ctx.install_shutdown_hook(shutdown_tx);
    axum::serve(listener, create_router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal(shutdown_rx, ctx.clone()))
        .await
        .context("HTTP server failed")?;

    ctx.shutdown();
    let abandoned =
        tokio::task::spawn_blocking(move || join_with_deadline(handles, THREAD_JOIN_TIMEOUT))
            .await?;
    if abandoned == 0 {
        info!("Shut down cleanly");
    } else {
        warn!("Shut down with {} background threads still running", abandoned);
    }
    Ok(())
}
