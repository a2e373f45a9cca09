use std::{
    io,
    net::IpAddr,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use image::{imageops::FilterType, RgbImage};
use tracing::{debug, info, warn};

use crate::{
    canvas::text_screen,
    common::{spawn_supervised, AppContext, SlotWait, RESTART_DELAY},
    input_controller::DisplayMode,
    network::NetworkIdentity,
    peripherals::{PeripheralError, Screen},
    thermal_image::scale_image,
};

/// `iwgetid` is a subprocess, so the identity shown on screen is refreshed at most this often.
const NETWORK_REFRESH: Duration = Duration::from_secs(10);

struct NetworkStatus {
    ip: Option<IpAddr>,
    ssid: Option<String>,
    checked_at: Instant,
}

/**
 * Drives the LCD. Each refresh waits for the next captured frame (or the
 * refresh interval) and draws the status page or the thermal view, depending
 * on the encoder's display mode.
 */
pub(crate) struct ScreenController {
    screen: Box<dyn Screen>,
    network: Box<dyn NetworkIdentity>,
    port: u16,
    refresh_interval: Duration,
    last_sequence: u64,
    network_status: Option<NetworkStatus>,
}

impl ScreenController {
    pub(crate) fn new(
        screen: Box<dyn Screen>,
        network: Box<dyn NetworkIdentity>,
        port: u16,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            screen,
            network,
            port,
            refresh_interval,
            last_sequence: 0,
            network_status: None,
        }
    }

    fn network_status(&mut self, now: Instant) -> &NetworkStatus {
        let stale = match &self.network_status {
            Some(status) => now.duration_since(status.checked_at) >= NETWORK_REFRESH,
            None => true,
        };
        if stale {
            self.network_status = None;
        }
        let network = &self.network;
        self.network_status.get_or_insert_with(|| NetworkStatus {
            ip: network.ip_address(),
            ssid: network.ssid(),
            checked_at: now,
        })
    }

    /// Builds the next screen image. Never fails; problems become error text.
    pub(crate) fn render(&mut self, ctx: &AppContext, now: Instant) -> RgbImage {
        let size = self.screen.size();
        let (mode, message) = {
            let input = ctx.lock_input();
            (
                input.display_mode(),
                input.active_message(now).map(str::to_string),
            )
        };

        match mode {
            DisplayMode::Status => {
                let port = self.port;
                let status = self.network_status(now);
                let address = match status.ip {
                    Some(ip) => format!("{}:{}", ip, port),
                    None => format!("no network:{}", port),
                };
                let ssid = format!("SSID: {}", status.ssid.as_deref().unwrap_or("-"));

                let mut lines = vec!["Thermal Cam", "Web server", "", address.as_str(), ssid.as_str()];
                if let Some(message) = message.as_deref() {
                    lines.push("");
                    lines.push(message);
                }
                text_screen(size, &lines)
            }
            DisplayMode::Thermal => match ctx.frames.read_snapshot() {
                Some(snapshot) => {
                    match scale_image(&snapshot.frame.image, size, FilterType::Triangle) {
                        Ok(image) => image,
                        Err(err) => {
                            warn!("Could not scale frame for screen: {}", err);
                            let reason = err.to_string();
                            text_screen(size, &["Render error", reason.as_str()])
                        }
                    }
                }
                None => text_screen(size, &["Waiting for", "camera frame..."]),
            },
        }
    }

    /**
     * Waits for a newer frame or the refresh interval, then redraws.
     * Returns `false` once the frame slot is closed.
     */
    pub(crate) fn refresh(&mut self, ctx: &AppContext) -> Result<bool, PeripheralError> {
        match ctx
            .frames
            .wait_for_newer(self.last_sequence, self.refresh_interval)
        {
            SlotWait::Closed => return Ok(false),
            SlotWait::Fresh(snapshot) => self.last_sequence = snapshot.sequence,
            SlotWait::TimedOut => {}
        }

        let image = self.render(ctx, Instant::now());
        self.screen.display(&image)?;
        Ok(true)
    }

    /// Redraws until shutdown or until the capture side closes the frame slot.
    pub(crate) fn run(&mut self, ctx: &AppContext) -> Result<(), PeripheralError> {
        while ctx.is_running() && !ctx.frames.is_closed() {
            if !self.refresh(ctx)? {
                info!("Frame source closed, stopping screen updates");
                break;
            }
        }
        debug!("Screen loop exiting");
        Ok(())
    }
}

pub(crate) fn start_screen_controller(
    ctx: Arc<AppContext>,
    mut controller: ScreenController,
) -> io::Result<JoinHandle<()>> {
    let loop_ctx = ctx.clone();
    spawn_supervised("screen", ctx, RESTART_DELAY, move || {
        controller.run(&loop_ctx)
    })
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::common::{solid_frame, test_context};

    const SCREEN_SIZE: (u32, u32) = (240, 240);

    #[derive(Clone, Default)]
    struct FakeScreen(Arc<Mutex<Vec<RgbImage>>>);

    impl Screen for FakeScreen {
        fn size(&self) -> (u32, u32) {
            SCREEN_SIZE
        }

        fn display(&mut self, image: &RgbImage) -> Result<(), PeripheralError> {
            self.0.lock().unwrap().push(image.clone());
            Ok(())
        }
    }

    struct FakeNetwork;

    impl NetworkIdentity for FakeNetwork {
        fn ip_address(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        }

        fn ssid(&self) -> Option<String> {
            Some("lab".to_string())
        }
    }

    fn controller(screen: FakeScreen) -> ScreenController {
        ScreenController::new(
            Box::new(screen),
            Box::new(FakeNetwork),
            8000,
            Duration::from_millis(10),
        )
    }

    fn is_blank(image: &RgbImage) -> bool {
        image.pixels().all(|p| p.0 == [0, 0, 0])
    }

    #[test]
    fn status_screen_shows_text() {
        let ctx = test_context();
        let mut controller = controller(FakeScreen::default());
        let image = controller.render(&ctx, Instant::now());
        assert_eq!(image.dimensions(), SCREEN_SIZE);
        assert!(!is_blank(&image));
    }

    #[test]
    fn status_screen_overlays_active_message() {
        let ctx = test_context();
        let mut controller = controller(FakeScreen::default());
        let now = Instant::now();
        let plain = controller.render(&ctx, now);

        ctx.lock_input()
            .set_message("Colormap: jet".to_string(), Duration::from_secs(3), now);
        let with_message = controller.render(&ctx, now);
        assert_ne!(plain, with_message);

        let expired = controller.render(&ctx, now + Duration::from_secs(4));
        assert_eq!(plain, expired);
    }

    #[test]
    fn thermal_view_without_frame_shows_waiting_text() {
        let ctx = test_context();
        ctx.lock_input().set_encoder_count(1);
        let mut controller = controller(FakeScreen::default());
        let image = controller.render(&ctx, Instant::now());
        assert!(!is_blank(&image));
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0] || p.0 == [255, 255, 255]));
    }

    #[test]
    fn thermal_view_scales_latest_frame() {
        let ctx = test_context();
        ctx.lock_input().set_encoder_count(1);
        ctx.frames.write(solid_frame(32, 24, [10, 200, 30]));

        let mut controller = controller(FakeScreen::default());
        let image = controller.render(&ctx, Instant::now());
        assert_eq!(image.dimensions(), SCREEN_SIZE);
        assert!(image.pixels().all(|p| p.0 == [10, 200, 30]));
    }

    #[test]
    fn refresh_pushes_to_screen_until_slot_closes() {
        let ctx = test_context();
        let screen = FakeScreen::default();
        let mut controller = controller(screen.clone());

        ctx.frames.write(solid_frame(8, 8, [1, 1, 1]));
        assert!(controller.refresh(&ctx).unwrap());
        assert_eq!(controller.last_sequence, 1);
        // No new frame: refreshes anyway after the interval.
        assert!(controller.refresh(&ctx).unwrap());
        assert_eq!(screen.0.lock().unwrap().len(), 2);

        ctx.frames.close();
        assert!(!controller.refresh(&ctx).unwrap());
        assert_eq!(screen.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn run_does_not_draw_once_slot_is_closed() {
        let ctx = test_context();
        ctx.frames.close();
        assert!(ctx.is_running());

        let screen = FakeScreen::default();
        let mut controller = controller(screen.clone());
        controller.run(&ctx).unwrap();
        assert!(screen.0.lock().unwrap().is_empty());
    }
}
