use std::{
    fmt::Display,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use image::RgbImage;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    camera_controller::{CameraConfig, SharedCameraConfig, ThermalCamera},
    input_controller::InputState,
    user_config::ServerSettings,
};

/// Delay before a supervised loop is restarted after a panic or an error.
pub(crate) const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) image: RgbImage,
    pub(crate) captured_at: SystemTime,
}

/// A frame handed out by the slot together with its write sequence number.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) sequence: u64,
    pub(crate) frame: Arc<Frame>,
}

#[derive(Debug)]
pub(crate) enum SlotWait {
    Fresh(Snapshot),
    TimedOut,
    Closed,
}

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    sequence: u64,
    closed: bool,
}

impl SlotState {
    fn has_newer(&self, after_sequence: u64) -> bool {
        self.frame.is_some() && self.sequence > after_sequence
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.frame.as_ref().map(|frame| Snapshot {
            sequence: self.sequence,
            frame: frame.clone(),
        })
    }
}

/**
 * Holds the most recently captured frame.
 *
 * Writers swap in a new `Arc<Frame>` under the lock, so a reader either gets
 * the previous frame or the new one, never a mix of both. Readers that want to
 * follow the stream wait on `frame_cv` instead of spinning on `read_snapshot`.
 */
#[derive(Debug, Default)]
pub(crate) struct FrameSlot {
    state: Mutex<SlotState>,
    frame_cv: Condvar,
}

impl FrameSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // The state is only ever a pointer swap, so a poisoned lock still
        // guards a consistent value.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self, frame: Frame) {
        {
            let mut state = self.lock();
            state.frame = Some(Arc::new(frame));
            state.sequence += 1;
        }
        self.frame_cv.notify_all();
    }

    /// Returns the current frame, or `None` if nothing has been written yet.
    pub(crate) fn read_snapshot(&self) -> Option<Snapshot> {
        self.lock().snapshot()
    }

    /**
     * Blocks until a frame newer than `after_sequence` is available, the
     * timeout elapses, or the slot is closed.
     */
    pub(crate) fn wait_for_newer(&self, after_sequence: u64, timeout: Duration) -> SlotWait {
        let guard = self.lock();
        let (state, _) = self
            .frame_cv
            .wait_timeout_while(guard, timeout, |state| {
                !state.closed && !state.has_newer(after_sequence)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return SlotWait::Closed;
        }
        if state.has_newer(after_sequence) {
            if let Some(snapshot) = state.snapshot() {
                return SlotWait::Fresh(snapshot);
            }
        }
        SlotWait::TimedOut
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.frame_cv.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/**
 * Everything the capture, input, screen and HTTP components share.
 * Built once in `main` and handed to each component as an `Arc`.
 */
pub(crate) struct AppContext {
    pub(crate) frames: FrameSlot,
    pub(crate) camera_config: SharedCameraConfig,
    pub(crate) server: ServerSettings,
    /// Cleared on shutdown; the capture loop stops once it sees `None` or the
    /// run flag drops.
    camera: Mutex<Option<ThermalCamera>>,
    input: Mutex<InputState>,
    running: AtomicBool,
    shutdown_hook: Mutex<Option<oneshot::Sender<()>>>,
}

impl AppContext {
    pub(crate) fn new(
        camera: ThermalCamera,
        camera_config: CameraConfig,
        server: ServerSettings,
    ) -> Self {
        Self {
            frames: FrameSlot::new(),
            camera_config: SharedCameraConfig::new(camera_config),
            server,
            camera: Mutex::new(Some(camera)),
            input: Mutex::new(InputState::default()),
            running: AtomicBool::new(true),
            shutdown_hook: Mutex::new(None),
        }
    }

    pub(crate) fn lock_camera(&self) -> MutexGuard<'_, Option<ThermalCamera>> {
        self.camera.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_input(&self) -> MutexGuard<'_, InputState> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn install_shutdown_hook(&self, hook: oneshot::Sender<()>) {
        *self
            .shutdown_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Hands out the server shutdown hook. Only the first caller gets it.
    pub(crate) fn take_shutdown_hook(&self) -> Option<oneshot::Sender<()>> {
        self.shutdown_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /**
     * Stops every background loop: clears the run flag and closes the frame
     * slot so that waiting streams unwind. Never blocks. If a capture is in
     * flight the camera lock is busy, and the capture loop drops the camera
     * itself once the sensor returns.
     */
    pub(crate) fn shutdown(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!("Shutting down camera and background loops");
        }
        self.frames.close();

        let camera = match self.camera.try_lock() {
            Ok(camera) => Some(camera),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match camera {
            Some(mut camera) => drop(camera.take()),
            None => debug!("Capture in flight, camera released by the capture loop"),
        }
    }
}

/**
 * Runs `body` on a named thread and restarts it whenever it panics or returns
 * an error. The thread ends once `body` returns `Ok(())` or the context stops
 * running.
 */
pub(crate) fn spawn_supervised<F, E>(
    name: &str,
    ctx: Arc<AppContext>,
    restart_delay: Duration,
    mut body: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: Display,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        info!("Starting {} thread...", thread_name);
        loop {
            match panic::catch_unwind(AssertUnwindSafe(&mut body)) {
                Ok(Ok(())) => {
                    info!("{} thread finished", thread_name);
                    return;
                }
                Ok(Err(err)) => error!("{} loop failed: {}", thread_name, err),
                Err(_) => error!("{} loop panicked", thread_name),
            }

            if !ctx.is_running() {
                warn!("{} loop not restarted, shutting down", thread_name);
                return;
            }
            thread::sleep(restart_delay);
            info!("Restarting {} loop", thread_name);
        }
    })
}

/**
 * Joins the background threads, giving up on any still running after
 * `timeout`. A thread stuck in a device read is left behind and dies with the
 * process. Returns how many threads were abandoned.
 */
pub(crate) fn join_with_deadline(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut pending = handles;
    while !pending.is_empty() && Instant::now() < deadline {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(JoinHandle::is_finished);
        for handle in finished {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!("{} thread panicked during shutdown", name);
            }
        }
        pending = running;
        if !pending.is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
    }

    for handle in &pending {
        warn!(
            "{} thread did not stop in time, abandoning it",
            handle.thread().name().unwrap_or("unnamed")
        );
    }
    pending.len()
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<AppContext> {
    use crate::sensor::SimulatedSensor;

    let sensor = SimulatedSensor::new(32, 24, Duration::from_millis(2));
    let camera = ThermalCamera::new(Box::new(sensor), (64, 48));
    Arc::new(AppContext::new(
        camera,
        CameraConfig::default(),
        ServerSettings::default(),
    ))
}

#[cfg(test)]
pub(crate) fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
    Frame {
        image: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        captured_at: SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn empty_slot_reads_none() {
        let slot = FrameSlot::new();
        assert!(slot.read_snapshot().is_none());
        assert!(matches!(
            slot.wait_for_newer(0, Duration::from_millis(10)),
            SlotWait::TimedOut
        ));
    }

    #[test]
    fn write_replaces_frame_and_bumps_sequence() {
        let slot = FrameSlot::new();
        slot.write(solid_frame(4, 4, [1, 2, 3]));
        slot.write(solid_frame(4, 4, [9, 9, 9]));

        let snapshot = slot.read_snapshot().unwrap();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.frame.image.get_pixel(0, 0).0, [9, 9, 9]);
    }

    #[test]
    fn waiter_wakes_on_write() {
        let slot = Arc::new(FrameSlot::new());
        let writer_slot = slot.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer_slot.write(solid_frame(2, 2, [7, 7, 7]));
        });

        match slot.wait_for_newer(0, Duration::from_secs(5)) {
            SlotWait::Fresh(snapshot) => assert_eq!(snapshot.sequence, 1),
            other => panic!("expected a fresh frame, got {:?}", other),
        }
        writer.join().unwrap();
    }

    #[test]
    fn wait_ignores_frames_already_seen() {
        let slot = FrameSlot::new();
        slot.write(solid_frame(2, 2, [0, 0, 0]));
        assert!(matches!(
            slot.wait_for_newer(1, Duration::from_millis(10)),
            SlotWait::TimedOut
        ));
    }

    #[test]
    fn close_wakes_waiters() {
        let slot = Arc::new(FrameSlot::new());
        let closer = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        assert!(matches!(
            slot.wait_for_newer(0, Duration::from_secs(5)),
            SlotWait::Closed
        ));
        assert!(slot.is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn readers_never_see_torn_frames() {
        let slot = Arc::new(FrameSlot::new());
        let writers: Vec<_> = (0..4u8)
            .map(|id| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for round in 0..50u8 {
                        let value = id.wrapping_mul(60).wrapping_add(round);
                        slot.write(solid_frame(16, 16, [value, value, value]));
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            if let Some(snapshot) = slot.read_snapshot() {
                let first = *snapshot.frame.image.get_pixel(0, 0);
                assert!(snapshot.frame.image.pixels().all(|p| *p == first));
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }

    #[test]
    fn supervisor_restarts_after_panic() {
        let ctx = test_context();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("test", ctx, Duration::from_millis(1), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run fails");
            }
            Ok::<(), String>(())
        })
        .unwrap();

        handle.join().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn supervisor_stops_when_context_is_shut_down() {
        let ctx = test_context();
        ctx.shutdown();

        let handle = spawn_supervised("test", ctx, Duration::from_millis(1), || {
            Err::<(), _>("bus gone")
        })
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_drops_camera_and_closes_slot() {
        let ctx = test_context();
        assert!(ctx.lock_camera().is_some());

        ctx.shutdown();
        assert!(!ctx.is_running());
        assert!(ctx.lock_camera().is_none());
        assert!(ctx.frames.is_closed());
    }

    #[test]
    fn deadline_join_abandons_stuck_threads() {
        let quick = thread::spawn(|| {});
        let stuck = thread::Builder::new()
            .name("stuck".to_string())
            .spawn(|| thread::sleep(Duration::from_secs(10)))
            .unwrap();

        let started = Instant::now();
        let abandoned = join_with_deadline(vec![quick, stuck], Duration::from_millis(100));
        assert_eq!(abandoned, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn deadline_join_waits_for_finishing_threads() {
        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(30)));
        assert_eq!(join_with_deadline(vec![slow], Duration::from_secs(5)), 0);
    }

    #[test]
    fn shutdown_hook_is_handed_out_once() {
        let ctx = test_context();
        let (tx, _rx) = oneshot::channel();
        ctx.install_shutdown_hook(tx);

        assert!(ctx.take_shutdown_hook().is_some());
        assert!(ctx.take_shutdown_hook().is_none());
    }
}
