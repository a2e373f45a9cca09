use std::{
    convert::Infallible,
    fs,
    io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Local};
use futures::Stream;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    common::{AppContext, SlotWait},
    jpeg::{encode_jpeg, EncodeError},
};

const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
/// Upper bound on one blocking wait for the next frame; the stream re-checks
/// the slot after each.
const STREAM_WAIT: Duration = Duration::from_secs(1);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Thermal Cam</title>
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <style>
    body { background: #111; color: #eee; font-family: sans-serif; text-align: center; }
    img { max-width: 100%; }
    button { margin: 4px; padding: 8px 12px; }
  </style>
</head>
<body>
  <h1>Thermal Cam</h1>
  <img src="/video_feed" alt="thermal stream">
  <div>
    <button onclick="send('/save')">Save Snapshot</button>
    <button onclick="send('/units')">Units</button>
    <button onclick="send('/filter')">Filter</button>
  </div>
  <div>
    <button onclick="send('/dec_min_temp')">Min -</button>
    <button onclick="send('/inc_min_temp')">Min +</button>
    <button onclick="send('/dec_max_temp')">Max -</button>
    <button onclick="send('/inc_max_temp')">Max +</button>
  </div>
  <div>
    <button onclick="send('/colormapback')">&lt; Colormap</button>
    <button onclick="send('/colormap')">Colormap &gt;</button>
    <button onclick="send('/interpolationback')">&lt; Interpolation</button>
    <button onclick="send('/interpolation')">Interpolation &gt;</button>
  </div>
  <div>
    <button onclick="send('/exit')">Exit</button>
  </div>
  <p id="status"></p>
  <script>
    function send(route) {
      fetch(route)
        .then((response) => response.text())
        .then((text) => { document.getElementById("status").textContent = text; });
    }
  </script>
</body>
</html>
"#;

#[derive(thiserror::Error, Debug)]
pub(crate) enum SnapshotError {
    #[error("no frame captured yet")]
    NoFrame,
    #[error("could not encode snapshot: {0}")]
    Encode(#[from] EncodeError),
    #[error("could not write snapshot: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/save", get(save))
        .route("/inc_min_temp", get(inc_min_temp))
        .route("/dec_min_temp", get(dec_min_temp))
        .route("/inc_max_temp", get(inc_max_temp))
        .route("/dec_max_temp", get(dec_max_temp))
        .route("/units", get(units))
        .route("/colormap", get(colormap))
        .route("/colormapback", get(colormap_back))
        .route("/filter", get(filter))
        .route("/interpolation", get(interpolation))
        .route("/interpolationback", get(interpolation_back))
        .route("/exit", get(exit))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/**
 * Resolves once the server should stop: `/exit` fired the hook, or Ctrl-C.
 * Either way the context is shut down first so open streams end and the
 * graceful shutdown can finish. `AppContext::shutdown` never blocks, so it
 * runs directly on the runtime.
 */
pub(crate) async fn shutdown_signal(hook: oneshot::Receiver<()>, ctx: Arc<AppContext>) {
    tokio::select! {
        _ = hook => info!("Shutdown requested"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Ctrl-C received"),
            Err(err) => error!("Could not listen for Ctrl-C: {}", err),
        },
    }
    ctx.shutdown();
}

pub(crate) fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut chunk = Vec::with_capacity(HEADER.len() + jpeg.len() + 2);
    chunk.extend_from_slice(HEADER);
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

enum StreamStep {
    Chunk { sequence: u64, chunk: Bytes },
    Skip { sequence: u64 },
    Wait,
    Closed,
}

fn _next_stream_step(ctx: &AppContext, last_sequence: u64) -> StreamStep {
    match ctx.frames.wait_for_newer(last_sequence, STREAM_WAIT) {
        SlotWait::Closed => StreamStep::Closed,
        SlotWait::TimedOut => StreamStep::Wait,
        SlotWait::Fresh(snapshot) => {
            match encode_jpeg(&snapshot.frame.image, ctx.server.jpeg_quality) {
                Ok(jpeg) => StreamStep::Chunk {
                    sequence: snapshot.sequence,
                    chunk: multipart_chunk(&jpeg),
                },
                Err(err) => {
                    warn!("Skipping frame {}: {}", snapshot.sequence, err);
                    StreamStep::Skip {
                        sequence: snapshot.sequence,
                    }
                }
            }
        }
    }
}

/**
 * One multipart chunk per frame newer than the last one sent. Waiting and
 * encoding run on the blocking pool. The stream ends when the frame slot is
 * closed; a disconnecting client simply drops it.
 */
pub(crate) fn mjpeg_stream(ctx: Arc<AppContext>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold((ctx, 0u64), |(ctx, mut last_sequence)| async move {
        loop {
            let wait_ctx = ctx.clone();
            let step =
                tokio::task::spawn_blocking(move || _next_stream_step(&wait_ctx, last_sequence))
                    .await;
            match step {
                Ok(StreamStep::Chunk { sequence, chunk }) => {
                    return Some((Ok(chunk), (ctx, sequence)));
                }
                Ok(StreamStep::Skip { sequence }) => last_sequence = sequence,
                Ok(StreamStep::Wait) => {}
                Ok(StreamStep::Closed) => return None,
                Err(err) => {
                    error!("Stream worker failed: {}", err);
                    return None;
                }
            }
        }
    })
}

/// Writes the latest frame to `output_folder` and returns the file path.
pub(crate) fn save_latest_frame(
    ctx: &AppContext,
    now: DateTime<Local>,
) -> Result<PathBuf, SnapshotError> {
    let snapshot = ctx.frames.read_snapshot().ok_or(SnapshotError::NoFrame)?;
    if let Ok(age) = snapshot.frame.captured_at.elapsed() {
        debug!("Saving frame {} captured {:?} ago", snapshot.sequence, age);
    }
    let jpeg = encode_jpeg(&snapshot.frame.image, ctx.server.jpeg_quality)?;

    fs::create_dir_all(&ctx.server.output_folder)?;
    let path = ctx
        .server
        .output_folder
        .join(format!("pithermcam_{}.jpg", now.format("%Y%m%d-%H%M%S")));
    fs::write(&path, jpeg)?;
    Ok(path)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn video_feed(State(ctx): State<Arc<AppContext>>) -> Response {
    (
        [(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)],
        Body::from_stream(mjpeg_stream(ctx)),
    )
        .into_response()
}

/// Always acknowledges; a failed save is only logged.
async fn save(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let saved = tokio::task::spawn_blocking(move || save_latest_frame(&ctx, Local::now())).await;
    match saved {
        Ok(Ok(path)) => info!("Snapshot saved to {}", path.display()),
        Ok(Err(err)) => warn!("Snapshot failed: {}", err),
        Err(err) => error!("Snapshot task failed: {}", err),
    }
    "Snapshot Saved"
}

async fn inc_min_temp(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let min = ctx.camera_config.change_min_temp(true);
    info!("Min temp now {:.1}C", min);
    "Increased Min Temp"
}

async fn dec_min_temp(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let min = ctx.camera_config.change_min_temp(false);
    info!("Min temp now {:.1}C", min);
    "Decreased Min Temp"
}

async fn inc_max_temp(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let max = ctx.camera_config.change_max_temp(true);
    info!("Max temp now {:.1}C", max);
    "Increased Max Temp"
}

async fn dec_max_temp(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let max = ctx.camera_config.change_max_temp(false);
    info!("Max temp now {:.1}C", max);
    "Decreased Max Temp"
}

async fn units(State(ctx): State<Arc<AppContext>>) -> &'static str {
    let fahrenheit = ctx.camera_config.toggle_units();
    info!("Fahrenheit: {}", fahrenheit);
    "Units changed"
}

async fn colormap(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Colormap: {}", ctx.camera_config.step_colormap(true));
    "Colormap changed"
}

async fn colormap_back(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Colormap: {}", ctx.camera_config.step_colormap(false));
    "Colormap changed back"
}

async fn filter(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Filtering: {}", ctx.camera_config.toggle_filter());
    "Filtering Toggled"
}

async fn interpolation(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Interpolation: {}", ctx.camera_config.step_interpolation(true));
    "Interpolation Changed"
}

async fn interpolation_back(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Interpolation: {}", ctx.camera_config.step_interpolation(false));
    "Interpolation Changed Back"
}

async fn exit(State(ctx): State<Arc<AppContext>>) -> Response {
    let Some(hook) = ctx.take_shutdown_hook() else {
        warn!("Exit requested but no shutdown hook is installed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Not running with a shutdown-capable server",
        )
            .into_response();
    };

    info!("Exit requested over HTTP");
    // The receiver is gone only if the server already stopped.
    let _ = hook.send(());
    ctx.shutdown();
    "Server shutting down...".into_response()
}
