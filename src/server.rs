//! Control API for calibration, head input and frame output

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nalgebra::Vector3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::calibration::{reset_vertices, update_vertex, vertex_points, VertexPoint};
use crate::config::Config;
use crate::frame::{compute_projector, FrameOutput, ProjectorFrame};
use crate::preview::{encode_png, render_display_preview};
use crate::topology::{Topology, TrackedHead};
use crate::warp::WarpCache;

/// Shared application state
pub struct AppState {
    /// Installation configuration (with calibration vertices)
    pub config: Arc<RwLock<Config>>,
    /// Path to save configuration
    config_path: PathBuf,
    /// Resolved installation, replaced whole on every change
    topology: ArcSwap<Topology>,
    warp_cache: WarpCache,
    /// Latest head position in world space
    head: ArcSwap<TrackedHead>,
    latest_frame: ArcSwap<FrameOutput>,
    shutdown_requested: AtomicBool,
}

impl AppState {
    pub fn new(config: Arc<RwLock<Config>>, config_path: PathBuf) -> Result<Self> {
        let topology = Topology::from_config(&config.read(), None)?;
        let head = topology.rest_head();

        Ok(Self {
            config,
            config_path,
            topology: ArcSwap::from_pointee(topology),
            warp_cache: WarpCache::new(),
            head: ArcSwap::from_pointee(head),
            latest_frame: ArcSwap::from_pointee(FrameOutput::default()),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Re-resolve the installation from `config`. Callers hold the config
    /// write lock, which keeps rebuilds in order.
    pub fn rebuild_topology_with(&self, config: &Config) -> Result<()> {
        let previous = self.topology.load_full();
        let next = Topology::from_config(config, Some(&previous))?;
        tracing::debug!("Topology rebuilt, revision {}", next.revision);
        self.topology.store(Arc::new(next));
        Ok(())
    }

    pub fn warp_cache(&self) -> &WarpCache {
        &self.warp_cache
    }

    pub fn head(&self) -> TrackedHead {
        **self.head.load()
    }

    pub fn set_head(&self, head: TrackedHead) {
        self.head.store(Arc::new(head));
    }

    /// Make a finished frame visible to readers (called from the frame loop)
    pub fn publish_frame(&self, frame: FrameOutput) {
        self.latest_frame.store(Arc::new(frame));
    }

    pub fn latest_frame(&self) -> Arc<FrameOutput> {
        self.latest_frame.load_full()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Save configuration to file
    pub fn save_config(&self) -> Result<()> {
        let config = self.config.read();
        config.save(&self.config_path)
    }

    fn surface_status(&self, surface: usize) -> Option<SurfaceStatus> {
        let topology = self.topology();
        let resolved = topology.surface(surface)?;
        Some(SurfaceStatus {
            surface,
            version: resolved.version,
            revision: topology.revision,
            warp_error: resolved.warp(&self.warp_cache).err().map(|e| e.to_string()),
        })
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Installation and calibration
        .route("/api/info", get(get_info))
        .route("/api/installation", get(get_installation))
        .route("/api/calibration", get(get_calibration))
        .route(
            "/api/calibration/surface/:surface/point/:corner",
            post(update_point),
        )
        .route("/api/calibration/surface/:surface/reset", post(reset_surface))
        .route("/api/calibration/save", post(save_calibration))
        // Tracking input
        .route("/api/head", get(get_head).post(set_head))
        // Frame output
        .route("/api/frame", get(get_frame))
        .route("/api/frame/stream", get(frame_stream))
        .route("/api/projectors", get(get_projectors))
        .route("/api/preview/:display", get(get_preview))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control API listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    surfaces: usize,
    screens: usize,
    projectors: usize,
    displays: usize,
    revision: u64,
    fps: u32,
    frame: u64,
    cached_warps: usize,
}

/// Get system information
async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let topology = state.topology();
    let (surfaces, screens, fps) = {
        let config = state.config.read();
        (config.surfaces.len(), config.screens.len(), config.render.fps)
    };

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        surfaces,
        screens,
        projectors: topology.projectors().len(),
        displays: topology.display_count(),
        revision: topology.revision,
        fps,
        frame: state.latest_frame().sequence,
        cached_warps: state.warp_cache().len(),
    })
}

/// Current installation as JSON
async fn get_installation(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.read().clone())
}

/// API response for calibration data
#[derive(Serialize)]
struct CalibrationResponse {
    revision: u64,
    points: Vec<VertexPoint>,
}

/// Get current calibration
async fn get_calibration(State(state): State<Arc<AppState>>) -> Json<CalibrationResponse> {
    let points = vertex_points(&state.config.read());

    Json(CalibrationResponse {
        revision: state.topology().revision,
        points,
    })
}

#[derive(Deserialize)]
struct PointUpdate {
    x: f64,
    y: f64,
}

/// Outcome of a calibration change for one surface
#[derive(Serialize, Deserialize)]
struct SurfaceStatus {
    surface: usize,
    version: u64,
    revision: u64,
    /// Set when the surface can no longer be warped
    warp_error: Option<String>,
}

/// Move a single vertex
async fn update_point(
    State(state): State<Arc<AppState>>,
    Path((surface, corner)): Path<(usize, usize)>,
    Json(point): Json<PointUpdate>,
) -> impl IntoResponse {
    let rebuilt = {
        let mut config = state.config.write();
        if !update_vertex(&mut config, surface, corner, point.x, point.y) {
            return (StatusCode::NOT_FOUND, "Unknown vertex").into_response();
        }
        state.rebuild_topology_with(&config)
    };

    surface_response(&state, surface, rebuilt)
}

/// Reset a surface's vertices to the full output
async fn reset_surface(
    State(state): State<Arc<AppState>>,
    Path(surface): Path<usize>,
) -> impl IntoResponse {
    let rebuilt = {
        let mut config = state.config.write();
        if !reset_vertices(&mut config, surface) {
            return (StatusCode::NOT_FOUND, "Unknown surface").into_response();
        }
        state.rebuild_topology_with(&config)
    };

    surface_response(&state, surface, rebuilt)
}

fn surface_response(
    state: &AppState,
    surface: usize,
    rebuilt: Result<()>,
) -> axum::response::Response {
    if let Err(e) = rebuilt {
        tracing::error!("Failed to rebuild topology: {:#}", e);
        return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
    }

    match state.surface_status(surface) {
        Some(status) => {
            if let Some(reason) = &status.warp_error {
                tracing::warn!("Surface {} cannot be warped: {}", surface, reason);
            }
            Json(status).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Unknown surface").into_response(),
    }
}

/// Save calibration to file
async fn save_calibration(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.save_config() {
        Ok(_) => (StatusCode::OK, "Saved").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Frame of reference for a reported head position
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum HeadSpace {
    /// As reported by the tracker, before the sensor pose is applied
    Sensor,
    #[default]
    World,
}

#[derive(Deserialize)]
struct HeadRequest {
    x: f64,
    y: f64,
    z: f64,
    #[serde(default)]
    space: HeadSpace,
}

async fn get_head(State(state): State<Arc<AppState>>) -> Json<TrackedHead> {
    Json(state.head())
}

/// Feed a tracked head position
async fn set_head(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeadRequest>,
) -> impl IntoResponse {
    if !(req.x.is_finite() && req.y.is_finite() && req.z.is_finite()) {
        return (StatusCode::BAD_REQUEST, "Head position must be finite").into_response();
    }

    let head = match req.space {
        HeadSpace::World => TrackedHead::new(req.x, req.y, req.z),
        HeadSpace::Sensor => state
            .topology()
            .head_from_sensor(Vector3::new(req.x, req.y, req.z)),
    };
    state.set_head(head);

    Json(head).into_response()
}

/// Latest published frame
async fn get_frame(State(state): State<Arc<AppState>>) -> Json<FrameOutput> {
    Json(FrameOutput::clone(&state.latest_frame()))
}

/// Cameras of the physical projectors
async fn get_projectors(State(state): State<Arc<AppState>>) -> Json<Vec<ProjectorFrame>> {
    let topology = state.topology();
    let projectors: Vec<ProjectorFrame> = topology
        .projectors()
        .iter()
        .filter_map(|rig| match compute_projector(rig) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("Projector on display {} left out: {}", rig.display + 1, e);
                None
            }
        })
        .collect();

    Json(projectors)
}

/// Newline-delimited JSON stream of published frames
async fn frame_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100), // ~10 fps for monitoring
    ))
    .map(move |_| -> Result<Vec<u8>, serde_json::Error> {
        let frame = state.latest_frame();
        let mut line = serde_json::to_vec(&*frame)?;
        line.push(b'\n');
        Ok(line)
    });

    let body = Body::from_stream(stream);

    ([(header::CONTENT_TYPE, "application/x-ndjson")], body)
}

/// Warp preview of a display (PNG). Displays are numbered from 1.
async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(display): Path<usize>,
) -> impl IntoResponse {
    let Some(index) = display.checked_sub(1) else {
        return (StatusCode::BAD_REQUEST, "Displays are numbered from 1").into_response();
    };

    let topology = state.topology();
    if index >= topology.display_count() {
        return (StatusCode::NOT_FOUND, "Unknown display").into_response();
    }

    let (width, height) = {
        let config = state.config.read();
        (config.render.preview_width, config.render.preview_height)
    };

    let encoded = tokio::task::spawn_blocking(move || {
        encode_png(&render_display_preview(&topology, index, width, height))
    })
    .await;

    match encoded {
        Ok(Ok(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::compute_frame;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(name: &str) -> Arc<AppState> {
        let path = std::env::temp_dir()
            .join(format!("cavewarp-server-{}-{}", name, std::process::id()))
            .join("cavewarp.toml");
        let config = Arc::new(RwLock::new(Config::default()));
        Arc::new(AppState::new(config, path).unwrap())
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_info() {
        let state = test_state("info");
        let (status, body) = send(&state, get("/api/info")).await;
        assert_eq!(status, StatusCode::OK);

        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["surfaces"], 2);
        assert_eq!(info["screens"], 1);
        assert_eq!(info["projectors"], 2);
        assert_eq!(info["displays"], 3);
        assert_eq!(info["revision"], 0);
    }

    #[tokio::test]
    async fn test_installation() {
        let state = test_state("installation");
        let (status, body) = send(&state, get("/api/installation")).await;
        assert_eq!(status, StatusCode::OK);

        let config: Config = serde_json::from_slice(&body).unwrap();
        assert_eq!(config.surfaces, Config::default().surfaces);
    }

    #[tokio::test]
    async fn test_calibration_points() {
        let state = test_state("calibration");
        let (status, body) = send(&state, get("/api/calibration")).await;
        assert_eq!(status, StatusCode::OK);

        let calibration: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(calibration["points"].as_array().unwrap().len(), 8);
        assert_eq!(calibration["points"][1]["label"], "Top Right");
    }

    #[tokio::test]
    async fn test_update_point_rebuilds_topology() {
        let state = test_state("update");
        let (status, body) = send(
            &state,
            post_json(
                "/api/calibration/surface/1/point/2",
                serde_json::json!({"x": 0.9, "y": 1.4}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let result: SurfaceStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(result.revision, 1);
        assert_eq!(result.version, 1);
        assert!(result.warp_error.is_none());

        let corner = state.config.read().surfaces[1].vertices.corners[2];
        assert_eq!((corner.x, corner.y), (0.9, 1.0));
        assert_eq!(state.topology().surface(0).unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_degenerate_update_reports_warp_error() {
        let state = test_state("degenerate");
        let (status, body) = send(
            &state,
            post_json(
                "/api/calibration/surface/0/point/1",
                serde_json::json!({"x": 0.5, "y": 0.5}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let result: SurfaceStatus = serde_json::from_slice(&body).unwrap();
        assert!(result.warp_error.unwrap().contains("degenerate"));

        // Reset brings the surface back
        let (status, body) = send(
            &state,
            post_json("/api/calibration/surface/0/reset", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result: SurfaceStatus = serde_json::from_slice(&body).unwrap();
        assert!(result.warp_error.is_none());
        assert_eq!(result.version, 2);
    }

    #[tokio::test]
    async fn test_unknown_vertex() {
        let state = test_state("unknown");
        let (status, _) = send(
            &state,
            post_json(
                "/api/calibration/surface/4/point/0",
                serde_json::json!({"x": 0.5, "y": 0.5}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.topology().revision, 0);
    }

    #[tokio::test]
    async fn test_set_head() {
        let state = test_state("head");
        let (status, _) = send(
            &state,
            post_json("/api/head", serde_json::json!({"x": 0.5, "y": 1.2, "z": -0.3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.head(), TrackedHead::new(0.5, 1.2, -0.3));

        state.config.write().kave_scale = 2.0;
        let config = state.config.read().clone();
        state.rebuild_topology_with(&config).unwrap();

        let (status, body) = send(
            &state,
            post_json(
                "/api/head",
                serde_json::json!({"x": 0.5, "y": 1.0, "z": 0.25, "space": "sensor"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let head: TrackedHead = serde_json::from_slice(&body).unwrap();
        assert_eq!(head, TrackedHead::new(1.0, 2.0, 0.5));
        assert_eq!(state.head(), head);
    }

    #[tokio::test]
    async fn test_latest_frame() {
        let state = test_state("frame");
        let topology = state.topology();
        let frame = compute_frame(&topology, state.warp_cache(), state.head(), topology.clip, 3);
        state.publish_frame(frame);

        let (status, body) = send(&state, get("/api/frame")).await;
        assert_eq!(status, StatusCode::OK);

        let frame: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(frame["sequence"], 3);
        assert_eq!(frame["surfaces"].as_array().unwrap().len(), 3);
        assert_eq!(frame["surfaces"][2]["kind"], "screen");
        assert_eq!(frame["surfaces"][0]["projection"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_projectors() {
        let state = test_state("projectors");
        let (status, body) = send(&state, get("/api/projectors")).await;
        assert_eq!(status, StatusCode::OK);

        let projectors: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let projectors = projectors.as_array().unwrap();
        assert_eq!(projectors.len(), 2);
        assert_eq!(projectors[0]["display"], 0);
        assert_eq!(projectors[0]["surfaces"], serde_json::json!([0]));
        assert_eq!(projectors[1]["view"].as_array().unwrap().len(), 4);
        assert_eq!(projectors[1]["projection"][3][2], -1.0);
    }

    #[tokio::test]
    async fn test_preview_png() {
        let state = test_state("preview");
        state.config.write().render.preview_width = 64;
        state.config.write().render.preview_height = 36;

        let response = router(state.clone()).oneshot(get("/api/preview/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let image = image::load_from_memory(&body).unwrap();
        assert_eq!((image.width(), image.height()), (64, 36));

        let (status, _) = send(&state, get("/api/preview/0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&state, get("/api/preview/9")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_frame_stream_headers() {
        let state = test_state("stream");
        let response = router(state).oneshot(get("/api/frame/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");
    }

    #[tokio::test]
    async fn test_save() {
        let state = test_state("save");
        let (status, _) = send(
            &state,
            post_json("/api/calibration/save", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.config_path.exists());

        let saved = Config::load_or_create(&state.config_path).unwrap();
        assert_eq!(saved.surfaces, state.config.read().surfaces);
        let _ = std::fs::remove_dir_all(state.config_path.parent().unwrap());
    }
}
