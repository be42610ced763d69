//! Stream lifecycle and per-stream statistics.
//!
//! Streams and their stats live in one table behind one `RwLock`; a stats
//! record is inserted and removed together with its stream and never on its
//! own. Identity lookups always happen with the lock released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use grpc_clients::{IdentityClient, IdentityError};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::metrics;
use crate::proto::video::{
    ActiveStream, ApiResponse, SendFrameRequest, StartStreamRequest, StartStreamResponse,
    StopStreamRequest, StreamStats, VideoFrame,
};

pub const DEFAULT_WIDTH: i32 = 1920;
pub const DEFAULT_HEIGHT: i32 = 1080;
pub const AUTO_CREATED_CAMERA: &str = "auto_created";

const FRAME_SOURCE: &str = "video_service";
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Aggregate view across every tracked stream.
#[derive(Debug, Clone, Serialize)]
pub struct TotalStats {
    pub active_streams: usize,
    pub total_frames: i64,
    pub total_bytes: i64,
    /// Mean of the per-stream averages
    pub average_fps: f64,
    pub timestamp: i64,
}

struct StatsEntry {
    stats: StreamStats,
    opened_at: Instant,
    window_start: Instant,
    window_frames: u32,
}

impl StatsEntry {
    fn new(stream: &ActiveStream, codec: &str) -> Self {
        let now = Instant::now();
        Self {
            stats: StreamStats {
                stream_id: stream.stream_id.clone(),
                client_id: stream.client_id.clone(),
                start_time: stream.started_at,
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                codec: codec.to_string(),
                is_recording: stream.is_recording,
                is_streaming: stream.is_streaming,
                ..Default::default()
            },
            opened_at: now,
            window_start: now,
            window_frames: 0,
        }
    }

    fn record(&mut self, frame: &VideoFrame, now: Instant) {
        let stats = &mut self.stats;
        stats.frames_received += 1;
        stats.bytes_received += frame.frame_data.len() as i64;
        if frame.width > 0 {
            stats.width = frame.width;
        }
        if frame.height > 0 {
            stats.height = frame.height;
        }

        let elapsed = now.duration_since(self.opened_at).as_secs() as i64;
        stats.duration = elapsed;
        stats.average_fps = if elapsed > 0 {
            stats.frames_received as f64 / elapsed as f64
        } else {
            0.0
        };

        self.window_frames += 1;
        let window = now.duration_since(self.window_start);
        if window >= FPS_WINDOW {
            stats.current_fps = f64::from(self.window_frames) / window.as_secs_f64();
            self.window_start = now;
            self.window_frames = 0;
        }
    }
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<String, ActiveStream>,
    stats: HashMap<String, StatsEntry>,
}

impl StreamTable {
    /// Returns false if the id is already taken.
    fn insert_if_absent(&mut self, stream: ActiveStream, codec: &str) -> bool {
        if self.streams.contains_key(&stream.stream_id) {
            return false;
        }
        let entry = StatsEntry::new(&stream, codec);
        self.stats.insert(stream.stream_id.clone(), entry);
        self.streams.insert(stream.stream_id.clone(), stream);
        true
    }

    fn remove(&mut self, stream_id: &str) -> Option<(ActiveStream, StreamStats)> {
        let stream = self.streams.remove(stream_id)?;
        let stats = self.stats.remove(stream_id).map(|e| e.stats).unwrap_or_default();
        Some((stream, stats))
    }

    fn record_frame(&mut self, stream_id: &str, frame: &VideoFrame) -> Option<StreamStats> {
        let entry = self.stats.get_mut(stream_id)?;
        entry.record(frame, Instant::now());
        Some(entry.stats.clone())
    }
}

pub struct StreamEngine {
    table: RwLock<StreamTable>,
    identity: Arc<dyn IdentityClient>,
    default_codec: String,
}

impl StreamEngine {
    pub fn new(identity: Arc<dyn IdentityClient>, default_codec: impl Into<String>) -> Self {
        Self {
            table: RwLock::new(StreamTable::default()),
            identity,
            default_codec: default_codec.into(),
        }
    }

    pub async fn start_stream(&self, req: StartStreamRequest) -> Result<StartStreamResponse> {
        if req.client_id.is_empty() {
            return Err(AppError::InvalidArgument("client_id is required".to_string()));
        }

        let user_name = self.resolve_user_name(&req.client_id).await.map_err(|e| {
            warn!(client_id = %req.client_id, error = %e, "Identity check failed on stream start");
            AppError::from(e)
        })?;

        let stream_id = generate_stream_id(&req.client_id);
        let stream = ActiveStream {
            stream_id: stream_id.clone(),
            client_id: req.client_id.clone(),
            user_name,
            camera_name: req.camera_name,
            filename: req.filename,
            is_recording: true,
            is_streaming: true,
            started_at: Utc::now().timestamp(),
        };

        let active = {
            let mut table = self.table.write().await;
            if !table.insert_if_absent(stream, &self.default_codec) {
                return Err(AppError::Internal(format!(
                    "stream id {} already in use",
                    stream_id
                )));
            }
            table.streams.len()
        };
        metrics::set_active_streams(active);

        info!(stream_id = %stream_id, client_id = %req.client_id, "Stream started");

        Ok(StartStreamResponse {
            message: format!("Stream {} started", stream_id),
            stream_id,
            status: "started".to_string(),
        })
    }

    /// Unary frame submission; `user_name` falls back to the client id.
    pub async fn send_frame(&self, req: SendFrameRequest) -> Result<ApiResponse> {
        let user_name = if req.user_name.is_empty() {
            req.client_id.clone()
        } else {
            req.user_name
        };
        self.ingest_frame(&req.stream_id, &req.client_id, &user_name, req.frame)
            .await
    }

    /// Apply one frame, provisioning the stream first if the id is unknown.
    ///
    /// Identity failures during provisioning come back as `status: "error"`
    /// inside an `Ok` so a sender's loop keeps running.
    pub async fn ingest_frame(
        &self,
        stream_id: &str,
        client_id: &str,
        user_name: &str,
        frame: Option<VideoFrame>,
    ) -> Result<ApiResponse> {
        if stream_id.is_empty() && client_id.is_empty() {
            return Err(AppError::InvalidArgument(
                "stream_id or client_id is required".to_string(),
            ));
        }

        let stream_id = if stream_id.is_empty() {
            generate_stream_id(client_id)
        } else {
            stream_id.to_string()
        };

        let Some(frame) = frame else {
            return Ok(soft_error(&stream_id, client_id, "frame is required".to_string()));
        };

        let existing = {
            let mut table = self.table.write().await;
            table.record_frame(&stream_id, &frame)
        };

        let stats = match existing {
            Some(stats) => stats,
            None => {
                info!(stream_id = %stream_id, client_id = %client_id, "Auto-creating stream");

                let resolved = match self.resolve_user_name(client_id).await {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(stream_id = %stream_id, client_id = %client_id, error = %e, "User validation failed");
                        return Ok(soft_error(
                            &stream_id,
                            client_id,
                            format!("User validation failed: {}", e),
                        ));
                    }
                };
                let user_name = if resolved.is_empty() {
                    user_name.to_string()
                } else {
                    resolved
                };

                let stream = ActiveStream {
                    stream_id: stream_id.clone(),
                    client_id: client_id.to_string(),
                    user_name,
                    camera_name: AUTO_CREATED_CAMERA.to_string(),
                    filename: String::new(),
                    is_recording: true,
                    is_streaming: true,
                    started_at: Utc::now().timestamp(),
                };

                let (stats, provisioned, active) = {
                    let mut table = self.table.write().await;
                    // A concurrent frame may have provisioned the same id meanwhile.
                    let provisioned = table.insert_if_absent(stream, &self.default_codec);
                    let stats = table.record_frame(&stream_id, &frame);
                    (stats, provisioned, table.streams.len())
                };
                if provisioned {
                    metrics::record_auto_provisioned();
                    metrics::set_active_streams(active);
                }
                // The stream can only vanish here if it was stopped between the two lock scopes.
                stats.ok_or_else(|| AppError::NotFound(format!("stream {}", stream_id)))?
            }
        };

        debug!(
            stream_id = %stream_id,
            client_id = %client_id,
            frame_size = frame.frame_data.len(),
            total_frames = stats.frames_received,
            total_bytes = stats.bytes_received,
            "Frame received"
        );

        let metadata = HashMap::from([
            ("stream_id".to_string(), stream_id.clone()),
            ("client_id".to_string(), client_id.to_string()),
            ("frame_id".to_string(), frame.frame_id.clone()),
            ("frames_received".to_string(), stats.frames_received.to_string()),
            ("bytes_received".to_string(), stats.bytes_received.to_string()),
            ("source".to_string(), FRAME_SOURCE.to_string()),
        ]);

        Ok(ApiResponse {
            status: "ok".to_string(),
            message: "Frame received".to_string(),
            timestamp: Utc::now().timestamp(),
            metadata,
        })
    }

    /// Idempotent: stopping an unknown stream is a no-op.
    pub async fn stop_stream(&self, req: StopStreamRequest) -> ApiResponse {
        let (removed, active) = {
            let mut table = self.table.write().await;
            let removed = table.remove(&req.stream_id);
            (removed, table.streams.len())
        };
        metrics::set_active_streams(active);

        let end_time = if req.end_time > 0 {
            req.end_time
        } else {
            Utc::now().timestamp()
        };

        let (file_size, filename) = match &removed {
            Some((stream, stats)) => {
                info!(
                    stream_id = %req.stream_id,
                    frames = stats.frames_received,
                    bytes = stats.bytes_received,
                    "Stream stopped"
                );
                let size = if req.file_size > 0 {
                    req.file_size
                } else {
                    stats.bytes_received
                };
                let name = if req.filename.is_empty() {
                    stream.filename.clone()
                } else {
                    req.filename.clone()
                };
                (size, name)
            }
            None => {
                debug!(stream_id = %req.stream_id, "Stop requested for unknown stream");
                (req.file_size, req.filename.clone())
            }
        };

        let metadata = HashMap::from([
            ("stream_id".to_string(), req.stream_id.clone()),
            ("client_id".to_string(), req.client_id.clone()),
            ("end_time".to_string(), end_time.to_string()),
            ("file_size".to_string(), file_size.to_string()),
            ("filename".to_string(), filename),
        ]);

        ApiResponse {
            status: "ok".to_string(),
            message: format!("Stream {} stopped", req.stream_id),
            timestamp: Utc::now().timestamp(),
            metadata,
        }
    }

    pub async fn get_stream_stats(&self, stream_id: &str) -> Result<StreamStats> {
        let table = self.table.read().await;
        table
            .stats
            .get(stream_id)
            .map(|entry| entry.stats.clone())
            .ok_or_else(|| AppError::NotFound(format!("stream {}", stream_id)))
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<ActiveStream> {
        let table = self.table.read().await;
        table
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("stream {}", stream_id)))
    }

    pub async fn get_all_active_streams(&self) -> Vec<ActiveStream> {
        let table = self.table.read().await;
        table
            .streams
            .values()
            .filter(|s| s.is_recording || s.is_streaming)
            .cloned()
            .collect()
    }

    pub async fn get_all_stats(&self) -> Vec<StreamStats> {
        let table = self.table.read().await;
        table.stats.values().map(|e| e.stats.clone()).collect()
    }

    pub async fn get_streams_by_client(&self, client_id: &str) -> Vec<ActiveStream> {
        let table = self.table.read().await;
        table
            .streams
            .values()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect()
    }

    pub async fn get_stats_by_client(&self, client_id: &str) -> Vec<StreamStats> {
        let table = self.table.read().await;
        table
            .stats
            .values()
            .filter(|e| e.stats.client_id == client_id)
            .map(|e| e.stats.clone())
            .collect()
    }

    pub async fn get_total_stats(&self) -> TotalStats {
        let table = self.table.read().await;
        let active_streams = table.stats.len();
        let (total_frames, total_bytes, fps_sum) =
            table
                .stats
                .values()
                .fold((0i64, 0i64, 0f64), |(frames, bytes, fps), e| {
                    (
                        frames + e.stats.frames_received,
                        bytes + e.stats.bytes_received,
                        fps + e.stats.average_fps,
                    )
                });

        TotalStats {
            active_streams,
            total_frames,
            total_bytes,
            average_fps: if active_streams > 0 {
                fps_sum / active_streams as f64
            } else {
                0.0
            },
            timestamp: Utc::now().timestamp(),
        }
    }

    async fn resolve_user_name(&self, client_id: &str) -> std::result::Result<String, IdentityError> {
        let user = self.identity.get_user_by_client_id(client_id).await?;

        if let Err(e) = self.identity.get_streaming_config(&user.id).await {
            warn!(client_id = %client_id, error = %e, "Streaming config lookup failed");
        }

        Ok(if user.username.is_empty() {
            client_id.to_string()
        } else {
            user.username
        })
    }
}

/// `stream_<client_id>_<unix nanos>`
pub fn generate_stream_id(client_id: &str) -> String {
    let now = Utc::now();
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
    format!("stream_{}_{}", client_id, nanos)
}

fn soft_error(stream_id: &str, client_id: &str, message: String) -> ApiResponse {
    ApiResponse {
        status: "error".to_string(),
        message,
        timestamp: Utc::now().timestamp(),
        metadata: HashMap::from([
            ("stream_id".to_string(), stream_id.to_string()),
            ("client_id".to_string(), client_id.to_string()),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grpc_clients::{StreamingConfig, StubIdentityClient, UserInfo};

    struct UnavailableIdentity;

    #[async_trait]
    impl IdentityClient for UnavailableIdentity {
        async fn get_user_by_client_id(
            &self,
            _client_id: &str,
        ) -> std::result::Result<UserInfo, IdentityError> {
            Err(IdentityError::Rpc(tonic::Status::unavailable("user-service down")))
        }

        async fn get_streaming_config(
            &self,
            _user_id: &str,
        ) -> std::result::Result<StreamingConfig, IdentityError> {
            Err(IdentityError::Rpc(tonic::Status::unavailable("user-service down")))
        }

        async fn health_check(&self) -> std::result::Result<(), IdentityError> {
            Err(IdentityError::Rpc(tonic::Status::unavailable("user-service down")))
        }

        async fn close(&self) -> std::result::Result<(), IdentityError> {
            Ok(())
        }
    }

    fn engine() -> StreamEngine {
        StreamEngine::new(Arc::new(StubIdentityClient::new()), "H.264")
    }

    fn frame(bytes: &[u8], width: i32, height: i32) -> VideoFrame {
        VideoFrame {
            frame_id: "f1".to_string(),
            frame_data: bytes.to_vec(),
            width,
            height,
            format: "jpeg".to_string(),
            ..Default::default()
        }
    }

    fn start_request(client_id: &str, camera: &str) -> StartStreamRequest {
        StartStreamRequest {
            client_id: client_id.to_string(),
            camera_name: camera.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn started_stream_is_visible() {
        let engine = engine();
        let resp = engine.start_stream(start_request("c1", "cam1")).await.unwrap();

        assert_eq!(resp.status, "started");
        let suffix = resp.stream_id.strip_prefix("stream_c1_").unwrap();
        assert!(!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()));

        let stream = engine.get_stream(&resp.stream_id).await.unwrap();
        assert_eq!(stream.client_id, "c1");
        assert_eq!(stream.camera_name, "cam1");
        assert_eq!(stream.user_name, "user_c1");
        assert!(stream.is_recording && stream.is_streaming);

        let stats = engine.get_stream_stats(&resp.stream_id).await.unwrap();
        assert_eq!(stats.frames_received, 0);
        assert_eq!((stats.width, stats.height), (1920, 1080));
        assert_eq!(stats.codec, "H.264");
        assert_eq!(stats.average_fps, 0.0);
    }

    #[tokio::test]
    async fn start_fails_hard_when_identity_unavailable() {
        let engine = StreamEngine::new(Arc::new(UnavailableIdentity), "H.264");
        let err = engine.start_stream(start_request("c1", "cam1")).await.unwrap_err();

        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(engine.get_all_active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn start_requires_client_id() {
        let err = engine().start_stream(start_request("", "cam1")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn frame_for_unknown_stream_auto_provisions() {
        let engine = engine();
        let resp = engine
            .ingest_frame("s-new", "c1", "cam-user", Some(frame(b"abcde", 0, 0)))
            .await
            .unwrap();

        assert_eq!(resp.status, "ok");
        assert_eq!(resp.metadata["frames_received"], "1");
        assert_eq!(resp.metadata["source"], "video_service");

        let stream = engine.get_stream("s-new").await.unwrap();
        assert_eq!(stream.camera_name, AUTO_CREATED_CAMERA);
        assert_eq!(stream.user_name, "user_c1");

        let stats = engine.get_stream_stats("s-new").await.unwrap();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.bytes_received, 5);
    }

    #[tokio::test]
    async fn auto_provision_identity_failure_is_soft() {
        let engine = StreamEngine::new(Arc::new(UnavailableIdentity), "H.264");
        let resp = engine
            .ingest_frame("s-new", "c1", "", Some(frame(b"abc", 0, 0)))
            .await
            .unwrap();

        assert_eq!(resp.status, "error");
        assert!(resp.message.starts_with("User validation failed"));
        assert!(engine.get_stream_stats("s-new").await.is_err());
    }

    #[tokio::test]
    async fn empty_stream_id_generates_one() {
        let engine = engine();
        let resp = engine
            .send_frame(SendFrameRequest {
                client_id: "c1".to_string(),
                frame: Some(frame(b"...", 640, 480)),
                ..Default::default()
            })
            .await
            .unwrap();

        let stream_id = &resp.metadata["stream_id"];
        assert!(stream_id.starts_with("stream_c1_"));

        let stats = engine.get_stream_stats(stream_id).await.unwrap();
        assert_eq!((stats.width, stats.height), (640, 480));
    }

    #[tokio::test]
    async fn missing_ids_are_invalid() {
        let err = engine()
            .ingest_frame("", "", "", Some(frame(b"x", 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_frame_is_soft_error() {
        let resp = engine().ingest_frame("s1", "c1", "", None).await.unwrap();
        assert_eq!(resp.status, "error");
        assert_eq!(resp.message, "frame is required");
    }

    #[tokio::test]
    async fn stop_removes_stream_and_stats() {
        let engine = engine();
        let id = engine
            .start_stream(start_request("c1", "cam1"))
            .await
            .unwrap()
            .stream_id;
        engine
            .ingest_frame(&id, "c1", "", Some(frame(b"1234", 0, 0)))
            .await
            .unwrap();

        let resp = engine
            .stop_stream(StopStreamRequest {
                stream_id: id.clone(),
                client_id: "c1".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.metadata["file_size"], "4");

        assert!(matches!(
            engine.get_stream_stats(&id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(engine
            .get_all_active_streams()
            .await
            .iter()
            .all(|s| s.stream_id != id));

        // second stop is a no-op
        let again = engine
            .stop_stream(StopStreamRequest {
                stream_id: id,
                ..Default::default()
            })
            .await;
        assert_eq!(again.status, "ok");
    }

    #[tokio::test]
    async fn concurrent_frames_are_not_lost() {
        let engine = Arc::new(engine());
        let id = engine
            .start_stream(start_request("c1", "cam1"))
            .await
            .unwrap()
            .stream_id;

        let n = 200;
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let engine = engine.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .ingest_frame(&id, "c1", "", Some(frame(b"xy", 0, 0)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = engine.get_stream_stats(&id).await.unwrap();
        assert_eq!(stats.frames_received, n as i64);
        assert_eq!(stats.bytes_received, 2 * n as i64);
    }

    #[tokio::test]
    async fn concurrent_auto_provision_creates_one_stream() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .ingest_frame("shared", "c1", "", Some(frame(b"z", 0, 0)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().status, "ok");
        }

        assert_eq!(engine.get_all_active_streams().await.len(), 1);
        let stats = engine.get_stream_stats("shared").await.unwrap();
        assert_eq!(stats.frames_received, 20);
    }

    #[test]
    fn average_fps_follows_elapsed_seconds() {
        let stream = ActiveStream {
            stream_id: "s".to_string(),
            ..Default::default()
        };
        let mut entry = StatsEntry::new(&stream, "H.264");
        let opened = entry.opened_at;

        entry.record(&frame(b"a", 0, 0), opened);
        assert_eq!(entry.stats.average_fps, 0.0);

        for _ in 0..9 {
            entry.record(&frame(b"a", 0, 0), opened + Duration::from_secs(2));
        }
        assert_eq!(entry.stats.frames_received, 10);
        assert_eq!(entry.stats.duration, 2);
        assert_eq!(entry.stats.average_fps, 5.0);
        assert!(entry.stats.current_fps > 0.0);
    }

    #[tokio::test]
    async fn aggregates_by_client_and_total() {
        let engine = engine();
        engine
            .ingest_frame("a", "c1", "", Some(frame(b"1234", 0, 0)))
            .await
            .unwrap();
        engine
            .ingest_frame("b", "c1", "", Some(frame(b"12", 0, 0)))
            .await
            .unwrap();
        engine
            .ingest_frame("c", "c2", "", Some(frame(b"1", 0, 0)))
            .await
            .unwrap();

        assert_eq!(engine.get_streams_by_client("c1").await.len(), 2);
        assert_eq!(engine.get_stats_by_client("c2").await.len(), 1);
        assert_eq!(engine.get_all_stats().await.len(), 3);

        let total = engine.get_total_stats().await;
        assert_eq!(total.active_streams, 3);
        assert_eq!(total.total_frames, 3);
        assert_eq!(total.total_bytes, 7);
    }
}
