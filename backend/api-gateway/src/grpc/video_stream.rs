use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::metrics::{self, ingress};
use crate::proto::video::video_stream_service_server::VideoStreamService;
use crate::proto::video::{
    ActiveStream, ApiResponse, ChunkAck, EmptyRequest, GetAllStatsResponse, GetStreamRequest,
    GetStreamStatsRequest, GetStreamsByClientRequest, GetStreamsByClientResponse,
    SendFrameRequest, StartStreamRequest, StartStreamResponse, StopStreamRequest, StreamStats,
    VideoChunk, VideoFrame,
};
use crate::services::stream_engine::{StreamEngine, DEFAULT_HEIGHT, DEFAULT_WIDTH};

const ACK_BUFFER: usize = 64;
const GRPC_USER_NAME: &str = "gRPC Client";
const GRPC_CAMERA_ID: &str = "grpc_stream";
const PROGRESS_LOG_EVERY: i64 = 100;

pub struct VideoStreamGrpc {
    engine: Arc<StreamEngine>,
}

impl VideoStreamGrpc {
    pub fn new(engine: Arc<StreamEngine>) -> Self {
        Self { engine }
    }
}

/// Per-call bookkeeping for `StreamVideo`; dropped when the call ends.
struct IngestSession {
    stream_id: String,
    client_id: String,
    started: Instant,
    last_frame: Instant,
    frame_count: i64,
    byte_count: i64,
}

impl IngestSession {
    fn open(first: &VideoChunk, now: Instant) -> Self {
        Self {
            stream_id: first.stream_id.clone(),
            client_id: first.client_id.clone(),
            started: now,
            last_frame: now,
            frame_count: 0,
            byte_count: 0,
        }
    }
}

#[tonic::async_trait]
impl VideoStreamService for VideoStreamGrpc {
    async fn start_stream(
        &self,
        request: Request<StartStreamRequest>,
    ) -> Result<Response<StartStreamResponse>, Status> {
        let resp = self.engine.start_stream(request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    async fn send_frame(
        &self,
        request: Request<SendFrameRequest>,
    ) -> Result<Response<ApiResponse>, Status> {
        let req = request.into_inner();
        let size = req.frame.as_ref().map(|f| f.frame_data.len()).unwrap_or(0);

        let resp = self.engine.send_frame(req).await?;
        if resp.status == "ok" {
            metrics::record_frame(ingress::GRPC_UNARY, size);
        }
        Ok(Response::new(resp))
    }

    async fn stop_stream(
        &self,
        request: Request<StopStreamRequest>,
    ) -> Result<Response<ApiResponse>, Status> {
        let resp = self.engine.stop_stream(request.into_inner()).await;
        Ok(Response::new(resp))
    }

    async fn get_stream_stats(
        &self,
        request: Request<GetStreamStatsRequest>,
    ) -> Result<Response<StreamStats>, Status> {
        let stream_id = request.into_inner().stream_id;
        let stats = self.engine.get_stream_stats(&stream_id).await?;
        Ok(Response::new(stats))
    }

    async fn get_stream(
        &self,
        request: Request<GetStreamRequest>,
    ) -> Result<Response<ActiveStream>, Status> {
        let stream_id = request.into_inner().stream_id;
        let stream = self.engine.get_stream(&stream_id).await?;
        Ok(Response::new(stream))
    }

    async fn get_streams_by_client(
        &self,
        request: Request<GetStreamsByClientRequest>,
    ) -> Result<Response<GetStreamsByClientResponse>, Status> {
        let client_id = request.into_inner().client_id;
        let streams = self.engine.get_streams_by_client(&client_id).await;
        Ok(Response::new(GetStreamsByClientResponse { streams }))
    }

    async fn get_all_stats(
        &self,
        _request: Request<EmptyRequest>,
    ) -> Result<Response<GetAllStatsResponse>, Status> {
        let stats = self.engine.get_all_stats().await;

        let total_frames = stats.iter().map(|s| s.frames_received).sum();
        let total_bytes = stats.iter().map(|s| s.bytes_received).sum();
        let average_fps = if stats.is_empty() {
            0.0
        } else {
            stats.iter().map(|s| s.average_fps).sum::<f64>() / stats.len() as f64
        };

        Ok(Response::new(GetAllStatsResponse {
            stats,
            total_frames,
            total_bytes,
            average_fps,
        }))
    }

    type GetActiveStreamsStream =
        Pin<Box<dyn Stream<Item = Result<ActiveStream, Status>> + Send + 'static>>;

    async fn get_active_streams(
        &self,
        _request: Request<EmptyRequest>,
    ) -> Result<Response<Self::GetActiveStreamsStream>, Status> {
        let streams = self.engine.get_all_active_streams().await;
        let stream = tokio_stream::iter(streams.into_iter().map(Ok));
        Ok(Response::new(Box::pin(stream) as Self::GetActiveStreamsStream))
    }

    type StreamVideoStream = ReceiverStream<Result<ChunkAck, Status>>;

    async fn stream_video(
        &self,
        request: Request<Streaming<VideoChunk>>,
    ) -> Result<Response<Self::StreamVideoStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(ACK_BUFFER);
        let engine = self.engine.clone();

        tokio::spawn(run_ingest_session(engine, inbound, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn run_ingest_session<S>(
    engine: Arc<StreamEngine>,
    mut inbound: S,
    tx: mpsc::Sender<Result<ChunkAck, Status>>,
) where
    S: Stream<Item = Result<VideoChunk, Status>> + Unpin,
{
    let mut session: Option<IngestSession> = None;

    loop {
        let chunk = match inbound.next().await {
            Some(Ok(chunk)) => chunk,
            None => break,
            Some(Err(status)) => {
                warn!(code = ?status.code(), error = %status.message(), "StreamVideo receive failed");
                let _ = tx
                    .send(Err(Status::internal(format!(
                        "failed to receive video chunk: {}",
                        status.message()
                    ))))
                    .await;
                break;
            }
        };

        let received = Instant::now();
        let session = session.get_or_insert_with(|| IngestSession::open(&chunk, received));
        let size = chunk.data.len();

        let frame_id = format!("grpc_{}", session.frame_count);
        session.frame_count += 1;
        session.byte_count += size as i64;
        session.last_frame = received;

        let stream_id = if chunk.stream_id.is_empty() {
            session.stream_id.clone()
        } else {
            chunk.stream_id
        };
        let client_id = if chunk.client_id.is_empty() {
            session.client_id.clone()
        } else {
            chunk.client_id
        };

        let frame = VideoFrame {
            frame_id,
            frame_data: chunk.data,
            timestamp: if chunk.timestamp > 0 {
                chunk.timestamp
            } else {
                Utc::now().timestamp()
            },
            client_id: client_id.clone(),
            camera_id: GRPC_CAMERA_ID.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            format: "jpeg".to_string(),
            metadata: chunk.metadata,
        };

        let (status, message) = match engine
            .ingest_frame(&stream_id, &client_id, GRPC_USER_NAME, Some(frame))
            .await
        {
            Ok(resp) => {
                if session.stream_id.is_empty() {
                    if let Some(id) = resp.metadata.get("stream_id") {
                        session.stream_id = id.clone();
                    }
                }
                if resp.status == "ok" {
                    metrics::record_frame(ingress::GRPC_STREAM, size);
                }
                (resp.status, resp.message)
            }
            Err(e) => ("error".to_string(), e.to_string()),
        };

        if session.frame_count % PROGRESS_LOG_EVERY == 0 {
            debug!(
                stream_id = %session.stream_id,
                frames = session.frame_count,
                bytes = session.byte_count,
                "StreamVideo progress"
            );
        }

        let ack = ChunkAck {
            status,
            message,
            received_at: Utc::now().timestamp(),
            next_expected: session.frame_count + 1,
            processing_time_ms: received.elapsed().as_millis() as i64,
        };

        if tx.send(Ok(ack)).await.is_err() {
            debug!(stream_id = %session.stream_id, "StreamVideo client stopped reading acks");
            break;
        }
    }

    if let Some(session) = session {
        info!(
            stream_id = %session.stream_id,
            client_id = %session.client_id,
            frames = session.frame_count,
            bytes = session.byte_count,
            duration_ms = session.started.elapsed().as_millis() as u64,
            idle_ms = session.last_frame.elapsed().as_millis() as u64,
            "StreamVideo finished"
        );
    }
}
