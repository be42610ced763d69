//! Transport orchestrator: one actix-web HTTP server and one tonic gRPC
//! server over the same [`AppState`], started and stopped together.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use actix_web::dev::Server as HttpServerHandle;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server as GrpcServer;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

use crate::grpc::{
    ClientInfoGrpc, CorrelationIdInterceptor, VideoStreamGrpc, MAX_DECODING_MESSAGE_SIZE,
    MAX_ENCODING_MESSAGE_SIZE,
};
use crate::handlers;
use crate::proto::video::client_info_service_server::ClientInfoServiceServer;
use crate::proto::video::video_stream_service_server::VideoStreamServiceServer;
use crate::routing::{ProxyDispatch, RouteTable};
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build proxy client: {0}")]
    ProxyClient(#[from] reqwest::Error),

    #[error("HTTP server error: {0}")]
    Http(#[source] io::Error),

    #[error("gRPC server error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("server task failed: {0}")]
    Join(#[from] JoinError),
}

/// Both listeners bound, nothing served yet.
pub struct Gateway {
    http: HttpServerHandle,
    grpc_listener: TcpListener,
    http_addr: SocketAddr,
    grpc_addr: SocketAddr,
    state: AppState,
}

impl Gateway {
    pub async fn bind(state: AppState) -> Result<Self, ServeError> {
        let server_cfg = state.config.server.clone();

        let http_bind = server_cfg.http_addr();
        let http_listener = std::net::TcpListener::bind(&http_bind).map_err(|source| {
            ServeError::Bind {
                addr: http_bind.clone(),
                source,
            }
        })?;
        let http_addr = http_listener
            .local_addr()
            .map_err(|source| ServeError::Bind {
                addr: http_bind.clone(),
                source,
            })?;

        let grpc_bind = server_cfg.grpc_addr();
        let grpc_listener = TcpListener::bind(&grpc_bind)
            .await
            .map_err(|source| ServeError::Bind {
                addr: grpc_bind.clone(),
                source,
            })?;
        let grpc_addr = grpc_listener
            .local_addr()
            .map_err(|source| ServeError::Bind {
                addr: grpc_bind.clone(),
                source,
            })?;

        let proxy = ProxyDispatch::new(RouteTable::from_backends(&state.config.backends))?
            .max_body_size(state.config.proxy.max_body_size);
        let app_state = web::Data::new(state.clone());

        let mut server = HttpServer::new(move || {
            App::new()
                .wrap(proxy.clone())
                .wrap(Logger::default())
                .wrap(TracingLogger::default())
                .app_data(app_state.clone())
                .configure(handlers::configure)
        })
        .shutdown_timeout(server_cfg.shutdown_timeout.as_secs())
        .disable_signals();
        if let Some(workers) = server_cfg.workers {
            server = server.workers(workers);
        }

        let http = server
            .listen(http_listener)
            .map_err(|source| ServeError::Bind {
                addr: http_bind,
                source,
            })?
            .run();

        Ok(Self {
            http,
            grpc_listener,
            http_addr,
            grpc_addr,
            state,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    /// Serve until `shutdown` resolves or either server exits, then drain both.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            http,
            grpc_listener,
            http_addr,
            grpc_addr,
            state,
        } = self;
        let drain = state.config.server.shutdown_timeout;

        let sweeper = state.rate_limiter.spawn_sweeper();

        let http_handle = http.handle();
        let http_task = tokio::spawn(async move {
            http.await.map_err(|e| {
                error!(error = %e, "HTTP server failed");
                ServeError::Http(e)
            })
        });

        let (grpc_stop_tx, grpc_stop_rx) = oneshot::channel::<()>();
        let grpc_task = tokio::spawn(async move {
            serve_grpc(grpc_listener, state, grpc_stop_rx)
                .await
                .map_err(|e| {
                    error!(error = %e, "gRPC server failed");
                    ServeError::Grpc(e)
                })
        });

        info!(http = %http_addr, grpc = %grpc_addr, "Gateway listening");

        // stop(true) is bounded by the server's shutdown_timeout
        let stop_http = async move { http_handle.stop(true).await };
        let result = supervise(shutdown, http_task, stop_http, grpc_task, grpc_stop_tx, drain).await;

        sweeper.abort();
        info!("Gateway stopped");

        result
    }
}

/// Wait for the shutdown future or the first loop exit, then stop whichever
/// loops are still running. A loop's own error wins over a clean stop.
async fn supervise<F, S>(
    shutdown: F,
    mut http_task: JoinHandle<Result<(), ServeError>>,
    stop_http: S,
    mut grpc_task: JoinHandle<Result<(), ServeError>>,
    stop_grpc: oneshot::Sender<()>,
    drain: Duration,
) -> Result<(), ServeError>
where
    F: Future<Output = ()>,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut http_exit: Option<Result<(), ServeError>> = None;
    let mut grpc_exit: Option<Result<(), ServeError>> = None;

    tokio::select! {
        _ = &mut shutdown => {
            info!("Shutdown signal received");
        }
        res = &mut http_task => {
            warn!("HTTP server exited");
            http_exit = Some(joined(res));
        }
        res = &mut grpc_task => {
            warn!("gRPC server exited");
            grpc_exit = Some(joined(res));
        }
    }

    let http_done = async {
        match http_exit {
            Some(res) => res,
            None => {
                stop_http.await;
                joined(http_task.await)
            }
        }
    };
    let grpc_done = async {
        match grpc_exit {
            Some(res) => res,
            None => {
                let _ = stop_grpc.send(());
                match tokio::time::timeout(drain, &mut grpc_task).await {
                    Ok(res) => joined(res),
                    Err(_) => {
                        warn!(
                            timeout_secs = drain.as_secs(),
                            "gRPC drain deadline passed, closing remaining streams"
                        );
                        grpc_task.abort();
                        Ok(())
                    }
                }
            }
        }
    };
    let (http_res, grpc_res) = tokio::join!(http_done, grpc_done);

    http_res.and(grpc_res)
}

fn joined(res: Result<Result<(), ServeError>, JoinError>) -> Result<(), ServeError> {
    match res {
        Ok(res) => res,
        Err(e) => Err(ServeError::Join(e)),
    }
}

async fn serve_grpc(
    listener: TcpListener,
    state: AppState,
    stop: oneshot::Receiver<()>,
) -> Result<(), tonic::transport::Error> {
    let (mut health, health_service) = tonic_health::server::health_reporter();
    health
        .set_serving::<VideoStreamServiceServer<VideoStreamGrpc>>()
        .await;
    health
        .set_serving::<ClientInfoServiceServer<ClientInfoGrpc>>()
        .await;

    let video = VideoStreamServiceServer::new(VideoStreamGrpc::new(state.streams.clone()))
        .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_ENCODING_MESSAGE_SIZE);
    let clients = ClientInfoServiceServer::new(ClientInfoGrpc::new(state.clients.clone()))
        .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_ENCODING_MESSAGE_SIZE);

    GrpcServer::builder()
        .add_service(health_service)
        .add_service(InterceptedService::new(video, CorrelationIdInterceptor))
        .add_service(InterceptedService::new(clients, CorrelationIdInterceptor))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            let _ = stop.await;
        })
        .await
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
