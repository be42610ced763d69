mod common;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::Code;

use api_gateway::grpc::{ClientInfoGrpc, VideoStreamGrpc};
use api_gateway::proto::video::client_info_service_client::ClientInfoServiceClient;
use api_gateway::proto::video::client_info_service_server::ClientInfoServiceServer;
use api_gateway::proto::video::video_stream_service_client::VideoStreamServiceClient;
use api_gateway::proto::video::video_stream_service_server::VideoStreamServiceServer;
use api_gateway::proto::video::{
    ConnectionEvent, EmptyRequest, GetStreamRequest, GetStreamStatsRequest,
    GetStreamsByClientRequest, ListClientsRequest, SendFrameRequest, StartStreamRequest,
    VideoChunk, VideoFrame,
};
use common::default_state;

async fn spawn_grpc() -> SocketAddr {
    let state = default_state();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_service(VideoStreamServiceServer::new(VideoStreamGrpc::new(
                state.streams.clone(),
            )))
            .add_service(ClientInfoServiceServer::new(ClientInfoGrpc::new(
                state.clients.clone(),
            )))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // give the server a moment to start accepting
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn chunk(client_id: &str, data: &[u8]) -> VideoChunk {
    VideoChunk {
        client_id: client_id.to_string(),
        data: data.to_vec(),
        ..Default::default()
    }
}

#[tokio::test]
async fn stream_video_acks_every_chunk() {
    let addr = spawn_grpc().await;
    let mut client = VideoStreamServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    let chunks = vec![
        chunk("grpc-cam", b"aaaa"),
        chunk("grpc-cam", b"bbbbbb"),
        chunk("grpc-cam", b"cc"),
    ];
    let mut acks = client
        .stream_video(tokio_stream::iter(chunks))
        .await
        .unwrap()
        .into_inner();

    let mut next_expected = Vec::new();
    while let Some(ack) = acks.message().await.unwrap() {
        assert_eq!(ack.status, "ok");
        assert!(ack.received_at > 0);
        next_expected.push(ack.next_expected);
    }
    assert_eq!(next_expected, vec![2, 3, 4]);

    // every chunk landed on the stream provisioned by the first one
    let streams = client
        .get_streams_by_client(GetStreamsByClientRequest {
            client_id: "grpc-cam".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .streams;
    assert_eq!(streams.len(), 1);

    let stats = client
        .get_stream_stats(GetStreamStatsRequest {
            stream_id: streams[0].stream_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.bytes_received, 12);
}

#[tokio::test]
async fn unary_calls_share_engine_state() {
    let addr = spawn_grpc().await;
    let mut client = VideoStreamServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    let started = client
        .start_stream(StartStreamRequest {
            client_id: "unary-cam".to_string(),
            camera_name: "lobby".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(started.status, "started");

    let resp = client
        .send_frame(SendFrameRequest {
            stream_id: started.stream_id.clone(),
            client_id: "unary-cam".to_string(),
            frame: Some(VideoFrame {
                frame_data: vec![9; 10],
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status, "ok");

    let mut active = client
        .get_active_streams(EmptyRequest {})
        .await
        .unwrap()
        .into_inner();
    let mut ids = Vec::new();
    while let Some(stream) = active.message().await.unwrap() {
        ids.push(stream.stream_id);
    }
    assert_eq!(ids, vec![started.stream_id.clone()]);

    let all = client
        .get_all_stats(EmptyRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.total_frames, 1);
    assert_eq!(all.total_bytes, 10);
}

#[tokio::test]
async fn unknown_stream_is_not_found() {
    let addr = spawn_grpc().await;
    let mut client = VideoStreamServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    let err = client
        .get_stream(GetStreamRequest {
            stream_id: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = client
        .start_stream(StartStreamRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn client_registry_over_grpc() {
    let addr = spawn_grpc().await;
    let mut client = ClientInfoServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    for id in ["b", "a"] {
        client
            .client_connected(ConnectionEvent {
                client_id: id.to_string(),
                ip_address: "127.0.0.1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let listed = client
        .list_active_clients(ListClientsRequest { page: 0, limit: 0 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.total, 2);
    assert_eq!(listed.page, 1);
    assert_eq!(listed.limit, 20);
    let ids: Vec<_> = listed.clients.iter().map(|c| c.client_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}
