//! Edge gateway: HTTP + gRPC ingress for video ingestion and client
//! bookkeeping, plus path-based reverse proxying to backend services.

pub mod config;
pub mod error;
pub mod grpc;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
pub use server::{shutdown_signal, Gateway, ServeError};
pub use state::AppState;

pub mod proto {
    pub mod video {
        pub mod v1 {
            tonic::include_proto!("gateway.video.v1");
        }
        pub use v1::*;
    }

    /// protobuf `bytes` fields travel as base64 text in JSON.
    pub mod base64_bytes {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S, T>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
            T: AsRef<[u8]>,
        {
            serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom)
        }
    }
}
