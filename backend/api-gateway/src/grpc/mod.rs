//! gRPC surface over the same engine and registry the HTTP side uses.

pub mod client_info;
pub mod video_stream;

pub use client_info::ClientInfoGrpc;
pub use video_stream::VideoStreamGrpc;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use uuid::Uuid;

/// Largest inbound message (a single video chunk)
pub const MAX_DECODING_MESSAGE_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_ENCODING_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub const CORRELATION_ID_KEY: &str = "x-correlation-id";

/// Stamps a correlation id on inbound calls that arrive without one.
#[derive(Clone, Default)]
pub struct CorrelationIdInterceptor;

impl Interceptor for CorrelationIdInterceptor {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        if !req.metadata().contains_key(CORRELATION_ID_KEY) {
            let id: Result<MetadataValue<Ascii>, _> = Uuid::new_v4().to_string().parse();
            if let Ok(id) = id {
                req.metadata_mut().insert(CORRELATION_ID_KEY, id);
            }
        }
        Ok(req)
    }
}
