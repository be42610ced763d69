/// gRPC Clients Library
///
/// Downstream clients the gateway depends on. Today that is the identity
/// lookup against user-service, with an in-process stub used whenever the
/// real service cannot be reached at startup.
pub mod config;
pub mod identity;
pub mod stub;

pub use config::IdentityClientConfig;
pub use identity::{
    connect_identity_client, GrpcIdentityClient, IdentityClient, IdentityError, StreamingConfig,
    UserInfo,
};
pub use stub::StubIdentityClient;

// Re-export generated proto modules
pub mod proto {
    pub mod user_service {
        pub mod v1 {
            tonic::include_proto!("gateway.user.v1");
        }
        pub use v1::*;
    }
}
