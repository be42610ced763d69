pub mod client_info;
pub mod client_registry;
pub mod rate_limiter;
pub mod stream_engine;

pub use client_info::ClientInfoService;
pub use client_registry::ClientRegistry;
pub use rate_limiter::{FixedWindowLimiter, RateDecision};
pub use stream_engine::{StreamEngine, TotalStats};
