//! Path-based dispatch: local routes, reverse-proxy routes with a suffix
//! override, and the JSON translation handlers as the catch-all.

pub mod proxy;
pub mod table;

pub use proxy::{ProxyDispatch, ProxyError};
pub use table::{Backend, Dispatch, RouteTable};
