//! Proxy surface: classify, capture and forward
//!
//! Captured exchanges buffer the request, forward it, and tee the response
//! body into a capture record while it streams to the client. Finished
//! records go to a [`CaptureRecorder`](crate::capture::CaptureRecorder),
//! which never blocks the exchange.

pub mod client;
pub mod error_response;
pub mod headers;
pub mod hot_path;
pub mod middleware;
pub mod service;
pub mod streaming;
pub mod tunnel;
pub mod types;
pub mod url_resolver;


pub use hot_path::ForwardingEngine;
pub use service::{serve, ProxyService};
pub use types::{ProxyConfig, ProxyError, ProxyResult};
pub use url_resolver::UpstreamResolver;
