//! tracerun - a local capture proxy for LLM API traffic
//!
//! A child process is pointed at the proxy (through its base URL or
//! `HTTP_PROXY`). Every call to a recognised provider is forwarded unchanged,
//! captured into a [`capture::CaptureRecord`], shown on the dashboard and
//! shipped to a trace store by a non-blocking logging pipeline.

pub mod application;
pub mod capture;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod proxy;

pub use application::{Application, RunningProxy};
pub use error::{Error, Result};
