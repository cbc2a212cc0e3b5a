//! Application wiring: settings in, a running proxy out

pub mod app;

pub use app::{bind_first_free, Application, RunningProxy};
