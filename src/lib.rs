pub mod codec;
pub mod config;
pub mod error;
pub mod latency;
pub mod net;
pub mod processing;
pub mod session;
pub mod status;
pub mod terminal_colors;
pub mod tracing;
