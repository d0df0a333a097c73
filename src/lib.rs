//! Price Pusher Library
//!
//! Multi-source price aggregation and signed publishing for oracle feeds

pub mod config;
pub mod error;
pub mod oracle;
pub mod publisher;
pub mod pusher;
pub mod telemetry;
pub mod types;
