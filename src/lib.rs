//! iperf3-ffi - typed control of the iperf3 measurement engine
//!
//! This library drives libiperf, the shared library behind the `iperf3`
//! tool, from Rust. It loads the library at runtime, exposes a test's
//! configuration through typed getters and setters, and runs tests as a
//! client or server, returning each run's JSON report as a [`TestResult`].
//!
//! # Features
//!
//! - Runtime loading with a clear error when libiperf is missing
//! - Typed configuration with UDP block-size clamping and capability-gated
//!   zero-copy
//! - Capture of the report the engine prints to stdout
//! - Server runs on a worker thread, cancellable from async code
//! - Uniform results: engine failures come back as data, not as errors

pub mod capture;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod result;
pub mod server;
pub mod test_config;

pub use client::Client;
pub use config::{LoadOptions, Protocol, Role, Settings, MAX_UDP_BULKSIZE};
pub use engine::{Engine, TestPtr};
pub use error::{Error, Result};
pub use result::TestResult;
pub use server::Server;
pub use test_config::TestConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
