mod common;
mod error;
mod harness;

/// Embedded NATS server plus a client connected to it.
/// Use this to test inter-service communication without
/// running a standalone nats-server.
pub use harness::{EmbeddedNats, State};

/// Error types returned by the harness.
pub use error::{Error, Result};

// Harness config related things...
pub mod config;
pub use config::Config;

// enats env vars
pub mod env;

// Free local port allocation
pub mod port;

/// The embeddable NATS server the harness runs.
pub mod server;
