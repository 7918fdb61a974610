//! Round-robin accept-and-echo server.
//!
//! A demonstration server built on the `listener` and `reactor` crates: one
//! reactor thread owns the listening sockets and dispatches accepted
//! connections round-robin to worker reactors, each of which echoes bytes
//! back to its clients.

pub mod config;
pub mod echo;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod signal;
pub mod workers;

pub use config::Config;
pub use server::run;
