//! logdeck — realtime connection core for the log dashboard server.
//!
//! The crate owns the hard parts of the server: tracking persistent
//! WebSocket connections, routing typed messages to handlers, supervising
//! the out-of-process log-indexing worker, and tearing everything down
//! under a bounded deadline. The dashboard UI, business HTTP routes, and
//! the worker's internals live elsewhere and are treated as collaborators.

pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod supervisor;
