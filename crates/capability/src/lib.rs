//! Capability seams for the polling core
//!
//! The polling core never opens sockets or talks to storage itself. It is
//! handed a `Transport` that executes rendered requests and a `ResultSink`
//! that validates and stores decoded payloads. Both traits return
//! `Pin<Box<dyn Future>>` so they can be held as `Arc<dyn Transport>` and
//! `&dyn ResultSink` across polling streams.

pub mod sink;
pub mod transport;

pub use sink::{ResultSink, SinkError};
pub use transport::{HttpRequest, Transport, TransportResult};
