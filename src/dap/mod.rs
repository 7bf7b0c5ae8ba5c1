//! Debug Adapter Protocol plumbing: message envelopes, framing, traffic tracing and the
//! request/event client.

pub mod client;
pub mod protocol;
pub mod tracer;
pub mod transport;
