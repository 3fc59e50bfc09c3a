//! Protobuf messages framing every artifact that crosses the trust boundary.
//!
//! The message definitions live in `protocol.proto`; `generated.rs` holds the
//! corresponding `prost` types.

#[allow(clippy::all)]
mod generated;

pub use generated::*;
