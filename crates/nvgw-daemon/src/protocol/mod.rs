//! Admin protocol: framing, messages, dispatch and the server.
//!
//! The protocol stack, bottom to top:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │         Application messages             │  protobuf (messages)
//! ├──────────────────────────────────────────┤
//! │         Tag byte + framing               │  1 byte + length prefix
//! ├──────────────────────────────────────────┤
//! │         TCP (optionally mTLS)            │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Frames are 4-byte big-endian length-prefixed; the payload's first
//! byte selects the message type and the remainder is the prost-encoded
//! body. A response reuses its request's tag. Frame sizes are validated
//! before allocation.

pub mod dispatch;
pub mod error;
pub mod framing;
pub mod messages;
pub mod server;

pub use dispatch::AdminDispatcher;
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use framing::FrameCodec;
pub use server::{build_tls_acceptor, AdminServer, MtlsPaths};
