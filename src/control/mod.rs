//! Control-plane server: authenticated TLS framed-message RPC used to
//! remotely inspect and drive the agent.

pub mod allowlist;
pub mod auth;
pub mod framing;
pub mod server;

pub use framing::{ControlCodec, Frame, FrameType};
pub use server::ControlServer;
