//! IRC connection manager.
//!
//! One [`Connection`] per configured server: transport chain (proxy,
//! TLS), line codec, registration, room model, flood control and
//! reconnect policy.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod proxy;
pub mod queue;
pub mod registration;
pub mod state;
pub mod transport;

pub use channel::Channel;
pub use connection::Connection;
pub use state::ConnectionState;
