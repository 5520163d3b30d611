//! Bot-mesh peer service.
//!
//! Links cooperating agents over a line-framed JSON protocol with
//! challenge/response authentication: partyline chat, user-database
//! replication and channel-operation requests.

pub mod handshake;
pub mod manager;
pub mod protocol;

pub use manager::{MeshEvent, MeshManager};
pub use protocol::MeshMessage;
