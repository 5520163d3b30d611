//! User & access database.
//!
//! Maps observed hostmasks to access handles, stores global and
//! per-channel flags, answers permission queries and merges
//! mesh-replicated updates. The database is the single writer; every
//! other component holds an `Arc<UserDb>` and reads snapshots.

mod flags;
mod hostmask;
mod store;

pub use flags::FlagSet;
pub use store::{AccessUser, UserDb};
