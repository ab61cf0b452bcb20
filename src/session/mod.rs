//! Session persistence and renewal.
//!
//! A [`SessionManager`] owns the single persisted [`SessionInfo`] for this
//! client, decides whether it is still inside the validity window, and runs
//! the periodic renewal timer. Storage goes through the [`SessionStore`] port.

pub mod manager;
pub mod metadata;
pub mod persistence;


pub use manager::*;
pub use metadata::*;
pub use persistence::*;
