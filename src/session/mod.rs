//! Session management module.
//!
//! This module provides types for identifying sessions, tracking their
//! lifecycle status, and storing their metadata.

mod id;
mod repository;
mod status;

pub use id::{validate_kind, SessionId, MAX_KIND_LEN};
pub use repository::{NewSession, SessionFilter, SessionRecord, SessionRepository};
pub use status::SessionStatus;
