//! Persistent event log.
//!
//! [`Database`] owns the SQLite connection and schema, [`EventStore`] is the
//! append-only per-session log on top of it, and [`EventRecorder`] assigns
//! the strictly increasing sequence numbers the store requires.

mod db;
mod events;
mod recorder;

pub use db::{blocking, Database};
pub use events::{EventStore, FROM_START};
pub use recorder::EventRecorder;

pub(crate) use db::is_unique_violation;
pub(crate) use events::{format_ts, parse_ts};
