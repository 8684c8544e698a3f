//! Session isolation and shared-state safety.
//!
//! [`store`] gives each process a private directory; [`lock`] guards the
//! files that are *not* private; [`journal`] and [`notes`] are the two
//! consumers of those primitives.

pub mod journal;
pub mod lock;
pub mod notes;
pub mod store;

pub use journal::{LogEntry, SessionJournal};
pub use lock::{atomic_write, with_lock};
pub use notes::SharedNotes;
pub use store::{new_session_id, session_directory, Session, SessionId};
