pub mod event_log;
pub mod index;
pub mod state;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use index::RedbStateStore;
pub use state::{MemoryStateStore, StateError, StateStore};
