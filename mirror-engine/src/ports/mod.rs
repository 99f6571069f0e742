//! Interfaces to the engine's external collaborators.
//!
//! - [`StateStore`] - persistence of the per-machine [`SyncRecord`](crate::record::SyncRecord)
//! - [`Notifier`] - fire-and-forget user notifications
//! - [`ProcessProbe`] - whether the data-owning application is running
//! - [`Clock`] - current time, replaceable in tests

pub mod notifier;
pub mod probe;
pub mod state_store;

pub use notifier::{Notification, NotificationLevel, Notifier, NullNotifier};
pub use probe::{Clock, ProcessProbe, SystemClock};
pub use state_store::{MemoryStateStore, StateStore};
