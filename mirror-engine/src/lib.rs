//! Mirror Engine - snapshot synchronization into a shared folder
//!
//! Copies a local application data directory into timestamped snapshots
//! inside a folder shared by several machines (usually a cloud-synced
//! folder). Machines coordinate through lock marker files in that folder,
//! and each machine keeps a bounded number of its own snapshots.

pub mod error;
pub mod fs;
pub mod lock;
pub mod log_buffer;
pub mod naming;
pub mod orchestrator;
pub mod ports;
pub mod record;
pub mod retention;
pub mod status;
pub mod trigger;

pub use error::{FilesystemError, Result, Severity, SyncError};
pub use fs::{FileSystemGateway, LocalFileSystem};
pub use lock::{LockCoordinator, LockMarker};
pub use log_buffer::{LogBuffer, LogEntry};
pub use naming::MachineId;
pub use orchestrator::{AttemptOutcome, EngineSettings, SyncDeps, SyncOrchestrator, SyncReport};
pub use record::{SyncRecord, SyncStatus};
pub use retention::{BackupSnapshot, RetentionManager};
pub use status::StatusSnapshot;
pub use trigger::{LifecycleEvent, Trigger, TriggerFeed, TriggerLoop};
