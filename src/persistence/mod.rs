/// Data persistence: world snapshots and backups
///
/// The world store is the only caller; saves therefore never overlap.

pub mod snapshot;

// Re-export commonly used types
pub use snapshot::{SnapshotStore, Snapshotter};
