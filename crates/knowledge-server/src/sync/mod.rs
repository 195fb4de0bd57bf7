pub mod git_sync;
pub mod scheduler;
pub mod watcher;

pub use git_sync::{GitSyncRunner, SyncExit};
pub use scheduler::SyncScheduler;
pub use watcher::FileWatcher;
