//! THE CORE of the autowired daemon (spec §1): the IP-claim protocol, the
//! interface reconciliation loop, and the membership-reaping watcher.
//! Everything else in this workspace is either an external collaborator
//! (`autowired-consul`, `autowired-tunnel`, `autowired-net`) or ambient
//! plumbing (`autowired-config`, `autowired-tracing`).

pub mod allocator;
pub mod daemon;
pub mod node_watcher;
pub mod peer_applier;
pub mod peer_watcher;
pub mod reaper;
pub mod reconciler;
pub mod state;

pub use allocator::{Allocator, AllocatorError};
pub use daemon::{CoreError, Daemon};
pub use node_watcher::{NodeWatcher, ReaperLockStatus};
pub use peer_applier::PeerApplier;
pub use peer_watcher::PeerWatcher;
pub use reaper::Reaper;
pub use reconciler::{Reconciler, ReconcilerError};
pub use state::DaemonState;
