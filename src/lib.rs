///
/// The coordination service contract every recipe is written against.
///
pub mod namespace;

///
/// Path helpers: joining, splitting, validation, sequence suffixes and namespacing.
///
pub mod paths;

///
/// Session connection state tracking.
///
pub mod state;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Client handle shared by the recipes.
///
pub mod client;

///
/// Errors surfaced by the recipes, and the checks to classify them.
///
pub mod error;

///
/// Utiltities for inter-task communication
///
pub mod sync;

///
/// Locally cached views of a node or of the children of a node, kept current through watches.
///
pub mod cache;

///
/// Provides an API over a distributed, reentrant, fair mutex
///
pub mod lock;

///
/// Leader election among contenders of a path.
///
/// A leader keeps leadership while its [`leader::LeaderSelectorListener`] callback runs.
///
pub mod leader;

///
/// Single and double barriers.
///
pub mod barrier;

///
/// Distributed counters built on conditional writes.
///
pub mod atomic;

///
/// etcd implementation of [`namespace::Namespace`].
///
pub mod etcd;

///
/// In-process implementation of [`namespace::Namespace`], with controls to simulate
/// connection suspension and session expiry.
///
pub mod memory;

///
/// Alias for a service-wide revision
pub type Revision = i64;

///
/// Alias for a per-node data version
pub type Version = i64;

///
/// Alias for a session id
pub type SessionId = i64;

pub use {
    client::Client,
    error::{Error, Result},
    namespace::{CreateMode, Namespace, NamespaceError, Stat, Watch, WatchEventType, WatchKind, WatchedEvent},
    retry::RetryPolicy,
    state::{ConnectionState, ConnectionStateTracker},
};
