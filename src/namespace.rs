use {
    super::{Revision, SessionId, Version},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
    },
    thiserror::Error,
    tokio::sync::{broadcast, oneshot},
};

///
/// How a node is created.
///
/// Sequential modes append a ten digit, zero padded counter to the requested name.
/// The counter is assigned by the service and strictly increases among siblings.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

///
/// Metadata of a namespace node.
///
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    /// Per-node data version, the compare step of every conditional write.
    pub version: Version,
    /// Service-wide revision at which the node was created.
    pub create_revision: Revision,
    /// Service-wide revision of the last modification of the node.
    pub mod_revision: Revision,
    /// Owning session of an ephemeral node.
    pub ephemeral_owner: Option<SessionId>,
    pub data_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Fires on creation, data change or deletion. Can be armed on an absent node.
    Exists,
    /// Fires on data change or deletion. Requires the node to exist.
    Data,
    /// Fires when an immediate child is added or removed, or when the node itself is deleted.
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The registration was lost before anything fired, the watcher must re-check by itself.
    Dropped,
}

///
/// One-shot notification delivered by a [`Watch`].
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: WatchEventType,
    pub path: String,
    /// Node content observed when the watch fired, when the backend knows it.
    pub node: Option<(Vec<u8>, Stat)>,
}

impl WatchedEvent {
    pub fn new(event_type: WatchEventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
            node: None,
        }
    }

    pub fn with_node(mut self, data: Vec<u8>, stat: Stat) -> Self {
        self.node = Some((data, stat));
        self
    }
}

///
/// A one-shot watch registration.
///
/// Resolves exactly once, with the first relevant change after the read it was armed with.
/// If the backend loses the registration the watch resolves to [`WatchEventType::Dropped`].
///
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchedEvent>,
    strip_prefix: Option<String>,
}

impl Watch {
    pub fn new(path: impl Into<String>, rx: oneshot::Receiver<WatchedEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
            strip_prefix: None,
        }
    }

    ///
    /// Creates a registration and the sender a backend fires it with.
    ///
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<WatchedEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::new(path, rx))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn strip_namespace(mut self, prefix: &str) -> Self {
        self.path = crate::paths::unfix_for_namespace(prefix, &self.path);
        self.strip_prefix = Some(prefix.to_string());
        self
    }
}

impl Future for Watch {
    type Output = WatchedEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(mut event)) => {
                if let Some(prefix) = self.strip_prefix.as_deref() {
                    event.path = crate::paths::unfix_for_namespace(prefix, &event.path);
                }
                Poll::Ready(event)
            }
            Poll::Ready(Err(_)) => Poll::Ready(WatchedEvent::new(
                WatchEventType::Dropped,
                self.path.clone(),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

///
/// Raw session lifecycle notifications surfaced by a backend.
///
/// See [`crate::state::ConnectionStateTracker`] for how they are classified.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is (again) usable. Carries the session id, which changes after an expiry.
    Connected(SessionId),
    /// The connection is interrupted, the session may still be alive on the service.
    Disconnected,
    /// The session is gone together with its ephemeral nodes.
    Expired,
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("no node: {0}")]
    NoNode(String),
    #[error("bad version: {0}")]
    BadVersion(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("ephemeral nodes cannot have children: {0}")]
    NoChildrenForEphemerals(String),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("connection loss")]
    ConnectionLoss,
    #[error("operation timeout")]
    OperationTimeout,
    #[error("session expired")]
    SessionExpired,
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl NamespaceError {
    ///
    /// Transient errors are caused by outside forces, retrying the same operation may succeed.
    ///
    pub fn is_transient(&self) -> bool {
        match self {
            NamespaceError::ConnectionLoss | NamespaceError::OperationTimeout => true,
            NamespaceError::Etcd(e) => crate::retry::is_transient(e),
            _ => false,
        }
    }
}

///
/// The coordination service as seen by the recipes.
///
/// Every `*_watch` operation reads and arms a one-shot watch atomically: the returned [`Watch`]
/// fires for the first change after the returned value, never for a change that is already part of it.
///
#[async_trait]
pub trait Namespace: Send + Sync + 'static {
    ///
    /// Id of the session ephemeral nodes are currently created under.
    ///
    fn session_id(&self) -> SessionId;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    ///
    /// Returns the actual path of the created node, which differs from `path` in sequential modes.
    ///
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, NamespaceError>;

    async fn delete(&self, path: &str, version: Option<Version>) -> Result<(), NamespaceError>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>, NamespaceError>;

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), NamespaceError>;

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> Result<Stat, NamespaceError>;

    ///
    /// Names, not paths, of the immediate children.
    ///
    async fn get_children(&self, path: &str) -> Result<Vec<String>, NamespaceError>;

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watch), NamespaceError>;

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watch), NamespaceError>;

    async fn get_children_watch(&self, path: &str)
        -> Result<(Vec<String>, Watch), NamespaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_should_resolve_to_fired_event() {
        let (tx, watch) = Watch::channel("/a");
        tx.send(WatchedEvent::new(WatchEventType::NodeDeleted, "/a"))
            .expect("send failed");
        let event = watch.await;
        assert_eq!(event.event_type, WatchEventType::NodeDeleted);
        assert_eq!(event.path, "/a");
    }

    #[tokio::test]
    async fn watch_should_resolve_to_dropped_if_registration_is_lost() {
        let (tx, watch) = Watch::channel("/a");
        drop(tx);
        let event = watch.await;
        assert_eq!(event.event_type, WatchEventType::Dropped);
        assert_eq!(event.path, "/a");
    }

    #[tokio::test]
    async fn watch_should_strip_client_namespace_from_event_path() {
        let (tx, watch) = Watch::channel("/app/a");
        let watch = watch.strip_namespace("/app");
        assert_eq!(watch.path(), "/a");
        tx.send(WatchedEvent::new(WatchEventType::NodeCreated, "/app/a"))
            .expect("send failed");
        assert_eq!(watch.await.path, "/a");
    }

    #[test]
    fn connection_loss_is_transient_but_protocol_errors_are_not() {
        assert!(NamespaceError::ConnectionLoss.is_transient());
        assert!(NamespaceError::OperationTimeout.is_transient());
        assert!(!NamespaceError::NodeExists("/a".into()).is_transient());
        assert!(!NamespaceError::BadVersion("/a".into()).is_transient());
        assert!(!NamespaceError::SessionExpired.is_transient());
    }
}
