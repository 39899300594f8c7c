use {
    crate::{
        namespace::{
            CreateMode, Namespace, NamespaceError, SessionEvent, Stat, Watch, WatchEventType,
            WatchedEvent,
        },
        paths, Revision, SessionId, Version,
    },
    async_trait::async_trait,
    std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        sync::{
            atomic::{AtomicBool, AtomicI64, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
    },
    tokio::sync::{broadcast, oneshot},
    tracing::{debug, info},
};

struct MemNode {
    data: Vec<u8>,
    stat: Stat,
    next_sequence: u64,
    children: BTreeSet<String>,
}

impl MemNode {
    fn new(data: Vec<u8>, stat: Stat) -> Self {
        Self {
            data,
            stat,
            next_sequence: 0,
            children: BTreeSet::new(),
        }
    }
}

struct Registration {
    owner: SessionId,
    tx: oneshot::Sender<WatchedEvent>,
}

#[derive(Default)]
struct ServerState {
    zxid: Revision,
    next_session_id: SessionId,
    nodes: BTreeMap<String, MemNode>,
    // Exists and data watches.
    data_watches: HashMap<String, Vec<Registration>>,
    child_watches: HashMap<String, Vec<Registration>>,
}

fn fire(watches: &mut HashMap<String, Vec<Registration>>, path: &str, event: WatchedEvent) {
    if let Some(registrations) = watches.remove(path) {
        for registration in registrations {
            let _ = registration.tx.send(event.clone());
        }
    }
}

impl ServerState {
    fn node(&self, path: &str) -> Result<&MemNode, NamespaceError> {
        self.nodes
            .get(path)
            .ok_or_else(|| NamespaceError::NoNode(path.to_string()))
    }

    fn register(
        watches: &mut HashMap<String, Vec<Registration>>,
        owner: SessionId,
        path: &str,
    ) -> Watch {
        let (tx, watch) = Watch::channel(path);
        watches
            .entry(path.to_string())
            .or_default()
            .push(Registration { owner, tx });
        watch
    }

    fn create(
        &mut self,
        owner: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, NamespaceError> {
        paths::validate_path(path)?;
        let parent_path = paths::parent_of(path).ok_or_else(|| NamespaceError::NodeExists(path.to_string()))?;
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| NamespaceError::NoNode(path.to_string()))?;
        if parent.stat.ephemeral_owner.is_some() {
            return Err(NamespaceError::NoChildrenForEphemerals(path.to_string()));
        }
        let actual = if mode.is_sequential() {
            let sequence = parent.next_sequence;
            parent.next_sequence += 1;
            paths::format_sequence(path, sequence)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(NamespaceError::NodeExists(actual));
        }
        self.zxid += 1;
        let stat = Stat {
            version: 0,
            create_revision: self.zxid,
            mod_revision: self.zxid,
            ephemeral_owner: mode.is_ephemeral().then_some(owner),
            data_length: data.len(),
        };
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(paths::node_from_path(&actual));
        }
        self.nodes
            .insert(actual.clone(), MemNode::new(data.clone(), stat.clone()));
        fire(
            &mut self.data_watches,
            &actual,
            WatchedEvent::new(WatchEventType::NodeCreated, &actual).with_node(data, stat),
        );
        fire(
            &mut self.child_watches,
            &parent_path,
            WatchedEvent::new(WatchEventType::NodeChildrenChanged, &parent_path),
        );
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: Option<Version>) -> Result<(), NamespaceError> {
        paths::validate_path(path)?;
        if path == "/" {
            return Err(NamespaceError::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be deleted",
            });
        }
        let node = self.node(path)?;
        if version.is_some_and(|v| v != node.stat.version) {
            return Err(NamespaceError::BadVersion(path.to_string()));
        }
        if !node.children.is_empty() {
            return Err(NamespaceError::NotEmpty(path.to_string()));
        }
        self.remove(path);
        Ok(())
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.zxid += 1;
        let (parent_path, name) = paths::split_path(path);
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.remove(&name);
        }
        fire(
            &mut self.data_watches,
            path,
            WatchedEvent::new(WatchEventType::NodeDeleted, path),
        );
        fire(
            &mut self.child_watches,
            path,
            WatchedEvent::new(WatchEventType::NodeDeleted, path),
        );
        fire(
            &mut self.child_watches,
            &parent_path,
            WatchedEvent::new(WatchEventType::NodeChildrenChanged, &parent_path),
        );
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> Result<Stat, NamespaceError> {
        paths::validate_path(path)?;
        let zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| NamespaceError::NoNode(path.to_string()))?;
        if version.is_some_and(|v| v != node.stat.version) {
            return Err(NamespaceError::BadVersion(path.to_string()));
        }
        self.zxid = zxid;
        node.stat.version += 1;
        node.stat.mod_revision = zxid;
        node.stat.data_length = data.len();
        node.data = data.clone();
        let stat = node.stat.clone();
        fire(
            &mut self.data_watches,
            path,
            WatchedEvent::new(WatchEventType::NodeDataChanged, path).with_node(data, stat.clone()),
        );
        Ok(stat)
    }

    fn expire_session(&mut self, session_id: SessionId) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove(path);
        }
        // Watches of an expired session are lost.
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for registrations in watches.values_mut() {
                registrations.retain(|r| r.owner != session_id);
            }
            watches.retain(|_, registrations| !registrations.is_empty());
        }
        owned.len()
    }
}

///
/// In-process coordination service.
///
/// Nodes follow the usual hierarchical rules: the root `/` always exists, a node can only be
/// created under an existing parent and ephemeral nodes cannot have children.
///
/// Cloning is cheap, clones share the same tree.
///
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut state = ServerState {
            next_session_id: 1,
            ..Default::default()
        };
        state
            .nodes
            .insert("/".to_string(), MemNode::new(Vec::new(), Stat::default()));
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_session_id(&self) -> SessionId {
        let mut state = self.lock();
        let id = state.next_session_id;
        state.next_session_id += 1;
        id
    }

    ///
    /// Opens a new session.
    ///
    pub fn connect(&self) -> MemorySession {
        let (events_tx, _) = broadcast::channel(64);
        MemorySession {
            shared: Arc::new(SessionShared {
                server: self.clone(),
                session_id: AtomicI64::new(self.new_session_id()),
                suspended: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events_tx,
            }),
        }
    }

    ///
    /// Current revision, incremented by every write.
    ///
    pub fn revision(&self) -> Revision {
        self.lock().zxid
    }
}

struct SessionShared {
    server: MemoryServer,
    session_id: AtomicI64,
    suspended: AtomicBool,
    closed: AtomicBool,
    events_tx: broadcast::Sender<SessionEvent>,
}

///
/// One session against a [`MemoryServer`].
///
/// Clones share the session, so a test can keep a clone to drive [`MemorySession::suspend`],
/// [`MemorySession::resume`] and [`MemorySession::expire`] while a [`crate::Client`] uses another.
///
#[derive(Clone)]
pub struct MemorySession {
    shared: Arc<SessionShared>,
}

impl MemorySession {
    fn check(&self) -> Result<SessionId, NamespaceError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(NamespaceError::SessionExpired);
        }
        if self.shared.suspended.load(Ordering::Acquire) {
            return Err(NamespaceError::ConnectionLoss);
        }
        Ok(self.shared.session_id.load(Ordering::Acquire))
    }

    fn server(&self) -> MutexGuard<'_, ServerState> {
        self.shared.server.lock()
    }

    ///
    /// Interrupts the connection: operations fail with [`NamespaceError::ConnectionLoss`] until
    /// [`MemorySession::resume`]. Ephemeral nodes survive.
    ///
    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::AcqRel) {
            debug!("session {} suspended", self.session_id());
            let _ = self.shared.events_tx.send(SessionEvent::Disconnected);
        }
    }

    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::AcqRel) {
            debug!("session {} resumed", self.session_id());
            let _ = self
                .shared
                .events_tx
                .send(SessionEvent::Connected(self.session_id()));
        }
    }

    ///
    /// Expires the session: its ephemeral nodes are deleted and its watches dropped, then the
    /// connection comes back on a fresh session.
    ///
    pub fn expire(&self) {
        let old = self.shared.session_id.load(Ordering::Acquire);
        let removed = self.server().expire_session(old);
        info!("session {old} expired, {removed} ephemeral nodes deleted");
        let _ = self.shared.events_tx.send(SessionEvent::Expired);
        let new = self.shared.server.new_session_id();
        self.shared.session_id.store(new, Ordering::Release);
        self.shared.suspended.store(false, Ordering::Release);
        let _ = self.shared.events_tx.send(SessionEvent::Connected(new));
    }

    ///
    /// Ends the session for good. Every later operation fails with [`NamespaceError::SessionExpired`].
    ///
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.shared.session_id.load(Ordering::Acquire);
        self.server().expire_session(id);
        let _ = self.shared.events_tx.send(SessionEvent::Expired);
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Namespace for MemorySession {
    fn session_id(&self) -> SessionId {
        self.shared.session_id.load(Ordering::Acquire)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, NamespaceError> {
        let owner = self.check()?;
        self.server().create(owner, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<Version>) -> Result<(), NamespaceError> {
        self.check()?;
        self.server().delete(path, version)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, NamespaceError> {
        self.check()?;
        paths::validate_path(path)?;
        Ok(self.server().nodes.get(path).map(|node| node.stat.clone()))
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), NamespaceError> {
        self.check()?;
        paths::validate_path(path)?;
        let state = self.server();
        let node = state.node(path)?;
        Ok((node.data.clone(), node.stat.clone()))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> Result<Stat, NamespaceError> {
        self.check()?;
        self.server().set_data(path, data, version)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, NamespaceError> {
        self.check()?;
        paths::validate_path(path)?;
        let state = self.server();
        Ok(state.node(path)?.children.iter().cloned().collect())
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watch), NamespaceError> {
        let owner = self.check()?;
        paths::validate_path(path)?;
        let mut state = self.server();
        let stat = state.nodes.get(path).map(|node| node.stat.clone());
        let watch = ServerState::register(&mut state.data_watches, owner, path);
        Ok((stat, watch))
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watch), NamespaceError> {
        let owner = self.check()?;
        paths::validate_path(path)?;
        let mut state = self.server();
        let (data, stat) = {
            let node = state.node(path)?;
            (node.data.clone(), node.stat.clone())
        };
        let watch = ServerState::register(&mut state.data_watches, owner, path);
        Ok((data, stat, watch))
    }

    async fn get_children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), NamespaceError> {
        let owner = self.check()?;
        paths::validate_path(path)?;
        let mut state = self.server();
        let children = state.node(path)?.children.iter().cloned().collect();
        let watch = ServerState::register(&mut state.child_watches, owner, path);
        Ok((children, watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_nodes_should_get_increasing_suffixes() {
        let server = MemoryServer::new();
        let session = server.connect();
        session
            .create("/locks", Vec::new(), CreateMode::Persistent)
            .await
            .expect("create failed");
        let first = session
            .create("/locks/lock-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .expect("create failed");
        let second = session
            .create("/locks/lock-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .expect("create failed");
        assert_eq!(first, "/locks/lock-0000000000");
        assert_eq!(second, "/locks/lock-0000000001");
    }

    #[tokio::test]
    async fn create_should_follow_hierarchy_rules() {
        let server = MemoryServer::new();
        let session = server.connect();
        let err = session
            .create("/a/b", Vec::new(), CreateMode::Persistent)
            .await
            .expect_err("parent is missing");
        assert!(matches!(err, NamespaceError::NoNode(_)));
        session
            .create("/e", Vec::new(), CreateMode::Ephemeral)
            .await
            .expect("create failed");
        let err = session
            .create("/e/child", Vec::new(), CreateMode::Persistent)
            .await
            .expect_err("ephemeral parent");
        assert!(matches!(err, NamespaceError::NoChildrenForEphemerals(_)));
        let err = session
            .create("/e", Vec::new(), CreateMode::Ephemeral)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, NamespaceError::NodeExists(_)));
    }

    #[tokio::test]
    async fn delete_should_check_version_and_children() {
        let server = MemoryServer::new();
        let session = server.connect();
        session
            .create("/p", Vec::new(), CreateMode::Persistent)
            .await
            .expect("create failed");
        session
            .create("/p/c", Vec::new(), CreateMode::Persistent)
            .await
            .expect("create failed");
        assert!(matches!(
            session.delete("/p", None).await,
            Err(NamespaceError::NotEmpty(_))
        ));
        assert!(matches!(
            session.delete("/p/c", Some(3)).await,
            Err(NamespaceError::BadVersion(_))
        ));
        session.delete("/p/c", Some(0)).await.expect("delete failed");
        session.delete("/p", None).await.expect("delete failed");
        assert!(matches!(
            session.delete("/p", None).await,
            Err(NamespaceError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn exists_watch_should_fire_on_creation_with_snapshot() {
        let server = MemoryServer::new();
        let session = server.connect();
        let (stat, watch) = session.exists_watch("/n").await.expect("watch failed");
        assert!(stat.is_none());
        session
            .create("/n", b"v1".to_vec(), CreateMode::Persistent)
            .await
            .expect("create failed");
        let event = watch.await;
        assert_eq!(event.event_type, WatchEventType::NodeCreated);
        let (data, stat) = event.node.expect("snapshot");
        assert_eq!(data, b"v1".to_vec());
        assert_eq!(stat.version, 0);
    }

    #[tokio::test]
    async fn child_watch_should_fire_once() {
        let server = MemoryServer::new();
        let session = server.connect();
        let (children, watch) = session.get_children_watch("/").await.expect("watch failed");
        assert!(children.is_empty());
        session
            .create("/a", Vec::new(), CreateMode::Persistent)
            .await
            .expect("create failed");
        session
            .create("/b", Vec::new(), CreateMode::Persistent)
            .await
            .expect("create failed");
        let event = watch.await;
        assert_eq!(event.event_type, WatchEventType::NodeChildrenChanged);
        assert_eq!(event.path, "/");
    }

    #[tokio::test]
    async fn suspended_session_should_fail_with_connection_loss() {
        let server = MemoryServer::new();
        let session = server.connect();
        let mut events = session.session_events();
        session.suspend();
        assert!(matches!(
            session.exists("/").await,
            Err(NamespaceError::ConnectionLoss)
        ));
        session.resume();
        assert!(session.exists("/").await.expect("exists failed").is_some());
        assert_eq!(events.recv().await.ok(), Some(SessionEvent::Disconnected));
        assert_eq!(
            events.recv().await.ok(),
            Some(SessionEvent::Connected(session.session_id()))
        );
    }

    #[tokio::test]
    async fn expire_should_delete_ephemerals_and_drop_watches() {
        let server = MemoryServer::new();
        let session = server.connect();
        let other = server.connect();
        session
            .create("/e", Vec::new(), CreateMode::Ephemeral)
            .await
            .expect("create failed");
        let (_, own_watch) = session.exists_watch("/unrelated").await.expect("watch failed");
        let (_, other_watch) = other.exists_watch("/e").await.expect("watch failed");
        let old_id = session.session_id();

        session.expire();

        assert_ne!(session.session_id(), old_id);
        assert!(other.exists("/e").await.expect("exists failed").is_none());
        assert_eq!(other_watch.await.event_type, WatchEventType::NodeDeleted);
        assert_eq!(own_watch.await.event_type, WatchEventType::Dropped);
    }
}
