use {
    super::{CacheLoop, CachedEntry, Wake},
    crate::{
        client::Client,
        error::{Error, Result},
        namespace::{Watch, WatchEventType, WatchedEvent},
        sync::listeners::{ListenerHandle, Listenable, Subscription},
        Revision,
    },
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    tokio::{sync::watch, task::JoinHandle},
    tracing::{debug, trace, warn},
};

#[derive(Debug, Clone)]
pub enum NodeCacheEvent {
    /// The node appeared.
    Created(CachedEntry),
    /// The node content changed.
    Changed(CachedEntry),
    /// The node was deleted. Carries its path.
    Deleted(String),
    /// First population done, only emitted when started without building the initial state.
    Initialized,
    /// A refresh failed past the retry policy. The cached state is left untouched.
    Error(Arc<Error>),
}

#[derive(Default)]
struct NodeState {
    entry: Option<CachedEntry>,
    // Highest mod revision delivered so far.
    last_revision: Revision,
}

struct Shared {
    client: Client,
    path: String,
    state: RwLock<NodeState>,
    listeners: Listenable<NodeCacheEvent>,
}

impl Shared {
    fn apply(&self, update: Option<CachedEntry>) {
        let event = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match update {
                Some(entry) if entry.stat.mod_revision <= state.last_revision => None,
                Some(entry) => {
                    state.last_revision = entry.stat.mod_revision;
                    let event = if state.entry.is_some() {
                        NodeCacheEvent::Changed(entry.clone())
                    } else {
                        NodeCacheEvent::Created(entry.clone())
                    };
                    state.entry = Some(entry);
                    Some(event)
                }
                None => state
                    .entry
                    .take()
                    .map(|_| NodeCacheEvent::Deleted(self.path.clone())),
            }
        };
        if let Some(event) = event {
            trace!("node cache on {} emits {event:?}", self.path);
            self.listeners.emit(event);
        }
    }

    fn apply_fired(&self, event: WatchedEvent) {
        match event.event_type {
            WatchEventType::NodeCreated | WatchEventType::NodeDataChanged => {
                if let Some((data, stat)) = event.node {
                    self.apply(Some(CachedEntry::new(&self.path, Some(data), stat)));
                }
            }
            WatchEventType::NodeDeleted => self.apply(None),
            WatchEventType::NodeChildrenChanged | WatchEventType::Dropped => {}
        }
    }

    // Reads the node and arms a watch matching what was read.
    async fn read_and_arm(&self) -> Result<(Option<CachedEntry>, Watch)> {
        loop {
            match self.client.get_data_watch(&self.path).await {
                Ok((data, stat, watch)) => {
                    return Ok((Some(CachedEntry::new(&self.path, Some(data), stat)), watch))
                }
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
            let (stat, watch) = self.client.exists_watch(&self.path).await?;
            if stat.is_none() {
                return Ok((None, watch));
            }
            trace!("{} created while arming its watch, reading again", self.path);
        }
    }
}

async fn run(shared: Arc<Shared>, mut cache_loop: CacheLoop, mut initialized: bool) {
    loop {
        let armed = match cache_loop.wait(shared.read_and_arm()).await {
            Wake::Fired(armed) => armed,
            Wake::Reconnected => continue,
            Wake::Closed => break,
        };
        let watch = match armed {
            Ok((entry, watch)) => {
                shared.apply(entry);
                watch
            }
            Err(e) => {
                warn!("node cache on {} failed to refresh: {e}", shared.path);
                shared.listeners.emit(NodeCacheEvent::Error(Arc::new(e)));
                match cache_loop.backoff().await {
                    Wake::Closed => break,
                    _ => continue,
                }
            }
        };
        if !initialized {
            initialized = true;
            shared.listeners.emit(NodeCacheEvent::Initialized);
        }
        match cache_loop.wait(watch).await {
            Wake::Fired(event) => shared.apply_fired(event),
            Wake::Reconnected => debug!("reconnected, refreshing node cache on {}", shared.path),
            Wake::Closed => break,
        }
    }
    trace!("node cache on {} stopped", shared.path);
}

///
/// Local mirror of one node, kept current through watches.
///
/// After each fired watch the cache applies the content carried by the event, then reads the node
/// again and re-arms its watch. Listeners see one event per distinct observed change, in order, and
/// never an older version than one already delivered.
///
/// ```no_run
/// use rust_etcd_recipes::{cache::{NodeCache, NodeCacheEvent}, Client};
///
/// # async fn run(client: Client) {
/// let cache = NodeCache::new(client, "/config");
/// let mut events = cache.subscribe();
/// cache.start(true).await.expect("failed to start cache");
/// while let Some(event) = events.recv().await {
///     if let NodeCacheEvent::Changed(entry) = event {
///         println!("config is now version {}", entry.version());
///     }
/// }
/// # }
/// ```
pub struct NodeCache {
    shared: Arc<Shared>,
    started: AtomicBool,
    closed_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeCache {
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                client,
                path: path.into(),
                state: RwLock::new(NodeState::default()),
                listeners: Listenable::new(),
            }),
            started: AtomicBool::new(false),
            closed_tx,
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    ///
    /// Starts mirroring the node.
    ///
    /// With `build_initial` the node is read before returning and no event is emitted for that
    /// read. Otherwise the first population happens in the background and is followed by
    /// [`NodeCacheEvent::Initialized`].
    ///
    pub async fn start(&self, build_initial: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("node cache"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState("node cache already started"));
        }
        let cache_loop = CacheLoop::new(&self.shared.client, self.closed_tx.subscribe());
        if build_initial {
            match self.shared.client.get_data(&self.shared.path).await {
                Ok((data, stat)) => {
                    let mut state = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
                    state.last_revision = stat.mod_revision;
                    state.entry = Some(CachedEntry::new(&self.shared.path, Some(data), stat));
                }
                Err(e) if e.is_no_node() => {}
                Err(e) => {
                    self.started.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
        let handle = tokio::spawn(run(Arc::clone(&self.shared), cache_loop, build_initial));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    ///
    /// Latest mirrored content, `None` if the node is absent. Never touches the network.
    ///
    pub fn current_data(&self) -> Option<CachedEntry> {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entry
            .clone()
    }

    pub fn add_listener<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(NodeCacheEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add_listener(handler)
    }

    pub fn subscribe(&self) -> Subscription<NodeCacheEvent> {
        self.shared.listeners.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    ///
    /// Stops re-arming watches. The last snapshot stays readable.
    ///
    pub async fn close(&self) {
        self.closed_tx.send_replace(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("node cache task failed: {e:?}");
            }
        }
    }
}
