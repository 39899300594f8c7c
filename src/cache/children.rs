use {
    super::{CacheLoop, CachedEntry, Wake},
    crate::{
        client::Client,
        error::{Error, Result},
        namespace::{WatchEventType, WatchedEvent},
        paths,
        sync::listeners::{ListenerHandle, Listenable, Subscription},
    },
    futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt},
    std::{
        collections::{BTreeMap, HashSet},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, PoisonError, RwLock,
        },
    },
    tokio::{sync::watch, task::JoinHandle},
    tracing::{debug, trace, warn},
};

#[derive(Debug, Clone)]
pub enum PathChildrenCacheEvent {
    ChildAdded(CachedEntry),
    ChildUpdated(CachedEntry),
    ChildRemoved(CachedEntry),
    /// Every initial child was reported, only emitted when started without building the initial state.
    Initialized,
    /// A refresh failed past the retry policy. The cached children are left untouched.
    Error(Arc<Error>),
}

struct Shared {
    client: Client,
    path: String,
    cache_data: bool,
    // Keyed by child name.
    children: RwLock<BTreeMap<String, CachedEntry>>,
    listeners: Listenable<PathChildrenCacheEvent>,
}

type DataWatch = BoxFuture<'static, (String, WatchedEvent)>;

impl Shared {
    fn child_path(&self, name: &str) -> String {
        paths::make_path(&self.path, name)
    }

    fn emit(&self, event: PathChildrenCacheEvent) {
        trace!("children cache on {} emits {event:?}", self.path);
        self.listeners.emit(event);
    }

    fn put(&self, name: &str, entry: CachedEntry) {
        let event = {
            let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
            match children.get(name) {
                None => {
                    children.insert(name.to_string(), entry.clone());
                    Some(PathChildrenCacheEvent::ChildAdded(entry))
                }
                Some(old) if entry.stat.mod_revision > old.stat.mod_revision => {
                    children.insert(name.to_string(), entry.clone());
                    Some(PathChildrenCacheEvent::ChildUpdated(entry))
                }
                Some(_) => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn remove(&self, name: &str) {
        let removed = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(entry) = removed {
            self.emit(PathChildrenCacheEvent::ChildRemoved(entry));
        }
    }

    fn known(&self) -> Vec<String> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    ///
    /// Reads one child, arming a data watch on it when content is cached and no watch is pending.
    ///
    /// Returns `None` if the child is already gone.
    ///
    async fn read_child(
        &self,
        name: &str,
        arm: bool,
    ) -> Result<Option<(CachedEntry, Option<DataWatch>)>> {
        let path = self.child_path(name);
        if !self.cache_data {
            return Ok(self
                .client
                .exists(&path)
                .await?
                .map(|stat| (CachedEntry::new(path, None, stat), None)));
        }
        let read = if arm {
            self.client
                .get_data_watch(&path)
                .await
                .map(|(data, stat, watch)| {
                    let name = name.to_string();
                    let watch: DataWatch = watch.map(move |event| (name, event)).boxed();
                    (data, stat, Some(watch))
                })
        } else {
            self.client
                .get_data(&path)
                .await
                .map(|(data, stat)| (data, stat, None))
        };
        match read {
            Ok((data, stat, watch)) => Ok(Some((CachedEntry::new(path, Some(data), stat), watch))),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct ChildrenTask {
    shared: Arc<Shared>,
    data_watches: FuturesUnordered<DataWatch>,
    armed: HashSet<String>,
}

enum Next {
    Relist,
    DataFired(String, WatchedEvent),
    Closed,
}

impl ChildrenTask {
    async fn refresh_child(&mut self, name: &str) -> Result<()> {
        let arm = !self.armed.contains(name);
        match self.shared.read_child(name, arm).await? {
            Some((entry, watch)) => {
                if let Some(watch) = watch {
                    self.armed.insert(name.to_string());
                    self.data_watches.push(watch);
                }
                self.shared.put(name, entry);
            }
            None => self.shared.remove(name),
        }
        Ok(())
    }

    // Diffs the listed names against the cache, reporting additions and removals.
    async fn reconcile(&mut self, names: Vec<String>, refresh_known: bool) -> Result<()> {
        let listed: HashSet<&String> = names.iter().collect();
        for name in self.shared.known() {
            if !listed.contains(&name) {
                self.shared.remove(&name);
            }
        }
        let known: HashSet<String> = self.shared.known().into_iter().collect();
        for name in &names {
            let needs_arm = self.shared.cache_data && !self.armed.contains(name);
            if !known.contains(name) || needs_arm || refresh_known {
                self.refresh_child(name).await?;
            }
        }
        Ok(())
    }

    async fn on_data_event(&mut self, name: String, event: WatchedEvent) -> Result<()> {
        self.armed.remove(&name);
        match event.event_type {
            // The name may already be taken by a recreated node, so read it again before removing.
            WatchEventType::NodeDeleted => return self.refresh_child(&name).await,
            WatchEventType::NodeDataChanged | WatchEventType::NodeCreated => {
                if let Some((data, stat)) = event.node {
                    let path = self.shared.child_path(&name);
                    self.shared.put(&name, CachedEntry::new(path, Some(data), stat));
                }
            }
            WatchEventType::NodeChildrenChanged | WatchEventType::Dropped => {}
        }
        let still_known = self
            .shared
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name);
        if still_known {
            self.refresh_child(&name).await?;
        }
        Ok(())
    }

    async fn run(mut self, mut cache_loop: CacheLoop, mut initialized: bool) {
        let shared = Arc::clone(&self.shared);
        let mut refresh_known = false;
        'outer: loop {
            let listed = match cache_loop.wait(shared.client.get_children_watch(&shared.path)).await {
                Wake::Fired(Ok(listed)) => Ok(Some(listed)),
                Wake::Fired(Err(e)) if e.is_no_node() => Ok(None),
                Wake::Fired(Err(e)) => Err(e),
                Wake::Reconnected => {
                    refresh_known = true;
                    continue;
                }
                Wake::Closed => break,
            };
            let listed = match listed {
                Ok(Some(listed)) => Ok(listed),
                // No parent yet, wait for its creation.
                Ok(None) => match cache_loop.wait(shared.client.exists_watch(&shared.path)).await {
                    Wake::Fired(Ok((Some(_), _))) => continue,
                    Wake::Fired(Ok((None, watch))) => Ok((Vec::new(), watch)),
                    Wake::Fired(Err(e)) => Err(e),
                    Wake::Reconnected => continue,
                    Wake::Closed => break,
                },
                Err(e) => Err(e),
            };
            let reconciled = match listed {
                Ok((names, watch)) => {
                    match cache_loop.wait(self.reconcile(names, refresh_known)).await {
                        Wake::Fired(Ok(())) => Ok(watch),
                        Wake::Fired(Err(e)) => Err(e),
                        Wake::Reconnected => {
                            refresh_known = true;
                            continue;
                        }
                        Wake::Closed => break,
                    }
                }
                Err(e) => Err(e),
            };
            let mut children_watch = match reconciled {
                Ok(watch) => watch,
                Err(e) => {
                    warn!("children cache on {} failed to refresh: {e}", shared.path);
                    shared.emit(PathChildrenCacheEvent::Error(Arc::new(e)));
                    match cache_loop.backoff().await {
                        Wake::Closed => break,
                        Wake::Reconnected => refresh_known = true,
                        Wake::Fired(()) => {}
                    }
                    continue;
                }
            };
            refresh_known = false;
            if !initialized {
                initialized = true;
                shared.emit(PathChildrenCacheEvent::Initialized);
            }
            loop {
                let next = {
                    let data_watches = &mut self.data_watches;
                    let wait = async {
                        tokio::select! {
                            _ = &mut children_watch => Next::Relist,
                            Some((name, event)) = data_watches.next() => Next::DataFired(name, event),
                        }
                    };
                    match cache_loop.wait(wait).await {
                        Wake::Fired(next) => next,
                        Wake::Reconnected => {
                            debug!("reconnected, refreshing children cache on {}", shared.path);
                            refresh_known = true;
                            Next::Relist
                        }
                        Wake::Closed => Next::Closed,
                    }
                };
                match next {
                    Next::Relist => continue 'outer,
                    Next::Closed => break 'outer,
                    Next::DataFired(name, event) => {
                        let handled = match cache_loop.wait(self.on_data_event(name, event)).await {
                            Wake::Fired(handled) => handled,
                            Wake::Reconnected => {
                                refresh_known = true;
                                continue 'outer;
                            }
                            Wake::Closed => break 'outer,
                        };
                        if let Err(e) = handled {
                            warn!("children cache on {} failed to refresh a child: {e}", shared.path);
                            shared.emit(PathChildrenCacheEvent::Error(Arc::new(e)));
                            continue 'outer;
                        }
                    }
                }
            }
        }
        trace!("children cache on {} stopped", shared.path);
    }
}

///
/// Local mirror of the immediate children of a path, optionally with their content.
///
/// The child list is re-read and diffed on every fired children watch, reporting additions and
/// removals. With `cache_data`, every child also gets its own data watch reporting updates.
/// The parent does not need to exist: the cache stays empty until it is created.
///
pub struct PathChildrenCache {
    shared: Arc<Shared>,
    started: AtomicBool,
    closed_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PathChildrenCache {
    pub fn new(client: Client, path: impl Into<String>, cache_data: bool) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                client,
                path: path.into(),
                cache_data,
                children: RwLock::new(BTreeMap::new()),
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
    /// Starts mirroring the children.
    ///
    /// With `build_initial` the children are read before returning and no event is emitted for
    /// them. Otherwise one [`PathChildrenCacheEvent::ChildAdded`] per initial child is emitted in
    /// the background, followed by [`PathChildrenCacheEvent::Initialized`].
    ///
    pub async fn start(&self, build_initial: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("path children cache"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState("path children cache already started"));
        }
        let cache_loop = CacheLoop::new(&self.shared.client, self.closed_tx.subscribe());
        if build_initial {
            if let Err(e) = self.build_initial().await {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        }
        let task = ChildrenTask {
            shared: Arc::clone(&self.shared),
            data_watches: FuturesUnordered::new(),
            armed: HashSet::new(),
        };
        let handle = tokio::spawn(task.run(cache_loop, build_initial));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn build_initial(&self) -> Result<()> {
        let names = match self.shared.client.get_children(&self.shared.path).await {
            Ok(names) => names,
            Err(e) if e.is_no_node() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut initial = BTreeMap::new();
        for name in names {
            if let Some((entry, _)) = self.shared.read_child(&name, false).await? {
                initial.insert(name, entry);
            }
        }
        *self
            .shared
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner) = initial;
        Ok(())
    }

    ///
    /// Latest mirrored children, sorted by name. Never touches the network.
    ///
    pub fn current_children(&self) -> Vec<CachedEntry> {
        self.shared
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    ///
    /// Latest mirrored child named `name`.
    ///
    pub fn current_data(&self, name: &str) -> Option<CachedEntry> {
        self.shared
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn add_listener<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(PathChildrenCacheEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add_listener(handler)
    }

    pub fn subscribe(&self) -> Subscription<PathChildrenCacheEvent> {
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
                warn!("path children cache task failed: {e:?}");
            }
        }
    }
}
