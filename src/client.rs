use {
    crate::{
        error::{Error, Result},
        namespace::{CreateMode, Namespace, NamespaceError, Stat, Watch, WatchKind},
        paths,
        retry::{invoke, RetryPolicy},
        state::{ConnectionStateTracker, SessionWatch},
        SessionId, Version,
    },
    rand::{distributions::Alphanumeric, thread_rng, Rng},
    std::{future::Future, sync::Arc},
    tracing::{debug, trace},
};

///
/// Prefix marking a node created by [`Client::create_protected`].
///
pub const PROTECTED_PREFIX: &str = "_c_";

///
/// Handle on one session of the coordination service.
///
/// Every recipe takes a `Client` at construction. Every remote call goes through the client's
/// [`RetryPolicy`]. Cloning is cheap and clones share the session and its [`ConnectionStateTracker`].
///
#[derive(Clone)]
pub struct Client {
    ns: Arc<dyn Namespace>,
    state: ConnectionStateTracker,
    retry_policy: RetryPolicy,
    namespace: String,
}

impl Client {
    ///
    /// Wraps a connected backend. Must be called from within a tokio runtime: the session event
    /// stream of the backend is pumped into the client's [`ConnectionStateTracker`] by a background task.
    ///
    pub fn new<N: Namespace>(ns: N, retry_policy: RetryPolicy) -> Self {
        Self::from_arc(Arc::new(ns), retry_policy)
    }

    pub fn from_arc(ns: Arc<dyn Namespace>, retry_policy: RetryPolicy) -> Self {
        let state = ConnectionStateTracker::new(ns.session_id());
        let events = ns.session_events();
        tokio::spawn(state.clone().pump(events));
        Self {
            ns,
            state,
            retry_policy,
            namespace: String::new(),
        }
    }

    ///
    /// A client sharing this session whose paths are all rooted under `namespace`.
    ///
    pub fn using_namespace(&self, namespace: impl AsRef<str>) -> Self {
        let mut client = self.clone();
        client.namespace = paths::fix_for_namespace(&self.namespace, namespace.as_ref());
        client
    }

    pub fn with_retry_policy(&self, retry_policy: RetryPolicy) -> Self {
        let mut client = self.clone();
        client.retry_policy = retry_policy;
        client
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn connection_state(&self) -> &ConnectionStateTracker {
        &self.state
    }

    pub fn session_watch(&self) -> SessionWatch {
        self.state.session_watch()
    }

    pub fn session_id(&self) -> SessionId {
        self.ns.session_id()
    }

    fn fix(&self, path: &str) -> Result<String> {
        paths::validate_path(path).map_err(Error::Protocol)?;
        Ok(paths::fix_for_namespace(&self.namespace, path))
    }

    fn unfix(&self, path: &str) -> String {
        paths::unfix_for_namespace(&self.namespace, path)
    }

    fn attach(&self, watch: Watch) -> Watch {
        if self.namespace.is_empty() {
            watch
        } else {
            watch.strip_namespace(&self.namespace)
        }
    }

    ///
    /// Runs an operation against the backend under the client's retry policy.
    ///
    /// The closure receives the backend and is called once per attempt.
    ///
    pub async fn invoke<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Namespace>) -> Fut,
        Fut: Future<Output = Result<T, NamespaceError>>,
    {
        invoke(&self.retry_policy, || f(Arc::clone(&self.ns))).await
    }

    pub async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let path = self.fix(path)?;
        let created = self
            .invoke(|ns| {
                let (path, data) = (path.as_str(), data.clone());
                async move { ns.create(path, data, mode).await }
            })
            .await?;
        trace!("created {created}");
        Ok(self.unfix(&created))
    }

    ///
    /// Like [`Client::create`], creating missing parents as persistent nodes first.
    ///
    pub async fn create_with_parents(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String> {
        match self.create(path, data.clone(), mode).await {
            Err(e) if e.is_no_node() => {
                if let Some(parent) = paths::parent_of(path) {
                    self.ensure_path(&parent).await?;
                }
                self.create(path, data, mode).await
            }
            result => result,
        }
    }

    ///
    /// Creates `path` and its missing ancestors as empty persistent nodes. Existing nodes are left as is.
    ///
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut all = paths::ancestors(path);
        all.push(path.to_string());
        for p in all {
            match self.create(&p, Vec::new(), CreateMode::Persistent).await {
                Ok(_) => {}
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    ///
    /// Creates a sequential node whose name carries a random marker, so that a create whose response
    /// was lost is found again on retry instead of being issued twice.
    ///
    /// Parents are created if needed. Returns the actual path.
    ///
    pub async fn create_protected(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String> {
        let (parent, name) = paths::split_path(path);
        let marker = format!("{PROTECTED_PREFIX}{}-", random_id(20));
        let protected_path = paths::make_path(&parent, &format!("{marker}{name}"));
        let fixed_parent = self.fix(&parent)?;
        let fixed = self.fix(&protected_path)?;
        let mut attempt = 0;
        let mut parents_ensured = false;
        loop {
            let result = self
                .invoke(|ns| {
                    attempt += 1;
                    let (parent, path, marker, data) = (
                        fixed_parent.as_str(),
                        fixed.as_str(),
                        marker.as_str(),
                        data.clone(),
                    );
                    let is_retry = attempt > 1;
                    async move {
                        if is_retry {
                            if let Some(found) = find_protected(&*ns, parent, marker).await? {
                                debug!("found protected node {found} created by a previous attempt");
                                return Ok(found);
                            }
                        }
                        ns.create(path, data, mode).await
                    }
                })
                .await;
            match result {
                Ok(created) => return Ok(self.unfix(&created)),
                Err(e) if e.is_no_node() && !parents_ensured => {
                    self.ensure_path(&parent).await?;
                    parents_ensured = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn delete(&self, path: &str, version: Option<Version>) -> Result<()> {
        let path = self.fix(path)?;
        self.invoke(|ns| {
            let path = path.as_str();
            async move { ns.delete(path, version).await }
        })
        .await
    }

    ///
    /// Deletes `path` if it exists, ignoring a concurrent deletion.
    ///
    pub async fn delete_if_exists(&self, path: &str) -> Result<bool> {
        match self.delete(path, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_no_node() => Ok(false),
            Err(e) => Err(e),
        }
    }

    ///
    /// Deletes `path` together with its whole subtree, deepest nodes first.
    ///
    pub async fn delete_recursive(&self, path: &str) -> Result<()> {
        loop {
            let mut nodes = Vec::new();
            let mut pending = vec![path.to_string()];
            while let Some(p) = pending.pop() {
                match self.get_children(&p).await {
                    Ok(children) => {
                        pending.extend(children.iter().map(|c| paths::make_path(&p, c)));
                    }
                    Err(e) if e.is_no_node() => continue,
                    Err(e) => return Err(e),
                }
                nodes.push(p);
            }
            // Parents precede their descendants in `nodes`.
            let mut raced = false;
            for p in nodes.iter().rev().filter(|p| p.as_str() != "/") {
                match self.delete(p, None).await {
                    Ok(()) => {}
                    Err(e) if e.is_no_node() => {}
                    Err(e) if e.is_not_empty() => {
                        debug!("{p} got a new child while deleting, starting over");
                        raced = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !raced {
                return Ok(());
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let path = self.fix(path)?;
        self.invoke(|ns| {
            let path = path.as_str();
            async move { ns.exists(path).await }
        })
        .await
    }

    pub async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let path = self.fix(path)?;
        self.invoke(|ns| {
            let path = path.as_str();
            async move { ns.get_data(path).await }
        })
        .await
    }

    pub async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<Version>) -> Result<Stat> {
        let path = self.fix(path)?;
        self.invoke(|ns| {
            let (path, data) = (path.as_str(), data.clone());
            async move { ns.set_data(path, data, version).await }
        })
        .await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let path = self.fix(path)?;
        self.invoke(|ns| {
            let path = path.as_str();
            async move { ns.get_children(path).await }
        })
        .await
    }

    ///
    /// Children names sorted by their sequence suffix.
    ///
    pub async fn get_sorted_children(&self, path: &str) -> Result<Vec<String>> {
        let mut children = self.get_children(path).await?;
        paths::sort_by_sequence(&mut children);
        Ok(children)
    }

    pub async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watch)> {
        let path = self.fix(path)?;
        let (stat, watch) = self
            .invoke(|ns| {
                let path = path.as_str();
                async move { ns.exists_watch(path).await }
            })
            .await?;
        Ok((stat, self.attach(watch)))
    }

    pub async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watch)> {
        let path = self.fix(path)?;
        let (data, stat, watch) = self
            .invoke(|ns| {
                let path = path.as_str();
                async move { ns.get_data_watch(path).await }
            })
            .await?;
        Ok((data, stat, self.attach(watch)))
    }

    pub async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let path = self.fix(path)?;
        let (children, watch) = self
            .invoke(|ns| {
                let path = path.as_str();
                async move { ns.get_children_watch(path).await }
            })
            .await?;
        Ok((children, self.attach(watch)))
    }

    ///
    /// Arms a one-shot watch of the given kind, discarding the value read to arm it.
    ///
    pub async fn watch(&self, path: &str, kind: WatchKind) -> Result<Watch> {
        match kind {
            WatchKind::Exists => self.exists_watch(path).await.map(|(_, w)| w),
            WatchKind::Data => self.get_data_watch(path).await.map(|(_, _, w)| w),
            WatchKind::Children => self.get_children_watch(path).await.map(|(_, w)| w),
        }
    }
}

async fn find_protected(
    ns: &dyn Namespace,
    parent: &str,
    marker: &str,
) -> Result<Option<String>, NamespaceError> {
    let children = match ns.get_children(parent).await {
        Ok(children) => children,
        Err(NamespaceError::NoNode(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(children
        .into_iter()
        .find(|child| child.starts_with(marker))
        .map(|child| paths::make_path(parent, &child)))
}

pub(crate) fn random_id(len: usize) -> String {
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
