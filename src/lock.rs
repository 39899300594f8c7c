use {
    crate::{
        client::Client,
        error::{Error, Result},
        namespace::CreateMode,
        paths,
        state::SessionWatch,
    },
    std::{
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        thread::ThreadId,
        time::Duration,
    },
    tokio::time::Instant,
    tracing::{error, info, trace, warn},
};

const LOCK_NAME: &str = "lock-";

const BACKGROUND_DELETE_BACKOFF: Duration = Duration::from_millis(500);

///
/// Identity a hold is keyed on: the calling tokio task, or the calling thread outside of any task.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Holder {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl Holder {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Holder::Task(id),
            None => Holder::Thread(std::thread::current().id()),
        }
    }
}

struct LockData {
    path: String,
    count: usize,
    // Session the candidate node was created on. The hold is void once it is lost.
    session: SessionWatch,
}

///
/// Deletes a provisional node when dropped, unless disarmed.
///
pub(crate) struct NodeGuard {
    client: Client,
    path: Option<String>,
}

impl NodeGuard {
    pub(crate) fn new(client: Client, path: String) -> Self {
        Self {
            client,
            path: Some(path),
        }
    }

    pub(crate) fn disarm(mut self) -> String {
        self.path.take().unwrap_or_default()
    }

    ///
    /// Deletes the node now. On failure the deletion carries on in the background.
    ///
    pub(crate) async fn delete(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = self.client.delete_if_exists(&path).await {
                warn!("failed to delete provisional node {path}, retrying in the background: {e}");
                delete_in_background(self.client.clone(), path);
            }
        }
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            delete_in_background(self.client.clone(), path);
        }
    }
}

///
/// Deletes an ephemeral node from a background task, retrying until it succeeds or the session
/// owning the node is lost.
///
pub(crate) fn delete_in_background(client: Client, path: String) {
    let Ok(rt) = tokio::runtime::Handle::try_current() else {
        error!("no runtime to delete {path}, it will live until the session ends");
        return;
    };
    rt.spawn(async move {
        let mut session = client.session_watch();
        loop {
            match client.delete_if_exists(&path).await {
                Ok(_) => {
                    trace!("deleted abandoned node {path}");
                    return;
                }
                Err(e) if session.is_lost() => {
                    trace!("{path} went away with its session: {e}");
                    return;
                }
                Err(e) => warn!("failed to delete abandoned node {path}, will retry: {e}"),
            }
            let retry = async {
                tokio::time::sleep(BACKGROUND_DELETE_BACKOFF).await;
                client.connection_state().block_until_connected(None).await;
            };
            tokio::select! {
                _ = session.lost() => return,
                _ = retry => {}
            }
        }
    });
}

struct Inner {
    client: Client,
    base_path: String,
    lock_data: Vec<u8>,
    holds: Mutex<HashMap<Holder, LockData>>,
}

impl Inner {
    fn holds(&self) -> MutexGuard<'_, HashMap<Holder, LockData>> {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

///
/// Fair, reentrant, distributed mutual exclusion.
///
/// Each acquisition creates an ephemeral sequential node under the lock path. The candidate with the
/// lowest sequence holds the lock, every other candidate watches only its immediate predecessor, so a
/// release wakes a single waiter and candidates are served in arrival order.
///
/// Holds are keyed on the calling tokio task (or thread outside of a task): the task that acquired
/// must be the one releasing, and it may acquire again without blocking as long as it releases as
/// many times.
///
/// You can clone [`DistributedMutex`] to share it across tasks, clones are the same lock.
///
/// Examples
///
/// ```no_run
/// use rust_etcd_recipes::{lock::DistributedMutex, Client};
/// use std::time::Duration;
///
/// # async fn run(client: Client) {
/// let mutex = DistributedMutex::new(client, "/locks/resource");
/// mutex
///     .acquire(Some(Duration::from_secs(5)))
///     .await
///     .expect("failed to lock");
/// // Do something while holding the lock
/// mutex.release().await.expect("failed to release");
/// # }
/// ```
///
#[derive(Clone)]
pub struct DistributedMutex {
    inner: Arc<Inner>,
}

impl DistributedMutex {
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self::with_lock_data(client, path, Vec::new())
    }

    ///
    /// Like [`DistributedMutex::new`], storing `lock_data` in every candidate node this mutex creates.
    ///
    pub fn with_lock_data(client: Client, path: impl Into<String>, lock_data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                base_path: path.into(),
                lock_data,
                holds: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.base_path
    }

    ///
    /// Acquires the lock, waiting at most `timeout` if given.
    ///
    /// Fails with [`Error::LockTimeout`] if the timeout elapsed first, or with [`Error::SessionLost`] if
    /// the session expired while waiting. In both cases the candidate node is deleted before returning.
    ///
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let holder = Holder::current();
        {
            let mut holds = self.inner.holds();
            if let Some(data) = holds.get_mut(&holder) {
                if !data.session.is_lost() {
                    data.count += 1;
                    trace!("re-entered lock {} ({} holds)", data.path, data.count);
                    return Ok(());
                }
            }
            if let Some(stale) = holds.remove(&holder) {
                warn!("hold on {} went away with its session", stale.path);
            }
        }
        let (path, session) = self.attempt_lock(timeout).await?;
        info!("acquired lock {path}");
        self.inner.holds().insert(
            holder,
            LockData {
                path,
                count: 1,
                session,
            },
        );
        Ok(())
    }

    ///
    /// Releases one hold of the calling task. The lock is surrendered once every hold is released.
    ///
    pub async fn release(&self) -> Result<()> {
        let holder = Holder::current();
        let path = {
            let mut holds = self.inner.holds();
            let data = holds.get_mut(&holder).ok_or(Error::NotHeld)?;
            data.count -= 1;
            if data.count > 0 {
                return Ok(());
            }
            holds.remove(&holder).map(|data| data.path).unwrap_or_default()
        };
        match self.inner.client.delete(&path, None).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {
                trace!("lock node {path} was already gone");
            }
            Err(e) => {
                // The node must not outlive the hold, or it blocks every later candidate.
                delete_in_background(self.inner.client.clone(), path);
                return Err(e);
            }
        }
        info!("released lock {path}");
        Ok(())
    }

    ///
    /// Runs `f` while holding the lock, releasing it afterwards whatever `f` returned.
    ///
    pub async fn scope<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(timeout).await?;
        let out = f().await;
        self.release().await?;
        Ok(out)
    }

    ///
    /// Whether the calling task holds the lock.
    ///
    pub fn is_acquired_by_current(&self) -> bool {
        self.inner
            .holds()
            .get(&Holder::current())
            .is_some_and(|data| !data.session.is_lost())
    }

    ///
    /// Whether any task of this process holds the lock through this mutex.
    ///
    pub fn is_acquired_in_this_process(&self) -> bool {
        self.inner
            .holds()
            .values()
            .any(|data| !data.session.is_lost())
    }

    ///
    /// Paths of every live candidate, the holder first.
    ///
    pub async fn participant_nodes(&self) -> Result<Vec<String>> {
        Ok(self
            .sorted_candidates()
            .await?
            .into_iter()
            .map(|name| paths::make_path(&self.inner.base_path, &name))
            .collect())
    }

    async fn sorted_candidates(&self) -> Result<Vec<String>> {
        let children = match self.inner.client.get_sorted_children(&self.inner.base_path).await {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(children
            .into_iter()
            .filter(|name| name.contains(LOCK_NAME) && paths::sequence_of(name).is_some())
            .collect())
    }

    async fn attempt_lock(&self, timeout: Option<Duration>) -> Result<(String, SessionWatch)> {
        let client = &self.inner.client;
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut session = client.session_watch();
        let our_path = client
            .create_protected(
                &paths::make_path(&self.inner.base_path, LOCK_NAME),
                self.inner.lock_data.clone(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        trace!("created lock candidate {our_path}");
        let guard = NodeGuard::new(client.clone(), our_path.clone());
        let result = match deadline {
            Some((deadline, timeout)) => {
                match tokio::time::timeout_at(deadline, self.wait_for_turn(&our_path, &mut session)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::LockTimeout(timeout)),
                }
            }
            None => self.wait_for_turn(&our_path, &mut session).await,
        };
        match result {
            Ok(()) => Ok((guard.disarm(), session)),
            Err(e) => {
                trace!("giving up on lock candidate {our_path}: {e}");
                guard.delete().await;
                Err(e)
            }
        }
    }

    async fn wait_for_turn(&self, our_path: &str, session: &mut SessionWatch) -> Result<()> {
        let our_name = paths::node_from_path(our_path);
        loop {
            if session.is_lost() {
                return Err(Error::SessionLost);
            }
            let candidates = self.sorted_candidates().await?;
            let Some(our_index) = candidates.iter().position(|name| *name == our_name) else {
                // Our ephemeral node is gone with the session that created it.
                return Err(Error::SessionLost);
            };
            if our_index == 0 {
                return Ok(());
            }
            let predecessor = paths::make_path(&self.inner.base_path, &candidates[our_index - 1]);
            let (stat, watch) = self.inner.client.exists_watch(&predecessor).await?;
            if stat.is_none() {
                continue;
            }
            trace!("{our_path} waits on {predecessor}");
            tokio::select! {
                event = watch => trace!("predecessor {predecessor} fired {:?}", event.event_type),
                _ = session.lost() => return Err(Error::SessionLost),
            }
        }
    }
}
