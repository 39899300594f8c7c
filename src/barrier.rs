use {
    crate::{
        client::{random_id, Client},
        error::{Error, Result},
        lock::{delete_in_background, NodeGuard},
        namespace::{CreateMode, Watch, WatchedEvent},
        paths,
        state::SessionWatch,
    },
    std::time::Duration,
    tokio::time::Instant,
    tracing::{debug, info, trace},
};

const READY_NODE: &str = "ready";

#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Deadline {
            at: Instant::now() + timeout,
            timeout,
        })
    }
}

// Waits for `watch` to fire, unless the deadline passes or the session is lost first.
async fn wait_on(
    watch: Watch,
    deadline: Option<Deadline>,
    session: &mut SessionWatch,
) -> Result<WatchedEvent> {
    let timer = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        event = watch => Ok(event),
        _ = session.lost() => Err(Error::SessionLost),
        _ = timer => Err(Error::Timeout(deadline.map(|d| d.timeout).unwrap_or_default())),
    }
}

///
/// Blocks processes until a condition is met.
///
/// The barrier is up while its node exists. Waiters resume once it is removed.
///
pub struct DistributedBarrier {
    client: Client,
    path: String,
}

impl DistributedBarrier {
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    ///
    /// Raises the barrier. Raising an already raised barrier is a no-op.
    ///
    pub async fn set_barrier(&self) -> Result<()> {
        match self
            .client
            .create_with_parents(&self.path, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                info!("barrier {} set", self.path);
                Ok(())
            }
            Err(e) if e.is_node_exists() => {
                debug!("barrier {} already set", self.path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    ///
    /// Removes the barrier, releasing every waiter. Removing an absent barrier is a no-op.
    ///
    pub async fn remove_barrier(&self) -> Result<()> {
        if self.client.delete_if_exists(&self.path).await? {
            info!("barrier {} removed", self.path);
        }
        Ok(())
    }

    ///
    /// Blocks until the barrier is removed, or fails with [`Error::Timeout`] after `timeout`.
    ///
    pub async fn wait_on_barrier(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut session = self.client.session_watch();
        loop {
            let (stat, watch) = self.client.exists_watch(&self.path).await?;
            if stat.is_none() {
                return Ok(());
            }
            let event = wait_on(watch, deadline, &mut session).await?;
            trace!("barrier {} fired {:?}", self.path, event.event_type);
        }
    }
}

///
/// Lets a fixed number of participants enter a computation together and leave it together.
///
/// Each participant adds an ephemeral node under the barrier path on [`DistributedDoubleBarrier::enter`].
/// The arrival that brings the count to the threshold creates a `ready` node every waiter watches.
/// On [`DistributedDoubleBarrier::leave`] the participants delete their nodes and wait until all are gone.
/// A crashed participant's node disappears with its session, so counts are taken fresh on every check.
///
pub struct DistributedDoubleBarrier {
    client: Client,
    barrier_path: String,
    member_threshold: usize,
    our_path: String,
    ready_path: String,
}

impl DistributedDoubleBarrier {
    pub fn new(client: Client, barrier_path: impl Into<String>, member_threshold: usize) -> Self {
        let barrier_path = barrier_path.into();
        let our_path = paths::make_path(&barrier_path, &random_id(20));
        let ready_path = paths::make_path(&barrier_path, READY_NODE);
        Self {
            client,
            barrier_path,
            member_threshold,
            our_path,
            ready_path,
        }
    }

    ///
    /// Path of this participant's node.
    ///
    pub fn participant_path(&self) -> &str {
        &self.our_path
    }

    async fn participants(&self) -> Result<Vec<String>> {
        let mut children = match self.client.get_children(&self.barrier_path).await {
            Ok(children) => children,
            Err(e) if e.is_no_node() => Vec::new(),
            Err(e) => return Err(e),
        };
        children.retain(|name| name != READY_NODE);
        children.sort();
        Ok(children)
    }

    ///
    /// Enters the barrier and blocks until the threshold is reached.
    ///
    /// On [`Error::Timeout`] this participant's node is deleted before returning, no other participant is released.
    ///
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut session = self.client.session_watch();
        let (ready, mut ready_watch) = self.client.exists_watch(&self.ready_path).await?;
        match self
            .client
            .create_with_parents(&self.our_path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_node_exists() => {
                return Err(Error::IllegalState("already entered the barrier"));
            }
            Err(e) => return Err(e),
        }
        if ready.is_some() {
            info!("{} entered barrier {}", self.our_path, self.barrier_path);
            return Ok(());
        }
        let guard = NodeGuard::new(self.client.clone(), self.our_path.clone());
        loop {
            let count = self.participants().await?.len();
            if count >= self.member_threshold {
                match self
                    .client
                    .create(&self.ready_path, Vec::new(), CreateMode::Persistent)
                    .await
                {
                    Ok(_) => debug!("{} is the last to enter {}", self.our_path, self.barrier_path),
                    Err(e) if e.is_node_exists() => {}
                    Err(e) => return Err(e),
                }
                break;
            }
            trace!("{count} of {} entered {}", self.member_threshold, self.barrier_path);
            if let Err(e) = wait_on(ready_watch, deadline, &mut session).await {
                guard.delete().await;
                return Err(e);
            }
            let (ready, watch) = self.client.exists_watch(&self.ready_path).await?;
            if ready.is_some() {
                break;
            }
            ready_watch = watch;
        }
        guard.disarm();
        info!("{} entered barrier {}", self.our_path, self.barrier_path);
        Ok(())
    }

    ///
    /// Leaves the barrier and blocks until every participant left.
    ///
    pub async fn leave(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut session = self.client.session_watch();
        let mut our_node_should_exist = true;
        let result = self
            .internal_leave(deadline, &mut session, &mut our_node_should_exist)
            .await;
        if result.is_err() && our_node_should_exist {
            // Still queued, drop out so the others are not held back by a phantom participant.
            delete_in_background(self.client.clone(), self.our_path.clone());
        }
        result?;
        self.client.delete_if_exists(&self.ready_path).await?;
        info!("{} left barrier {}", self.our_path, self.barrier_path);
        Ok(())
    }

    async fn internal_leave(
        &self,
        deadline: Option<Deadline>,
        session: &mut SessionWatch,
        our_node_should_exist: &mut bool,
    ) -> Result<()> {
        let our_name = paths::node_from_path(&self.our_path);
        loop {
            let children = self.participants().await?;
            if children.is_empty() {
                return Ok(());
            }
            let our_index = children.iter().position(|name| *name == our_name);
            if our_index.is_none() && *our_node_should_exist {
                if session.is_lost() {
                    return Err(Error::SessionLost);
                }
                return Err(Error::IllegalState("our barrier node is missing"));
            }
            if children.len() == 1 {
                if *our_node_should_exist && children[0] != our_name {
                    return Err(Error::IllegalState("the last barrier node is not ours"));
                }
                if *our_node_should_exist {
                    self.client.delete_if_exists(&self.our_path).await?;
                    *our_node_should_exist = false;
                }
                return Ok(());
            }
            let (stat, watch) = if our_index == Some(0) {
                // The lowest node leaves last: wait for the highest one to go.
                let highest = paths::make_path(&self.barrier_path, &children[children.len() - 1]);
                self.client.exists_watch(&highest).await?
            } else {
                let lowest = paths::make_path(&self.barrier_path, &children[0]);
                let watched = self.client.exists_watch(&lowest).await?;
                if *our_node_should_exist {
                    self.client.delete_if_exists(&self.our_path).await?;
                    *our_node_should_exist = false;
                }
                watched
            };
            if stat.is_some() {
                wait_on(watch, deadline, session).await?;
            }
        }
    }
}
