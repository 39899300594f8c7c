use {
    crate::{
        client::{random_id, Client},
        error::{Error, Result},
        lock::DistributedMutex,
        state::ConnectionState,
    },
    async_trait::async_trait,
    std::{
        future::Future,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, PoisonError,
        },
        time::Duration,
    },
    tokio::{
        sync::{watch, Notify},
        task::JoinHandle,
    },
    tracing::{error, info, warn},
};

const FAILED_TERM_BACKOFF: Duration = Duration::from_secs(1);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

///
/// Callback run while leading.
///
#[async_trait]
pub trait LeaderSelectorListener: Send + Sync + 'static {
    ///
    /// Called once per term. Leadership is held until this returns, or fails.
    ///
    /// The term gets cancelled when the connection is suspended or lost, since exclusivity can no
    /// longer be guaranteed: implementations should watch [`LeadershipTerm::cancelled`] and return promptly.
    ///
    async fn take_leadership(&self, term: LeadershipTerm) -> Result<(), BoxError>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> LeaderSelectorListener for FnListener<F>
where
    F: Fn(LeadershipTerm) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn take_leadership(&self, term: LeadershipTerm) -> Result<(), BoxError> {
        (self.0)(term).await
    }
}

///
/// Wraps an async closure into a [`LeaderSelectorListener`].
///
pub fn listener_fn<F, Fut>(f: F) -> impl LeaderSelectorListener
where
    F: Fn(LeadershipTerm) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnListener(f)
}

///
/// One election term, handed to [`LeaderSelectorListener::take_leadership`].
///
#[derive(Clone)]
pub struct LeadershipTerm {
    number: u64,
    cancel_rx: watch::Receiver<bool>,
}

impl LeadershipTerm {
    ///
    /// Terms won by one selector are numbered from 1.
    ///
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    ///
    /// Resolves once the term is cancelled.
    ///
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub is_leader: bool,
}

struct Inner {
    client: Client,
    path: String,
    id: String,
    mutex: DistributedMutex,
    listener: Arc<dyn LeaderSelectorListener>,
    auto_requeue: AtomicBool,
    started: AtomicBool,
    queued: AtomicBool,
    has_leadership: AtomicBool,
    terms: AtomicU64,
    requeue: Notify,
    closed_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn take_one_term(&self, closed_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let acquired = tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => return Ok(()),
            acquired = self.mutex.acquire(None) => acquired,
        };
        acquired?;
        let number = self.terms.fetch_add(1, Ordering::AcqRel) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut states = self.client.connection_state().subscribe();
        if !self.client.connection_state().current().is_connected() {
            cancel_tx.send_replace(true);
        }
        self.has_leadership.store(true, Ordering::Release);
        info!("{} took leadership of {} (term {number})", self.id, self.path);

        let listener = Arc::clone(&self.listener);
        let term = LeadershipTerm { number, cancel_rx };
        let mut callback = tokio::spawn(async move { listener.take_leadership(term).await });
        let result = loop {
            tokio::select! {
                result = &mut callback => break result,
                Some(state) = states.recv() => {
                    if matches!(state, ConnectionState::Suspended | ConnectionState::Lost) && !*cancel_tx.borrow() {
                        warn!("connection {state}, cancelling leadership term {number} of {}", self.id);
                        cancel_tx.send_replace(true);
                    }
                }
                _ = closed_rx.changed(), if !*cancel_tx.borrow() => {
                    info!("selector closing, cancelling leadership term {number} of {}", self.id);
                    cancel_tx.send_replace(true);
                }
            }
        };
        self.has_leadership.store(false, Ordering::Release);
        match result {
            Ok(Ok(())) => info!("{} relinquished leadership of {} (term {number})", self.id, self.path),
            Ok(Err(e)) => warn!("take_leadership of term {number} failed: {e}"),
            Err(e) => error!("take_leadership of term {number} panicked: {e}"),
        }
        self.mutex.release().await
    }

    async fn run(self: Arc<Self>) {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow() {
                break;
            }
            self.queued.store(true, Ordering::Release);
            let outcome = self.take_one_term(&mut closed_rx).await;
            self.queued.store(false, Ordering::Release);
            if let Err(e) = outcome {
                warn!("{} failed a leadership attempt on {}: {e}", self.id, self.path);
                tokio::select! {
                    _ = closed_rx.wait_for(|closed| *closed) => break,
                    _ = tokio::time::sleep(FAILED_TERM_BACKOFF) => {}
                }
            }
            if *closed_rx.borrow() {
                break;
            }
            if self.auto_requeue.load(Ordering::Acquire) {
                continue;
            }
            tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => break,
                _ = self.requeue.notified() => {}
            }
        }
    }
}

///
/// Leader election among every selector started on the same path.
///
/// Contenders queue on a [`DistributedMutex`]. The holder runs its listener's
/// [`LeaderSelectorListener::take_leadership`] and gives the lock up when it returns. Without
/// [`LeaderSelector::auto_requeue`] a selector leads at most once unless [`LeaderSelector::requeue`]d.
///
/// ```no_run
/// use rust_etcd_recipes::{leader::{listener_fn, LeaderSelector, LeadershipTerm}, Client};
///
/// # async fn run(client: Client) {
/// let selector = LeaderSelector::new(
///     client,
///     "/election",
///     listener_fn(|term: LeadershipTerm| async move {
///         // Lead until cancelled
///         term.cancelled().await;
///         Ok(())
///     }),
/// );
/// selector.auto_requeue();
/// selector.start().expect("failed to start");
/// # }
/// ```
pub struct LeaderSelector {
    inner: Arc<Inner>,
}

impl LeaderSelector {
    pub fn new(client: Client, path: impl Into<String>, listener: impl LeaderSelectorListener) -> Self {
        Self::with_id(client, path, random_id(20), listener)
    }

    ///
    /// Like [`LeaderSelector::new`], with an explicit participant id reported by [`LeaderSelector::participants`].
    ///
    pub fn with_id(
        client: Client,
        path: impl Into<String>,
        id: impl Into<String>,
        listener: impl LeaderSelectorListener,
    ) -> Self {
        let path = path.into();
        let id = id.into();
        let mutex = DistributedMutex::with_lock_data(client.clone(), path.clone(), id.clone().into_bytes());
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client,
                path,
                id,
                mutex,
                listener: Arc::new(listener),
                auto_requeue: AtomicBool::new(false),
                started: AtomicBool::new(false),
                queued: AtomicBool::new(false),
                has_leadership: AtomicBool::new(false),
                terms: AtomicU64::new(0),
                requeue: Notify::new(),
                closed_tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    ///
    /// Re-enter the election every time a term ends.
    ///
    pub fn auto_requeue(&self) {
        self.inner.auto_requeue.store(true, Ordering::Release);
    }

    ///
    /// Enters the election. Must be called from within a tokio runtime, and only once.
    ///
    pub fn start(&self) -> Result<()> {
        if *self.inner.closed_tx.borrow() {
            return Err(Error::Closed("leader selector"));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState("leader selector already started"));
        }
        let handle = tokio::spawn(Arc::clone(&self.inner).run());
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    ///
    /// Re-enters the election after a term ended. Returns `false` if already queued or leading.
    ///
    pub fn requeue(&self) -> Result<bool> {
        if *self.inner.closed_tx.borrow() {
            return Err(Error::Closed("leader selector"));
        }
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(Error::IllegalState("leader selector not started"));
        }
        if self.inner.queued.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.inner.requeue.notify_one();
        Ok(true)
    }

    pub fn has_leadership(&self) -> bool {
        self.inner.has_leadership.load(Ordering::Acquire)
    }

    ///
    /// Every contender in queue order, the leader first.
    ///
    pub async fn participants(&self) -> Result<Vec<Participant>> {
        let nodes = self.inner.mutex.participant_nodes().await?;
        let mut participants = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match self.inner.client.get_data(node).await {
                // The first node still present holds the lock, even if earlier ones vanished meanwhile.
                Ok((data, _)) => participants.push(Participant {
                    id: String::from_utf8_lossy(&data).into_owned(),
                    is_leader: participants.is_empty(),
                }),
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(participants)
    }

    pub async fn leader(&self) -> Result<Option<Participant>> {
        Ok(self
            .participants()
            .await?
            .into_iter()
            .find(|participant| participant.is_leader))
    }

    ///
    /// Leaves the election. A running term is cancelled and awaited, then the lock is released.
    ///
    pub async fn close(&self) {
        self.inner.closed_tx.send_replace(true);
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("leader selector task failed: {e:?}");
            }
        }
    }
}

impl Drop for LeaderSelector {
    fn drop(&mut self) {
        self.inner.closed_tx.send_replace(true);
    }
}
