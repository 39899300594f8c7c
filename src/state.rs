use {
    crate::{
        namespace::SessionEvent,
        sync::listeners::{ListenerHandle, Listenable, Subscription},
        SessionId,
    },
    std::{fmt, sync::Arc, time::Duration},
    tokio::sync::{broadcast, watch},
    tracing::{info, trace, warn},
};

///
/// Session lifecycle as seen by the recipes.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial state, the session is valid.
    Connected,
    /// The connection is interrupted. The session, and every ephemeral node it owns, may still be alive.
    Suspended,
    /// The connection is back, either on the same session or on a fresh one after [`ConnectionState::Lost`].
    Reconnected,
    /// The session expired. Every ephemeral node it owned is gone.
    Lost,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("CONNECTED"),
            ConnectionState::Suspended => f.write_str("SUSPENDED"),
            ConnectionState::Reconnected => f.write_str("RECONNECTED"),
            ConnectionState::Lost => f.write_str("LOST"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: ConnectionState,
    session_id: SessionId,
    // Bumped on every transition to `Lost`.
    lost_epoch: u64,
}

struct Inner {
    snapshot_tx: watch::Sender<Snapshot>,
    listeners: Listenable<ConnectionState>,
}

///
/// Classifies raw [`SessionEvent`]s into [`ConnectionState`] transitions and broadcasts them.
///
/// Cloning is cheap, every clone observes the same session.
///
#[derive(Clone)]
pub struct ConnectionStateTracker {
    inner: Arc<Inner>,
}

impl ConnectionStateTracker {
    pub fn new(session_id: SessionId) -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot {
            state: ConnectionState::Connected,
            session_id,
            lost_epoch: 0,
        });
        Self {
            inner: Arc::new(Inner {
                snapshot_tx,
                listeners: Listenable::new(),
            }),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.snapshot_tx.borrow().state
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.snapshot_tx.borrow().session_id
    }

    ///
    /// Registers a handler invoked for every transition, in order, from the notification task.
    ///
    pub fn on_state_change<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.add_listener(handler)
    }

    ///
    /// Queue of every future transition.
    ///
    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.inner.listeners.subscribe()
    }

    ///
    /// Captures the current session so a waiter can learn whether it is lost while it waits.
    ///
    pub fn session_watch(&self) -> SessionWatch {
        let rx = self.inner.snapshot_tx.subscribe();
        let epoch = rx.borrow().lost_epoch;
        SessionWatch { rx, epoch }
    }

    ///
    /// Waits until the state is [`ConnectionState::Connected`] or [`ConnectionState::Reconnected`].
    ///
    /// Returns `false` if `timeout` elapsed first.
    ///
    pub async fn block_until_connected(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.inner.snapshot_tx.subscribe();
        let wait = rx.wait_for(|snapshot| snapshot.state.is_connected());
        match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        }
    }

    ///
    /// Applies one raw session event. Returns the new state if the event caused a transition.
    ///
    pub fn process(&self, event: SessionEvent) -> Option<ConnectionState> {
        let mut transition = None;
        self.inner.snapshot_tx.send_if_modified(|snapshot| {
            let next = match (snapshot.state, event) {
                (ConnectionState::Connected | ConnectionState::Reconnected, SessionEvent::Disconnected) => {
                    Some(ConnectionState::Suspended)
                }
                (ConnectionState::Suspended | ConnectionState::Lost, SessionEvent::Connected(_)) => {
                    Some(ConnectionState::Reconnected)
                }
                (ConnectionState::Lost, SessionEvent::Expired) => None,
                (_, SessionEvent::Expired) => Some(ConnectionState::Lost),
                _ => None,
            };
            if let SessionEvent::Connected(session_id) = event {
                snapshot.session_id = session_id;
            }
            match next {
                Some(state) => {
                    if state == ConnectionState::Lost {
                        snapshot.lost_epoch += 1;
                    }
                    snapshot.state = state;
                    transition = Some(state);
                    true
                }
                None => false,
            }
        });
        match transition {
            Some(ConnectionState::Lost) => warn!("session lost"),
            Some(ConnectionState::Suspended) => warn!("connection suspended"),
            Some(state) => info!("connection state changed to {state}"),
            None => trace!("session event {event:?} caused no transition"),
        }
        if let Some(state) = transition {
            self.inner.listeners.emit(state);
        }
        transition
    }

    ///
    /// Feeds the tracker from a backend's session event stream until the stream closes.
    ///
    pub(crate) async fn pump(self, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.process(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("session event stream lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        trace!("session event stream closed");
    }
}

///
/// Observes whether the session captured by [`ConnectionStateTracker::session_watch`] got lost.
///
pub struct SessionWatch {
    rx: watch::Receiver<Snapshot>,
    epoch: u64,
}

impl SessionWatch {
    pub fn is_lost(&self) -> bool {
        self.rx.borrow().lost_epoch != self.epoch
    }

    ///
    /// Resolves once the captured session is lost. Never resolves if the tracker is dropped.
    ///
    pub async fn lost(&mut self) {
        let epoch = self.epoch;
        if self.rx.wait_for(|snapshot| snapshot.lost_epoch != epoch).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
