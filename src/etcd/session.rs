use {
    crate::{namespace::SessionEvent, retry::retry_etcd, SessionId},
    futures::StreamExt,
    retry::delay::Exponential,
    std::{
        sync::{
            atomic::{AtomicI64, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        sync::{broadcast, oneshot},
        time::Instant,
    },
    tracing::{error, info, trace, warn},
};

// Jiffy is interval between system timer interrupts, typically 10ms for linux systems.
const AT_LEAST_10_JIFFIES: Duration = Duration::from_millis(100);

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

///
/// A session backed by an etcd lease kept alive in the background.
///
/// Ephemeral nodes are attached to the lease. Dropping the session revokes the lease, which deletes them.
///
pub(crate) struct EtcdSession {
    lease_id: Arc<AtomicI64>,
    events_tx: broadcast::Sender<SessionEvent>,
    // Let this field dead, because when drop it will trigger a task to wake up and gracefully revoke lease.
    #[allow(dead_code)]
    _tx_terminate: oneshot::Sender<()>,
}

enum KeepAliveEnd {
    Expired,
    Interrupted,
}

struct KeepAliveLoop {
    etcd: etcd_client::Client,
    lease_id: Arc<AtomicI64>,
    events_tx: broadcast::Sender<SessionEvent>,
    ttl: Duration,
    keepalive_interval: Duration,
    last_keep_alive: Instant,
    disconnected: bool,
}

async fn grant(etcd: &etcd_client::Client, ttl: Duration) -> Result<SessionId, etcd_client::Error> {
    let ttl_secs = ttl.as_secs() as i64;
    let resp = retry_etcd(Exponential::from_millis_with_factor(10, 10.0).take(3), || {
        let mut etcd = etcd.clone();
        async move { etcd.lease_grant(ttl_secs, None).await }
    })
    .await?;
    Ok(resp.id())
}

impl EtcdSession {
    ///
    /// Grants the lease and spawns its keep alive loop.
    ///
    /// The ttl must be at least two (2) seconds. Keepalive interval is optional, if not provided it will be half of the ttl.
    ///
    pub(crate) async fn start(
        etcd: etcd_client::Client,
        ttl: Duration,
        keepalive_interval: Option<Duration>,
    ) -> Result<Self, etcd_client::Error> {
        let lease_id = grant(&etcd, ttl).await?;
        info!("session {lease_id:?} started with ttl {ttl:?}");
        let lease_id = Arc::new(AtomicI64::new(lease_id));
        let (events_tx, _) = broadcast::channel(64);
        let (stop_tx, stop_rx) = oneshot::channel();
        let keep_alive = KeepAliveLoop {
            etcd,
            lease_id: Arc::clone(&lease_id),
            events_tx: events_tx.clone(),
            ttl,
            keepalive_interval: keepalive_interval.unwrap_or(ttl / 2),
            last_keep_alive: Instant::now(),
            disconnected: false,
        };
        tokio::spawn(keep_alive.run(stop_rx));
        Ok(Self {
            lease_id,
            events_tx,
            _tx_terminate: stop_tx,
        })
    }

    pub(crate) fn lease_id(&self) -> SessionId {
        self.lease_id.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

impl KeepAliveLoop {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn keep_alive_until_failure(&mut self, lease_id: SessionId) -> KeepAliveEnd {
        let (mut keeper, mut keep_alive_resp_stream) = match self.etcd.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to open keep alive stream for lease {lease_id:?}: {e:?}");
                return KeepAliveEnd::Interrupted;
            }
        };
        let mut next_renewal = if self.disconnected {
            Instant::now()
        } else {
            Instant::now() + self.keepalive_interval
        };
        loop {
            tokio::time::sleep_until(next_renewal).await;
            let since_last_keep_alive = self.last_keep_alive.elapsed();
            if since_last_keep_alive > self.keepalive_interval {
                let dt = since_last_keep_alive - self.keepalive_interval;
                if dt >= AT_LEAST_10_JIFFIES && !self.disconnected {
                    warn!("last keep alive was {dt:?} late");
                }
            }
            if let Err(e) = keeper.keep_alive().await {
                error!("failed to keep alive lease {lease_id:?}, got {e:?}");
                return KeepAliveEnd::Interrupted;
            }
            next_renewal += self.keepalive_interval;
            let res = tokio::time::timeout(self.keepalive_interval, keep_alive_resp_stream.next()).await;
            match res {
                Ok(Some(Ok(keep_alive_resp))) => {
                    if keep_alive_resp.ttl() == 0 {
                        error!("lease {lease_id:?} expired");
                        return KeepAliveEnd::Expired;
                    }
                    self.last_keep_alive = Instant::now();
                    if self.disconnected {
                        self.disconnected = false;
                        info!("keep alive of lease {lease_id:?} recovered");
                        self.emit(SessionEvent::Connected(lease_id));
                    }
                    trace!("keep alive lease {lease_id:?} at {since_last_keep_alive:?}");
                }
                Ok(Some(Err(e))) => {
                    warn!("keep alive stream for lease {lease_id:?} errored: {e:?}");
                    return KeepAliveEnd::Interrupted;
                }
                Ok(None) => {
                    warn!("keep alive stream for lease {lease_id:?} ended");
                    return KeepAliveEnd::Interrupted;
                }
                Err(_) => {
                    warn!("keep alive response for lease {lease_id:?} timed out");
                    return KeepAliveEnd::Interrupted;
                }
            }
        }
    }

    // Grants a fresh lease, retrying until it succeeds. Returns false if stopped first.
    async fn renew_session(&mut self, stop_rx: &mut oneshot::Receiver<()>) -> bool {
        loop {
            let result = tokio::select! {
                _ = &mut *stop_rx => return false,
                result = grant(&self.etcd, self.ttl) => result,
            };
            match result {
                Ok(lease_id) => {
                    self.lease_id.store(lease_id, Ordering::Release);
                    self.last_keep_alive = Instant::now();
                    self.disconnected = false;
                    info!("session renewed with lease {lease_id:?}");
                    self.emit(SessionEvent::Connected(lease_id));
                    return true;
                }
                Err(e) => {
                    warn!("failed to grant a new lease: {e:?}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        loop {
            let lease_id = self.lease_id.load(Ordering::Acquire);
            let end = tokio::select! {
                _ = &mut stop_rx => break,
                end = self.keep_alive_until_failure(lease_id) => end,
            };
            let expired = match end {
                KeepAliveEnd::Expired => true,
                KeepAliveEnd::Interrupted => {
                    if !self.disconnected {
                        self.disconnected = true;
                        self.emit(SessionEvent::Disconnected);
                    }
                    self.last_keep_alive.elapsed() >= self.ttl
                }
            };
            if expired {
                self.emit(SessionEvent::Expired);
                if !self.renew_session(&mut stop_rx).await {
                    break;
                }
            } else {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY.min(self.keepalive_interval)) => {}
                }
            }
        }
        let lease_id = self.lease_id.load(Ordering::Acquire);
        let since_last_keep_alive = self.last_keep_alive.elapsed();
        info!("revoking lease {lease_id:?}, last keep alive: {since_last_keep_alive:?}");
        let result = retry_etcd(Exponential::from_millis_with_factor(10, 10.0).take(3), || {
            let mut client = self.etcd.clone();
            async move {
                match client.lease_revoke(lease_id).await {
                    Ok(_) => Ok(()),
                    Err(e) if crate::retry::is_not_found(&e) => {
                        warn!("lease {lease_id:?} was already deleted");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        });
        if let Err(e) = result.await {
            error!("failed to revoke lease {lease_id:?}, got {e:?}");
        }
    }
}
