use {
    crate::{
        client::Client,
        error::{Error, Result},
        namespace::Stat,
        state::ConnectionState,
        sync::listeners::Subscription,
        Version,
    },
    serde::de::DeserializeOwned,
    std::{future::Future, time::Duration},
    tokio::sync::watch,
};

pub mod children;
pub mod node;

pub use {
    children::{PathChildrenCache, PathChildrenCacheEvent},
    node::{NodeCache, NodeCacheEvent},
};

// Pause before refreshing again after a failed refresh, unless the connection comes back first.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

///
/// Snapshot of one node held by a cache.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub path: String,
    ///
    /// `None` when the cache does not keep node content.
    ///
    pub data: Option<Vec<u8>>,
    pub stat: Stat,
}

impl CachedEntry {
    pub fn new(path: impl Into<String>, data: Option<Vec<u8>>, stat: Stat) -> Self {
        Self {
            path: path.into(),
            data,
            stat,
        }
    }

    pub fn version(&self) -> Version {
        self.stat.version
    }

    ///
    /// Decodes the cached content as JSON.
    ///
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.as_deref().ok_or_else(|| Error::Codec {
            path: self.path.clone(),
            reason: "no data cached".to_string(),
        })?;
        serde_json::from_slice(data).map_err(|e| Error::Codec {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

pub(crate) enum Wake<T> {
    Fired(T),
    Reconnected,
    Closed,
}

///
/// What a cache's background task waits on besides its own work: closing, and reconnection.
///
pub(crate) struct CacheLoop {
    closed_rx: watch::Receiver<bool>,
    states: Subscription<ConnectionState>,
}

impl CacheLoop {
    pub(crate) fn new(client: &Client, closed_rx: watch::Receiver<bool>) -> Self {
        Self {
            closed_rx,
            states: client.connection_state().subscribe(),
        }
    }

    ///
    /// Runs `fut` until it completes, the cache is closed, or the connection is re-established.
    ///
    pub(crate) async fn wait<T>(&mut self, fut: impl Future<Output = T>) -> Wake<T> {
        if *self.closed_rx.borrow() {
            return Wake::Closed;
        }
        tokio::pin!(fut);
        loop {
            tokio::select! {
                _ = self.closed_rx.changed() => return Wake::Closed,
                out = &mut fut => return Wake::Fired(out),
                Some(state) = self.states.recv() => {
                    if state == ConnectionState::Reconnected {
                        return Wake::Reconnected;
                    }
                }
            }
        }
    }

    pub(crate) async fn backoff(&mut self) -> Wake<()> {
        self.wait(tokio::time::sleep(ERROR_BACKOFF)).await
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde::Deserialize};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Config {
        name: String,
        replicas: u32,
    }

    #[test]
    fn cached_entry_should_decode_json() {
        let entry = CachedEntry::new(
            "/config",
            Some(br#"{"name":"svc","replicas":3}"#.to_vec()),
            Stat::default(),
        );
        assert_eq!(
            entry.json::<Config>().expect("decode failed"),
            Config {
                name: "svc".to_string(),
                replicas: 3
            }
        );

        let entry = CachedEntry::new("/config", None, Stat::default());
        assert!(matches!(entry.json::<Config>(), Err(Error::Codec { .. })));
    }
}
