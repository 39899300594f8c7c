use {
    self::{
        session::EtcdSession,
        watch::{spawn_one_shot, WatchTarget},
    },
    crate::{
        namespace::{CreateMode, Namespace, NamespaceError, SessionEvent, Stat, Watch},
        paths, Revision, SessionId, Version,
    },
    async_trait::async_trait,
    etcd_client::{
        Compare, CompareOp, GetOptions, KeyValue, PutOptions, ResponseHeader, Txn, TxnOp,
        TxnOpResponse, TxnResponse,
    },
    serde::{Deserialize, Serialize},
    std::time::Duration,
    tokio::sync::broadcast,
    tracing::{debug, trace},
};

mod session;
mod watch;

// Bounds the optimistic loop on a parent's sequence counter.
const MAX_SEQUENCE_ATTEMPTS: usize = 64;

///
/// Connection settings of an [`EtcdNamespace`].
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    ///
    /// Time-to-live of the session lease. Must be at least two (2) seconds.
    ///
    pub session_ttl: Duration,
    ///
    /// Defaults to half of `session_ttl`.
    ///
    pub keepalive_interval: Option<Duration>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            session_ttl: Duration::from_secs(10),
            keepalive_interval: None,
        }
    }
}

///
/// [`Namespace`] over etcd.
///
/// Nodes are keys named after their path. A session is a lease kept alive in the background and
/// ephemeral nodes are attached to it. Sequence numbers come from a per-parent counter key updated
/// in the same transaction as the create.
///
/// Dropping the namespace revokes the session lease, deleting every ephemeral node it owns.
///
/// ```no_run
/// use rust_etcd_recipes::{etcd::{EtcdConfig, EtcdNamespace}, Client, RetryPolicy};
///
/// # async fn run() {
/// let ns = EtcdNamespace::connect(EtcdConfig::default())
///     .await
///     .expect("failed to connect to etcd");
/// let client = Client::new(ns, RetryPolicy::default());
/// # }
/// ```
pub struct EtcdNamespace {
    etcd: etcd_client::Client,
    session: EtcdSession,
}

pub(crate) fn stat_of(kv: &KeyValue) -> Stat {
    Stat {
        version: kv.version() - 1,
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        ephemeral_owner: (kv.lease() != 0).then_some(kv.lease()),
        data_length: kv.value().len(),
    }
}

fn sequence_key(parent: &str) -> String {
    format!("\0seq{parent}")
}

fn revision_of(header: Option<&ResponseHeader>) -> Result<Revision, NamespaceError> {
    header
        .map(|header| header.revision())
        .ok_or(NamespaceError::ConnectionLoss)
}

fn version_compare(path: &str, version: Option<Version>) -> Compare {
    match version {
        // etcd counts versions from 1.
        Some(version) => Compare::version(path, CompareOp::Equal, version + 1),
        None => Compare::version(path, CompareOp::Greater, 0),
    }
}

fn first_kv(resp: &TxnResponse, index: usize) -> Option<KeyValue> {
    match resp.op_responses().get(index) {
        Some(TxnOpResponse::Get(get)) => get.kvs().first().cloned(),
        _ => None,
    }
}

fn immediate_children(path: &str, kvs: &[KeyValue]) -> Vec<String> {
    let prefix = paths::child_prefix(path);
    let mut children: Vec<String> = kvs
        .iter()
        .filter_map(|kv| kv.key_str().ok())
        .filter_map(|key| key.strip_prefix(prefix.as_str()))
        .filter(|name| !name.is_empty() && !name.contains(paths::PATH_SEPARATOR))
        .map(str::to_string)
        .collect();
    children.sort();
    children
}

impl EtcdNamespace {
    pub async fn connect(config: EtcdConfig) -> Result<Self, NamespaceError> {
        let etcd = etcd_client::Client::connect(&config.endpoints, None).await?;
        Self::with_client(etcd, config).await
    }

    ///
    /// Opens a session on an existing etcd client.
    ///
    pub async fn with_client(
        etcd: etcd_client::Client,
        config: EtcdConfig,
    ) -> Result<Self, NamespaceError> {
        assert!(
            config.session_ttl >= Duration::from_secs(2),
            "session ttl must be at least two (2) seconds"
        );
        let session =
            EtcdSession::start(etcd.clone(), config.session_ttl, config.keepalive_interval).await?;
        Ok(Self { etcd, session })
    }

    pub fn etcd(&self) -> &etcd_client::Client {
        &self.etcd
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, NamespaceError> {
        Ok(self.etcd.kv_client().txn(txn).await?)
    }

    async fn get_kv(&self, path: &str) -> Result<(Option<KeyValue>, Revision), NamespaceError> {
        let resp = self.etcd.kv_client().get(path, None).await?;
        let revision = revision_of(resp.header())?;
        Ok((resp.kvs().first().cloned(), revision))
    }

    async fn check_parent(&self, path: &str, parent: &str) -> Result<(), NamespaceError> {
        if parent == "/" {
            return Ok(());
        }
        match self.get_kv(parent).await?.0 {
            None => Err(NamespaceError::NoNode(path.to_string())),
            Some(kv) if kv.lease() != 0 => Err(NamespaceError::NoChildrenForEphemerals(path.to_string())),
            Some(_) => Ok(()),
        }
    }

    async fn read_children(&self, path: &str) -> Result<(Vec<String>, Revision), NamespaceError> {
        let txn = Txn::new().and_then(vec![
            TxnOp::get(path, None),
            TxnOp::get(
                paths::child_prefix(path),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            ),
        ]);
        let resp = self.txn(txn).await?;
        if path != "/" && first_kv(&resp, 0).is_none() {
            return Err(NamespaceError::NoNode(path.to_string()));
        }
        let revision = revision_of(resp.header())?;
        let children = match resp.op_responses().get(1) {
            Some(TxnOpResponse::Get(get)) => immediate_children(path, get.kvs()),
            _ => Vec::new(),
        };
        Ok((children, revision))
    }

    async fn create_sequential(
        &self,
        path: &str,
        parent: &str,
        data: Vec<u8>,
        put_opts: Option<PutOptions>,
    ) -> Result<String, NamespaceError> {
        let counter_key = sequence_key(parent);
        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let (counter, _) = self.get_kv(&counter_key).await?;
            let (sequence, counter_version) = match counter {
                Some(kv) => (
                    kv.value_str().ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or_default(),
                    kv.version(),
                ),
                None => (0, 0),
            };
            let actual = paths::format_sequence(path, sequence);
            let mut compares = vec![
                Compare::version(counter_key.as_str(), CompareOp::Equal, counter_version),
                Compare::version(actual.as_str(), CompareOp::Equal, 0),
            ];
            if parent != "/" {
                compares.push(Compare::version(parent, CompareOp::Greater, 0));
            }
            let txn = Txn::new()
                .when(compares)
                .and_then(vec![
                    TxnOp::put(counter_key.as_str(), (sequence + 1).to_string(), None),
                    TxnOp::put(actual.as_str(), data.clone(), put_opts.clone()),
                ])
                .or_else(vec![TxnOp::get(parent, None), TxnOp::get(actual.as_str(), None)]);
            let resp = self.txn(txn).await?;
            if resp.succeeded() {
                trace!("created {actual}");
                return Ok(actual);
            }
            if parent != "/" && first_kv(&resp, 0).is_none() {
                return Err(NamespaceError::NoNode(path.to_string()));
            }
            if first_kv(&resp, 1).is_some() {
                return Err(NamespaceError::NodeExists(actual));
            }
            debug!("sequence counter of {parent} raced, retrying");
        }
        Err(NamespaceError::OperationTimeout)
    }
}

#[async_trait]
impl Namespace for EtcdNamespace {
    fn session_id(&self) -> SessionId {
        self.session.lease_id()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, NamespaceError> {
        paths::validate_path(path)?;
        let parent = paths::parent_of(path).ok_or_else(|| NamespaceError::NodeExists(path.to_string()))?;
        self.check_parent(path, &parent).await?;
        let put_opts = mode
            .is_ephemeral()
            .then(|| PutOptions::new().with_lease(self.session.lease_id()));
        if mode.is_sequential() {
            return self.create_sequential(path, &parent, data, put_opts).await;
        }
        let mut compares = vec![Compare::version(path, CompareOp::Equal, 0)];
        if parent != "/" {
            compares.push(Compare::version(parent.as_str(), CompareOp::Greater, 0));
        }
        let txn = Txn::new()
            .when(compares)
            .and_then(vec![TxnOp::put(path, data, put_opts)])
            .or_else(vec![TxnOp::get(path, None)]);
        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            Ok(path.to_string())
        } else if first_kv(&resp, 0).is_some() {
            Err(NamespaceError::NodeExists(path.to_string()))
        } else {
            Err(NamespaceError::NoNode(path.to_string()))
        }
    }

    async fn delete(&self, path: &str, version: Option<Version>) -> Result<(), NamespaceError> {
        paths::validate_path(path)?;
        if path == "/" {
            return Err(NamespaceError::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be deleted",
            });
        }
        let children = self
            .etcd
            .kv_client()
            .get(
                paths::child_prefix(path),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await?;
        if children.count() > 0 {
            return Err(NamespaceError::NotEmpty(path.to_string()));
        }
        let txn = Txn::new()
            .when(vec![version_compare(path, version)])
            .and_then(vec![
                TxnOp::delete(path, None),
                TxnOp::delete(sequence_key(path), None),
            ])
            .or_else(vec![TxnOp::get(path, None)]);
        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            Ok(())
        } else if first_kv(&resp, 0).is_some() {
            Err(NamespaceError::BadVersion(path.to_string()))
        } else {
            Err(NamespaceError::NoNode(path.to_string()))
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, NamespaceError> {
        Ok(self.exists_watch_inner(path).await?.0)
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), NamespaceError> {
        paths::validate_path(path)?;
        if path == "/" {
            return Ok((Vec::new(), Stat::default()));
        }
        match self.get_kv(path).await?.0 {
            Some(kv) => Ok((kv.value().to_vec(), stat_of(&kv))),
            None => Err(NamespaceError::NoNode(path.to_string())),
        }
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> Result<Stat, NamespaceError> {
        paths::validate_path(path)?;
        if path == "/" {
            return Err(NamespaceError::InvalidPath {
                path: path.to_string(),
                reason: "the root holds no data",
            });
        }
        let txn = Txn::new()
            .when(vec![version_compare(path, version)])
            .and_then(vec![
                TxnOp::put(path, data, Some(PutOptions::new().with_ignore_lease())),
                TxnOp::get(path, None),
            ])
            .or_else(vec![TxnOp::get(path, None)]);
        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            first_kv(&resp, 1)
                .as_ref()
                .map(stat_of)
                .ok_or_else(|| NamespaceError::NoNode(path.to_string()))
        } else if first_kv(&resp, 0).is_some() {
            Err(NamespaceError::BadVersion(path.to_string()))
        } else {
            Err(NamespaceError::NoNode(path.to_string()))
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, NamespaceError> {
        paths::validate_path(path)?;
        Ok(self.read_children(path).await?.0)
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watch), NamespaceError> {
        let (stat, revision) = self.exists_watch_inner(path).await?;
        let (tx, watch) = Watch::channel(path);
        spawn_one_shot(self.etcd.clone(), path.to_string(), WatchTarget::Node, revision + 1, tx);
        Ok((stat, watch))
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watch), NamespaceError> {
        paths::validate_path(path)?;
        let (kv, revision) = self.get_kv(path).await?;
        let kv = kv.ok_or_else(|| NamespaceError::NoNode(path.to_string()))?;
        let (tx, watch) = Watch::channel(path);
        spawn_one_shot(self.etcd.clone(), path.to_string(), WatchTarget::Node, revision + 1, tx);
        Ok((kv.value().to_vec(), stat_of(&kv), watch))
    }

    async fn get_children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), NamespaceError> {
        paths::validate_path(path)?;
        let (children, revision) = self.read_children(path).await?;
        let (tx, watch) = Watch::channel(path);
        spawn_one_shot(self.etcd.clone(), path.to_string(), WatchTarget::Children, revision + 1, tx);
        Ok((children, watch))
    }
}

impl EtcdNamespace {
    async fn exists_watch_inner(&self, path: &str) -> Result<(Option<Stat>, Revision), NamespaceError> {
        paths::validate_path(path)?;
        let (kv, revision) = self.get_kv(path).await?;
        if path == "/" {
            return Ok((Some(Stat::default()), revision));
        }
        Ok((kv.as_ref().map(stat_of), revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_key_should_not_collide_with_node_keys() {
        assert_eq!(sequence_key("/locks"), "\0seq/locks");
        assert!(paths::validate_path(&sequence_key("/locks")).is_err());
    }

    #[test]
    fn children_of_empty_listing_should_be_empty() {
        assert!(immediate_children("/a", &[]).is_empty());
        assert_eq!(paths::child_prefix("/"), "/");
        assert_eq!(paths::child_prefix("/a"), "/a/");
    }
}
