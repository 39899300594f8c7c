#![allow(dead_code)]

use {
    async_trait::async_trait,
    rust_etcd_recipes::{
        etcd::{EtcdConfig, EtcdNamespace},
        memory::{MemoryServer, MemorySession},
        namespace::SessionEvent,
        Client, CreateMode, Namespace, NamespaceError, RetryPolicy, SessionId, Stat, Version,
        Watch,
    },
    std::{
        collections::HashSet,
        future::Future,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::sync::broadcast,
    tracing_subscriber::EnvFilter,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy::n_times(3, Duration::from_millis(10))
}

///
/// A client on a fresh session of `server`, along with the session handle driving its connection.
///
pub fn memory_client(server: &MemoryServer) -> (Client, MemorySession) {
    init_tracing();
    let session = server.connect();
    let client = Client::new(session.clone(), test_retry_policy());
    (client, session)
}

///
/// Failures injected by [`FaultyNamespace`].
///
#[derive(Debug, Default)]
pub struct Faults {
    /// Deleting a node under this prefix fails with a connection loss.
    pub failing_deletes: Option<String>,
    /// Reading the data of these paths fails as if they were gone.
    pub vanished: HashSet<String>,
    /// Number of upcoming conditional writes failing with a bad version.
    pub conflicting_writes: usize,
}

///
/// A memory session failing the operations selected in its [`Faults`].
///
#[derive(Clone)]
pub struct FaultyNamespace {
    inner: MemorySession,
    faults: Arc<Mutex<Faults>>,
}

impl FaultyNamespace {
    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap()
    }
}

#[async_trait]
impl Namespace for FaultyNamespace {
    fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_events()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, NamespaceError> {
        self.inner.create(path, data, mode).await
    }

    async fn delete(&self, path: &str, version: Option<Version>) -> Result<(), NamespaceError> {
        let fails = self
            .faults()
            .failing_deletes
            .as_deref()
            .is_some_and(|prefix| path.starts_with(prefix));
        if fails {
            return Err(NamespaceError::ConnectionLoss);
        }
        self.inner.delete(path, version).await
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, NamespaceError> {
        self.inner.exists(path).await
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), NamespaceError> {
        let vanished = self.faults().vanished.contains(path);
        if vanished {
            return Err(NamespaceError::NoNode(path.to_string()));
        }
        self.inner.get_data(path).await
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> Result<Stat, NamespaceError> {
        if version.is_some() {
            let mut faults = self.faults();
            if faults.conflicting_writes > 0 {
                faults.conflicting_writes -= 1;
                return Err(NamespaceError::BadVersion(path.to_string()));
            }
        }
        self.inner.set_data(path, data, version).await
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, NamespaceError> {
        self.inner.get_children(path).await
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watch), NamespaceError> {
        self.inner.exists_watch(path).await
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watch), NamespaceError> {
        self.inner.get_data_watch(path).await
    }

    async fn get_children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), NamespaceError> {
        self.inner.get_children_watch(path).await
    }
}

///
/// Like [`memory_client`], with a handle to inject failures into the session.
///
pub fn faulty_client(server: &MemoryServer) -> (Client, Arc<Mutex<Faults>>) {
    init_tracing();
    let faults = Arc::new(Mutex::new(Faults::default()));
    let ns = FaultyNamespace {
        inner: server.connect(),
        faults: Arc::clone(&faults),
    };
    (Client::new(ns, test_retry_policy()), faults)
}

pub async fn get_etcd_client() -> etcd_client::Client {
    etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd")
}

pub async fn get_recipes_client() -> Client {
    init_tracing();
    let etcd = get_etcd_client().await;
    let ns = EtcdNamespace::with_client(etcd, EtcdConfig::default())
        .await
        .expect("failed to open etcd session");
    Client::new(ns, test_retry_policy())
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

///
/// Polls `condition` until it holds, panicking after a few seconds.
///
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
