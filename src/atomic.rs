use {
    crate::{
        client::Client,
        error::{Error, Result},
        lock::DistributedMutex,
        namespace::CreateMode,
        retry::RetryPolicy,
        Version,
    },
    std::time::Duration,
    tokio::time::Instant,
    tracing::{debug, trace, warn},
};

///
/// Counters of the work one atomic operation went through.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicStats {
    pub optimistic_tries: u32,
    pub promoted_lock_tries: u32,
    pub optimistic_time: Duration,
    pub promoted_time: Duration,
}

///
/// Outcome of an atomic operation.
///
/// When `succeeded` is false nothing was written: `pre_value` is the last value observed and
/// `post_value` the value that failed to be written.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicValue<T> {
    pub succeeded: bool,
    pub pre_value: T,
    pub post_value: T,
    pub stats: AtomicStats,
}

impl<T> AtomicValue<T> {
    fn try_map<U>(self, mut f: impl FnMut(T) -> Result<U>) -> Result<AtomicValue<U>> {
        Ok(AtomicValue {
            succeeded: self.succeeded,
            pre_value: f(self.pre_value)?,
            post_value: f(self.post_value)?,
            stats: self.stats,
        })
    }
}

///
/// Mutex fallback of a [`DistributedAtomicValue`], entered once the optimistic attempts are exhausted.
///
#[derive(Debug, Clone)]
pub struct PromotedToLock {
    lock_path: String,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
}

impl PromotedToLock {
    pub fn new(lock_path: impl Into<String>) -> Self {
        Self {
            lock_path: lock_path.into(),
            timeout: None,
            retry_policy: RetryPolicy::Never,
        }
    }

    ///
    /// Gives up on the promotion if the lock cannot be acquired within `timeout`.
    ///
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    ///
    /// Policy for the attempts made while holding the lock. Only writers bypassing the lock can make them fail.
    ///
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

enum Attempt {
    Won { pre: Vec<u8>, post: Vec<u8> },
    Lost { pre: Vec<u8>, post: Vec<u8> },
}

struct Promotion {
    mutex: DistributedMutex,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
}

///
/// A byte value updated with optimistic concurrency.
///
/// Every attempt reads the value and its version, then writes conditionally on that version. A
/// concurrent writer makes the write fail, and the attempt is repeated on a fresh read as long as
/// the retry policy allows. An absent node reads as an empty value and is created on first write.
///
pub struct DistributedAtomicValue {
    client: Client,
    path: String,
    retry_policy: RetryPolicy,
    promotion: Option<Promotion>,
}

impl DistributedAtomicValue {
    pub fn new(client: Client, path: impl Into<String>, retry_policy: RetryPolicy) -> Self {
        Self {
            client,
            path: path.into(),
            retry_policy,
            promotion: None,
        }
    }

    ///
    /// Falls back to updating under a [`DistributedMutex`] when the optimistic attempts fail.
    ///
    pub fn with_promotion(mut self, promoted: PromotedToLock) -> Self {
        self.promotion = Some(Promotion {
            mutex: DistributedMutex::new(self.client.clone(), promoted.lock_path),
            timeout: promoted.timeout,
            retry_policy: promoted.retry_policy,
        });
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn read(&self) -> Result<(Vec<u8>, Option<Version>)> {
        match self.client.get_data(&self.path).await {
            Ok((data, stat)) => Ok((data, Some(stat.version))),
            Err(e) if e.is_no_node() => Ok((Vec::new(), None)),
            Err(e) => Err(e),
        }
    }

    ///
    /// Current value, empty if the node does not exist.
    ///
    pub async fn get(&self) -> Result<AtomicValue<Vec<u8>>> {
        let (value, _) = self.read().await?;
        Ok(AtomicValue {
            succeeded: true,
            pre_value: value.clone(),
            post_value: value,
            stats: AtomicStats::default(),
        })
    }

    ///
    /// Sets the value if nobody changed it since it was read.
    ///
    pub async fn try_set(&self, new_value: Vec<u8>) -> Result<AtomicValue<Vec<u8>>> {
        self.update(|_| Ok(new_value.clone())).await
    }

    ///
    /// Sets the value only if it currently equals `expected`. A lost race is reported, not retried.
    ///
    pub async fn compare_and_set(
        &self,
        expected: &[u8],
        new_value: Vec<u8>,
    ) -> Result<AtomicValue<Vec<u8>>> {
        let start = Instant::now();
        let (current, version) = self.read().await?;
        let mut result = AtomicValue {
            succeeded: false,
            pre_value: current,
            post_value: new_value.clone(),
            stats: AtomicStats {
                optimistic_tries: 1,
                ..Default::default()
            },
        };
        if let Some(version) = version {
            if result.pre_value == expected {
                match self.client.set_data(&self.path, new_value, Some(version)).await {
                    Ok(_) => result.succeeded = true,
                    Err(e) if e.is_bad_version() || e.is_no_node() => {
                        debug!("compare_and_set on {} lost a race: {e}", self.path)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        result.stats.optimistic_time = start.elapsed();
        Ok(result)
    }

    ///
    /// Writes the value unconditionally.
    ///
    pub async fn force_set(&self, new_value: Vec<u8>) -> Result<()> {
        match self.client.set_data(&self.path, new_value.clone(), None).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        match self
            .client
            .create_with_parents(&self.path, new_value.clone(), CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_node_exists() => {
                self.client.set_data(&self.path, new_value, None).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    ///
    /// Creates the node with `value` if it does not exist. Returns `false` if it already did.
    ///
    pub async fn initialize(&self, value: Vec<u8>) -> Result<bool> {
        match self
            .client
            .create_with_parents(&self.path, value, CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_node_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    ///
    /// Applies `make_value` to the current value until the conditional write wins or the attempts run out.
    ///
    pub async fn update<F>(&self, mut make_value: F) -> Result<AtomicValue<Vec<u8>>>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        let mut stats = AtomicStats::default();
        let start = Instant::now();
        let mut delays = self.retry_policy.delays();
        let mut attempt = loop {
            stats.optimistic_tries += 1;
            let attempt = self.attempt(&mut make_value).await?;
            if matches!(attempt, Attempt::Won { .. }) {
                break attempt;
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break attempt,
            }
        };
        stats.optimistic_time = start.elapsed();

        let promotion = match (&attempt, &self.promotion) {
            (Attempt::Lost { .. }, Some(promotion)) => Some(promotion),
            _ => None,
        };
        if let Some(promotion) = promotion {
            debug!(
                "{} optimistic tries on {} failed, promoting to lock {}",
                stats.optimistic_tries,
                self.path,
                promotion.mutex.path()
            );
            let start = Instant::now();
            if let Some(promoted) = self.update_locked(promotion, &mut make_value, &mut stats).await? {
                attempt = promoted;
            }
            stats.promoted_time = start.elapsed();
        }

        Ok(match attempt {
            Attempt::Won { pre, post } => AtomicValue {
                succeeded: true,
                pre_value: pre,
                post_value: post,
                stats,
            },
            Attempt::Lost { pre, post } => AtomicValue {
                succeeded: false,
                pre_value: pre,
                post_value: post,
                stats,
            },
        })
    }

    // Returns None when the lock could not be acquired in time.
    async fn update_locked<F>(
        &self,
        promotion: &Promotion,
        make_value: &mut F,
        stats: &mut AtomicStats,
    ) -> Result<Option<Attempt>>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        match promotion.mutex.acquire(promotion.timeout).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("could not promote {} to lock {}: {e}", self.path, promotion.mutex.path());
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let mut delays = promotion.retry_policy.delays();
        let outcome = loop {
            stats.promoted_lock_tries += 1;
            match self.attempt(make_value).await {
                Ok(attempt @ Attempt::Lost { .. }) => match delays.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => break Ok(attempt),
                },
                other => break other,
            }
        };
        if let Err(e) = promotion.mutex.release().await {
            // The outcome stands, the lock node is deleted in the background.
            warn!("failed to release lock {} after updating {}: {e}", promotion.mutex.path(), self.path);
        }
        Ok(Some(outcome?))
    }

    async fn attempt<F>(&self, make_value: &mut F) -> Result<Attempt>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        let (pre, version) = self.read().await?;
        let post = make_value(&pre)?;
        let written = match version {
            Some(version) => self
                .client
                .set_data(&self.path, post.clone(), Some(version))
                .await
                .map(|_| ()),
            None => self
                .client
                .create_with_parents(&self.path, post.clone(), CreateMode::Persistent)
                .await
                .map(|_| ()),
        };
        match written {
            Ok(()) => Ok(Attempt::Won { pre, post }),
            Err(e) if e.is_bad_version() || e.is_node_exists() || e.is_no_node() => {
                trace!("lost a write race on {}: {e}", self.path);
                Ok(Attempt::Lost { pre, post })
            }
            Err(e) => Err(e),
        }
    }
}

fn decode_long(path: &str, bytes: Vec<u8>) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let bytes: [u8; 8] = bytes.try_into().map_err(|bytes: Vec<u8>| Error::Codec {
        path: path.to_owned(),
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    Ok(i64::from_be_bytes(bytes))
}

fn encode_long(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

///
/// A signed 64 bit counter over [`DistributedAtomicValue`], stored as 8 big-endian bytes.
///
/// ```no_run
/// use rust_etcd_recipes::{atomic::DistributedAtomicLong, retry::RetryPolicy, Client};
/// use std::time::Duration;
///
/// # async fn run(client: Client) {
/// let counter = DistributedAtomicLong::new(
///     client,
///     "/counters/jobs",
///     RetryPolicy::n_times(10, Duration::from_millis(10)),
/// );
/// let value = counter.increment().await.expect("failed to increment");
/// if value.succeeded {
///     println!("{} -> {}", value.pre_value, value.post_value);
/// }
/// # }
/// ```
pub struct DistributedAtomicLong {
    value: DistributedAtomicValue,
}

impl DistributedAtomicLong {
    pub fn new(client: Client, path: impl Into<String>, retry_policy: RetryPolicy) -> Self {
        Self {
            value: DistributedAtomicValue::new(client, path, retry_policy),
        }
    }

    pub fn with_promotion(self, promoted: PromotedToLock) -> Self {
        Self {
            value: self.value.with_promotion(promoted),
        }
    }

    pub fn path(&self) -> &str {
        self.value.path()
    }

    fn decode(&self, value: AtomicValue<Vec<u8>>) -> Result<AtomicValue<i64>> {
        let path = self.value.path();
        value.try_map(|bytes| decode_long(path, bytes))
    }

    ///
    /// Current value, 0 if the node does not exist.
    ///
    pub async fn get(&self) -> Result<AtomicValue<i64>> {
        let value = self.value.get().await?;
        self.decode(value)
    }

    pub async fn add(&self, delta: i64) -> Result<AtomicValue<i64>> {
        let path = self.value.path().to_owned();
        let value = self
            .value
            .update(|current| Ok(encode_long(decode_long(&path, current.to_vec())?.wrapping_add(delta))))
            .await?;
        self.decode(value)
    }

    pub async fn subtract(&self, delta: i64) -> Result<AtomicValue<i64>> {
        self.add(delta.wrapping_neg()).await
    }

    pub async fn increment(&self) -> Result<AtomicValue<i64>> {
        self.add(1).await
    }

    pub async fn decrement(&self) -> Result<AtomicValue<i64>> {
        self.add(-1).await
    }

    pub async fn try_set(&self, new_value: i64) -> Result<AtomicValue<i64>> {
        let value = self.value.try_set(encode_long(new_value)).await?;
        self.decode(value)
    }

    pub async fn compare_and_set(&self, expected: i64, new_value: i64) -> Result<AtomicValue<i64>> {
        let value = self
            .value
            .compare_and_set(&encode_long(expected), encode_long(new_value))
            .await?;
        self.decode(value)
    }

    pub async fn force_set(&self, new_value: i64) -> Result<()> {
        self.value.force_set(encode_long(new_value)).await
    }

    pub async fn initialize(&self, value: i64) -> Result<bool> {
        self.value.initialize(encode_long(value)).await
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::memory::MemoryServer};

    fn client() -> Client {
        Client::new(MemoryServer::new().connect(), RetryPolicy::default())
    }

    #[test]
    fn longs_should_be_big_endian_with_empty_as_zero() {
        assert_eq!(decode_long("/x", Vec::new()).expect("empty"), 0);
        assert_eq!(encode_long(1), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(decode_long("/x", encode_long(-42)).expect("decode"), -42);
        assert!(matches!(
            decode_long("/x", vec![1, 2, 3]),
            Err(Error::Codec { .. })
        ));
    }

    #[tokio::test]
    async fn add_should_create_the_node_on_first_write() {
        let counter = DistributedAtomicLong::new(client(), "/counters/a", RetryPolicy::Never);
        assert_eq!(counter.get().await.expect("get").pre_value, 0);
        let value = counter.add(5).await.expect("add");
        assert!(value.succeeded);
        assert_eq!((value.pre_value, value.post_value), (0, 5));
        assert_eq!(value.stats.optimistic_tries, 1);
        let value = counter.decrement().await.expect("decrement");
        assert_eq!((value.pre_value, value.post_value), (5, 4));
    }

    #[tokio::test]
    async fn compare_and_set_should_fail_on_mismatch() {
        let counter = DistributedAtomicLong::new(client(), "/counters/b", RetryPolicy::Never);
        assert!(counter.initialize(10).await.expect("initialize"));
        assert!(!counter.initialize(11).await.expect("initialize again"));

        let value = counter.compare_and_set(3, 4).await.expect("cas");
        assert!(!value.succeeded);
        assert_eq!(value.pre_value, 10);

        let value = counter.compare_and_set(10, 4).await.expect("cas");
        assert!(value.succeeded);
        assert_eq!(counter.get().await.expect("get").post_value, 4);
    }

    #[tokio::test]
    async fn force_set_should_overwrite_without_version() {
        let client = client();
        let counter = DistributedAtomicLong::new(client.clone(), "/counters/c", RetryPolicy::Never);
        counter.force_set(7).await.expect("force_set absent");
        counter.force_set(9).await.expect("force_set present");
        assert_eq!(counter.get().await.expect("get").pre_value, 9);

        client
            .set_data("/counters/c", b"garbage".to_vec(), None)
            .await
            .expect("set_data");
        assert!(matches!(counter.get().await, Err(Error::Codec { .. })));
    }
}
