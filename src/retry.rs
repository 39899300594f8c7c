use {
    crate::{error::Error, namespace::NamespaceError},
    retry::delay::{jitter, Exponential, Fixed},
    serde::{Deserialize, Serialize},
    std::{error::Error as _, future::Future, time::Duration},
    tracing::{debug, error, warn},
};

pub fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::Ok => false,
            tonic::Code::Cancelled => false,
            tonic::Code::Unknown => status.source().is_none(),
            tonic::Code::InvalidArgument => false,
            tonic::Code::DeadlineExceeded => true,
            tonic::Code::NotFound => false,
            tonic::Code::AlreadyExists => false,
            tonic::Code::PermissionDenied => false,
            tonic::Code::ResourceExhausted => true,
            tonic::Code::FailedPrecondition => false,
            tonic::Code::Aborted => false,
            tonic::Code::OutOfRange => false,
            tonic::Code::Unimplemented => false,
            tonic::Code::Internal => true,
            tonic::Code::Unavailable => true,
            tonic::Code::DataLoss => true,
            tonic::Code::Unauthenticated => false,
        },
        etcd_client::Error::TransportError(_) => true,
        etcd_client::Error::IoError(_) => true,
        _ => false,
    }
}

pub fn is_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status) if status.code() == tonic::Code::NotFound)
}

///
/// How long, and how many times, to retry an operation that failed for a transient reason.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    ///
    /// Sleeps `base_sleep` plus a random share of `base_sleep * 2^attempt`, capped at `max_sleep`.
    ///
    ExponentialBackoff {
        base_sleep: Duration,
        max_retries: u32,
        max_sleep: Duration,
    },
    NTimes {
        n: u32,
        sleep: Duration,
    },
    Forever {
        sleep: Duration,
    },
    Never,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff {
            base_sleep: Duration::from_millis(100),
            max_retries: 3,
            max_sleep: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn exponential_backoff(base_sleep: Duration, max_retries: u32) -> Self {
        RetryPolicy::ExponentialBackoff {
            base_sleep,
            max_retries,
            max_sleep: Duration::from_secs(5),
        }
    }

    pub fn n_times(n: u32, sleep: Duration) -> Self {
        RetryPolicy::NTimes { n, sleep }
    }

    pub fn forever(sleep: Duration) -> Self {
        RetryPolicy::Forever { sleep }
    }

    ///
    /// The sleeps between attempts. The iterator ends when the policy gives up.
    ///
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            RetryPolicy::ExponentialBackoff {
                base_sleep,
                max_retries,
                max_sleep,
            } => {
                let max_sleep = *max_sleep;
                let base = *base_sleep;
                Box::new(
                    Exponential::from_millis_with_factor(base.as_millis() as u64, 2.0)
                        .map(move |d| (base + jitter(d)).min(max_sleep))
                        .take(*max_retries as usize),
                )
            }
            RetryPolicy::NTimes { n, sleep } => {
                Box::new(Fixed::from_millis(sleep.as_millis() as u64).take(*n as usize))
            }
            RetryPolicy::Forever { sleep } => Box::new(Fixed::from_millis(sleep.as_millis() as u64)),
            RetryPolicy::Never => Box::new(std::iter::empty()),
        }
    }
}

///
/// Runs `f` until it succeeds, fails terminally, or the policy gives up on transient failures.
///
/// Only transient errors (see [`NamespaceError::is_transient`]) are retried. A session expiry becomes
/// [`Error::SessionLost`], every other error is terminal and returned at once as [`Error::Protocol`].
///
/// ```no_run
/// use rust_etcd_recipes::{namespace::NamespaceError, retry::{invoke, RetryPolicy}};
///
/// # async fn run() {
/// let value = invoke(&RetryPolicy::default(), || async {
///     Ok::<_, NamespaceError>(42)
/// })
/// .await
/// .expect("failed");
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn invoke<T, F, Fut>(policy: &RetryPolicy, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NamespaceError>>,
{
    let mut delays = policy.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) if e.is_transient() => {
                warn!("failed due to transient state {:?}", e);
                match delays.next() {
                    Some(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(Error::RetryExhausted { attempts, last: e }),
                }
            }
            Err(e) => {
                debug!("failed due to non-transient state: {:?}", e);
                return Err(e.into());
            }
        }
    }
}

///
/// Retries a raw etcd call on transient gRPC failures, used by the etcd backend internals.
///
pub(crate) async fn retry_etcd<T, F, Fut>(
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, etcd_client::Error>
where
    Fut: Future<Output = Result<T, etcd_client::Error>> + Send,
    F: FnMut() -> Fut,
{
    let mut retry_strategy = retry_strategy.into_iter();
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if is_transient(&e) {
                    warn!("failed due to transient state {:?}", e);
                    match retry_strategy.next() {
                        Some(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                } else {
                    error!("failed due to non-transient state: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn exponential_backoff_should_be_bounded() {
        let policy = RetryPolicy::ExponentialBackoff {
            base_sleep: Duration::from_millis(10),
            max_retries: 5,
            max_sleep: Duration::from_millis(50),
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(10) && *d <= Duration::from_millis(50)));
    }

    #[test]
    fn never_should_not_retry() {
        assert_eq!(RetryPolicy::Never.delays().count(), 0);
        assert_eq!(
            RetryPolicy::n_times(3, Duration::from_millis(1)).delays().count(),
            3
        );
    }

    #[tokio::test]
    async fn invoke_should_retry_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = invoke(&RetryPolicy::n_times(3, Duration::from_millis(1)), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NamespaceError::ConnectionLoss)
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.expect("should succeed"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invoke_should_surface_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = invoke(&RetryPolicy::n_times(2, Duration::from_millis(1)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NamespaceError::OperationTimeout)
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::RetryExhausted {
                attempts: 3,
                last: NamespaceError::OperationTimeout
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invoke_should_not_retry_terminal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = invoke(&RetryPolicy::forever(Duration::from_millis(1)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NamespaceError::BadVersion("/counter".into()))
        })
        .await;
        assert!(result.as_ref().err().is_some_and(Error::is_bad_version));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invoke_should_map_session_expiry_to_session_lost() {
        let result: Result<(), _> = invoke(&RetryPolicy::default(), || async {
            Err(NamespaceError::SessionExpired)
        })
        .await;
        assert!(matches!(result, Err(Error::SessionLost)));
    }
}
