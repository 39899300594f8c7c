use {
    crate::namespace::NamespaceError,
    std::time::Duration,
    thiserror::Error,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

///
/// Errors surfaced by the client and the recipes.
///
#[derive(Debug, Error)]
pub enum Error {
    /// Transient failures persisted past the retry policy.
    #[error("retries exhausted after {attempts} attempts, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        last: NamespaceError,
    },
    /// A terminal failure reported by the service, retrying would not change the outcome.
    #[error(transparent)]
    Protocol(NamespaceError),
    /// The session expired, every ephemeral node it owned is gone.
    #[error("session lost")]
    SessionLost,
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The calling task does not hold the lock.
    #[error("lock is not held by the caller")]
    NotHeld,
    #[error("{0} is closed")]
    Closed(&'static str),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("cannot decode value at {path}: {reason}")]
    Codec { path: String, reason: String },
}

impl Error {
    pub fn protocol(&self) -> Option<&NamespaceError> {
        match self {
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self.protocol(), Some(NamespaceError::NoNode(_)))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self.protocol(), Some(NamespaceError::NodeExists(_)))
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self.protocol(), Some(NamespaceError::BadVersion(_)))
    }

    pub fn is_not_empty(&self) -> bool {
        matches!(self.protocol(), Some(NamespaceError::NotEmpty(_)))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::LockTimeout(_))
    }
}

impl From<NamespaceError> for Error {
    fn from(e: NamespaceError) -> Self {
        match e {
            NamespaceError::SessionExpired => Error::SessionLost,
            e => Error::Protocol(e),
        }
    }
}
