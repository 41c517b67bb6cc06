//! Error types for the certificate injector

use thiserror::Error;

/// Substring the ACME server puts in the problem type when an account or
/// order is throttled (`urn:ietf:params:acme:error:rateLimited`)
pub const RATE_LIMITED_SIGNATURE: &str = "rateLimited";

/// Main error type for certificate injector operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Object already exists in the cluster
    #[error("name: {0}, already exists")]
    AlreadyExists(String),

    /// Object is absent from the cluster
    #[error("name: {0}, not exist")]
    NotExist(String),

    /// Expected annotation or configuration key is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// The trigger condition is false; the work was correctly skipped
    #[error("not required")]
    NotRequired,

    /// The ACME server throttled the request
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// ACME protocol error reported by the collaborator
    #[error("acme error: {0}")]
    Acme(String),

    /// Invalid object or configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key or certificate handling error
    #[error("pki error: {0}")]
    Pki(String),
}

/// Coarse classification used by call sites to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Object already exists
    AlreadyExists,
    /// Object absent in cluster
    NotExist,
    /// Annotation or config key absent
    NotFound,
    /// Work correctly skipped
    NotRequired,
    /// External collaborator throttled
    RateLimited,
    /// Anything else
    Unknown,
}

impl Error {
    /// Create an already-exists error for the named object
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists(name.into())
    }

    /// Create a not-exist error for the named object
    pub fn not_exist(name: impl Into<String>) -> Self {
        Self::NotExist(name.into())
    }

    /// Create a not-found error for the named key
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create an ACME error with the given message
    ///
    /// Messages carrying the rate-limit signature are classified as
    /// [`Error::RateLimited`] so callers never have to sniff strings.
    pub fn acme(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if msg.contains(RATE_LIMITED_SIGNATURE) {
            Self::RateLimited(msg)
        } else {
            Self::Acme(msg)
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotExist(_) => ErrorKind::NotExist,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotRequired => ErrorKind::NotRequired,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            _ if self.to_string().contains(RATE_LIMITED_SIGNATURE) => ErrorKind::RateLimited,
            _ => ErrorKind::Unknown,
        }
    }

    /// True when the collaborator reported throttling
    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    /// True when the object is absent in the cluster
    pub fn is_not_exist(&self) -> bool {
        self.kind() == ErrorKind::NotExist
    }

    /// True when a create lost to an existing object
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// True when the work was skipped on purpose
    pub fn is_not_required(&self) -> bool {
        self.kind() == ErrorKind::NotRequired
    }
}
