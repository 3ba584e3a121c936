use thiserror::Error;

/// Closed error taxonomy for the rotation lock manager.
///
/// Every public operation surfaces one of these variants to its immediate
/// caller. None are retried internally and none are fatal to the manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// An argument was outside its declared domain, or referenced a lock
    /// id that does not (or no longer) exists.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller is not the owner of the referenced lock.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Reserving capacity for a new registry entry or wait slot failed.
    /// Surfaced via `HashMap::try_reserve` on the grant/queue path instead
    /// of letting the allocator abort the process.
    #[error("out of memory")]
    OutOfMemory,

    /// The request was cancelled while suspended, before admission.
    #[error("interrupted")]
    Interrupted,
}

/// Result alias for rotation lock manager operations.
pub type RotationResult<T> = std::result::Result<T, RotationError>;
