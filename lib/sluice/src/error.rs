//! Error plumbing for the runtime. Blocking queue operations surface a small
//! closed set of conditions (`QueueError`); everything else is a
//! `RuntimeError` raised synchronously at call sites or logged by the
//! supervisor threads.

use std::fmt;
use std::io;

pub type QueueResult<T> = Result<T, QueueError>;

/// Conditions a blocking queue or port operation can end in besides success.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueueError {
    /// The peer endpoint has shut down; for readers this means the queue has
    /// also drained below the requested threshold.
    Closed,
    /// The owning kernel is terminating.
    KernelShutdown,
    /// The transport under a distributed queue failed. Kernels configured to
    /// swallow broken queues surface `Closed` instead.
    Broken,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::Closed => write!(f, "queue closed"),
            QueueError::KernelShutdown => write!(f, "kernel shutdown"),
            QueueError::Broken => write!(f, "queue transport broken"),
        }
    }
}

impl std::error::Error for QueueError {}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug)]
pub enum RuntimeError {
    /// A `create_*` call referenced missing entities or inconsistent sizing.
    InvalidConfig(String),
    /// Malformed wire frame or context message; fatal to the affected stream.
    Protocol(String),
    /// Transport level I/O failure.
    Transport(io::ErrorKind),
    /// The context rejected or could not serve a request.
    Context(String),
    /// No factory registered under the requested node type name.
    UnknownNodeType(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            RuntimeError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            RuntimeError::Transport(kind) => write!(f, "transport error: {:?}", kind),
            RuntimeError::Context(msg) => write!(f, "context error: {}", msg),
            RuntimeError::UnknownNodeType(name) => write!(f, "unknown node type: {}", name),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<io::Error> for RuntimeError {
    #[inline]
    fn from(err: io::Error) -> Self {
        RuntimeError::Transport(err.kind())
    }
}

/// Result inspection helper for call sites that only need to distinguish
/// fatal failures from benign outcomes.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for QueueResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(QueueError::Closed) => false,
            Err(QueueError::KernelShutdown) => false,
            Err(QueueError::Broken) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folds_to_transport() {
        let err: RuntimeError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        match err {
            RuntimeError::Transport(kind) => assert_eq!(kind, io::ErrorKind::ConnectionReset),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), QueueError>(()).has_failed());
        assert!(!Err::<(), _>(QueueError::Closed).has_failed());
        assert!(!Err::<(), _>(QueueError::KernelShutdown).has_failed());
        assert!(Err::<(), _>(QueueError::Broken).has_failed());
    }
}
