//! Error types for the runtime and the cluster layer.
//!
//! Two families live here:
//!
//! - [`Error`] for synchronous operations (configuration, handler
//!   registration, snapshot encoding, rebalancing). It is a plain
//!   `thiserror` enum used with the [`Result`] alias.
//! - [`AsyncError`], the value an [`Async`](crate::runtime::Async) is
//!   rejected with. It is cheap to clone, since one rejection may be observed
//!   by many awaiters, and it records the await sites it travelled through.

use crate::types::{NodeId, ShardId};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for synchronous operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for synchronous operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A route or broadcast handler is already registered under this key.
    #[error("handler already registered: {0}")]
    HandlerAlreadyRegistered(String),

    /// No handler is registered under this key.
    #[error("no handler registered: {0}")]
    HandlerNotFound(String),

    /// Snapshot or envelope encoding errors.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Rebalance input was malformed.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// No node currently owns the shard.
    #[error("shard unassigned: {0}")]
    ShardUnassigned(ShardId),

    /// The target node is not reachable through the transport.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Snapshot and envelope codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Two transportable locals share a name.
    #[error("duplicate local name in codec: {0}")]
    DuplicateLocal(&'static str),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Malformed input to a shard rebalance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// A node reports a shard id outside `0..max_shards`.
    #[error("node {node_id} reports shard {shard_id} but max_shards is {max_shards}")]
    ShardOutOfRange {
        node_id: NodeId,
        shard_id: ShardId,
        max_shards: u32,
    },

    /// Two nodes claim the same shard.
    #[error("shard {shard_id} is claimed by both node {first} and node {second}")]
    DuplicateOwnership {
        shard_id: ShardId,
        first: NodeId,
        second: NodeId,
    },

    /// A node reports a shard as both owned and stopping.
    #[error("node {node_id} reports shard {shard_id} as both owned and stopping")]
    OwnedAndStopping { node_id: NodeId, shard_id: ShardId },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(CodecError::Serialization(e.to_string()))
    }
}

/// Classification of an [`AsyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Ordinary failure raised by user code.
    Failed,
    /// An operation was attempted in a state that forbids it.
    IllegalState,
    /// The operation is not allowed in the current context.
    UnsupportedOperation,
    /// A local deadline expired.
    Timeout,
    /// A cluster route did not answer before its deadline.
    RouteTimeout,
    /// The producing side went away before settling the value.
    Cancelled,
    /// The computation panicked.
    Panic,
    /// An error reconstructed from a remote node's response.
    Remote,
}

impl ErrorKind {
    /// Class name used when the error crosses a process boundary.
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::Failed => "Failed",
            ErrorKind::IllegalState => "IllegalState",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RouteTimeout => "ClusterRouteTimeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Panic => "Panic",
            ErrorKind::Remote => "Remote",
        }
    }

    /// Inverse of [`class_name`](Self::class_name) for the kinds this crate
    /// knows how to rebuild.
    pub fn from_class_name(name: &str) -> Option<Self> {
        match name {
            "Failed" => Some(ErrorKind::Failed),
            "IllegalState" => Some(ErrorKind::IllegalState),
            "UnsupportedOperation" => Some(ErrorKind::UnsupportedOperation),
            "Timeout" => Some(ErrorKind::Timeout),
            "ClusterRouteTimeout" => Some(ErrorKind::RouteTimeout),
            "Cancelled" => Some(ErrorKind::Cancelled),
            "Panic" => Some(ErrorKind::Panic),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// One await site recorded in an error's step trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFrame {
    /// Source location of the `.await`.
    pub location: &'static Location<'static>,
    /// How many consecutive times the error passed through this site.
    pub count: u32,
}

impl fmt::Display for StepFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step [{}:{}]",
            self.location.file(),
            self.location.line()
        )?;
        if self.count > 1 {
            write!(f, " (x{})", self.count)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Repr {
    kind: ErrorKind,
    class_name: String,
    message: String,
    cause: Option<AsyncError>,
}

/// The rejection value of an [`Async`](crate::runtime::Async).
///
/// The kind, class name, message and cause are shared behind an `Arc`; the
/// step trace is per copy so every awaiter extends its own view of it.
#[derive(Clone)]
pub struct AsyncError {
    repr: Arc<Repr>,
    trace: Vec<StepFrame>,
}

impl AsyncError {
    fn build(kind: ErrorKind, class_name: String, message: String) -> Self {
        Self {
            repr: Arc::new(Repr {
                kind,
                class_name,
                message,
                cause: None,
            }),
            trace: Vec::new(),
        }
    }

    /// Create an ordinary failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Failed, message)
    }

    /// Create an error of a specific kind.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::build(kind, kind.class_name().to_string(), message.into())
    }

    /// Wrap any standard error. The class name is the error's type name.
    pub fn from_error<E: std::error::Error>(error: E) -> Self {
        let class = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        Self::build(ErrorKind::Failed, class, error.to_string())
    }

    /// Rebuild an error received from another node.
    ///
    /// Known class names map back to their kind; anything else becomes a
    /// [`ErrorKind::Remote`] error that keeps the original class name.
    pub fn remote(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        let class_name = class_name.into();
        let kind = ErrorKind::from_class_name(&class_name).unwrap_or(ErrorKind::Remote);
        Self::build(kind, class_name, message.into())
    }

    /// A binding or lifecycle rule was violated.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::IllegalState, message)
    }

    /// The operation is not allowed here.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::UnsupportedOperation, message)
    }

    /// A deadline expired.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Timeout, message)
    }

    /// The producer went away.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Cancelled, message)
    }

    /// Convert a caught panic payload.
    pub fn panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::of_kind(ErrorKind::Panic, message)
    }

    /// Attach a cause.
    pub fn with_cause(self, cause: AsyncError) -> Self {
        let repr = Repr {
            kind: self.repr.kind,
            class_name: self.repr.class_name.clone(),
            message: self.repr.message.clone(),
            cause: Some(cause),
        };
        Self {
            repr: Arc::new(repr),
            trace: self.trace,
        }
    }

    /// Record that this error surfaced at `location`.
    ///
    /// Consecutive records of the same site are folded into one frame.
    pub fn with_step(mut self, location: &'static Location<'static>) -> Self {
        match self.trace.last_mut() {
            Some(last) if last.location == location => last.count += 1,
            _ => self.trace.push(StepFrame { location, count: 1 }),
        }
        self
    }

    /// Error kind.
    pub fn kind(&self) -> ErrorKind {
        self.repr.kind
    }

    /// Class name (the kind's name, or the wrapped/remote type name).
    pub fn class_name(&self) -> &str {
        &self.repr.class_name
    }

    /// Message without the trace.
    pub fn message(&self) -> &str {
        &self.repr.message
    }

    /// Direct cause, if any.
    pub fn cause(&self) -> Option<&AsyncError> {
        self.repr.cause.as_ref()
    }

    /// This error followed by its causes.
    pub fn chain(&self) -> impl Iterator<Item = &AsyncError> {
        std::iter::successors(Some(self), |e| e.cause())
    }

    /// Await sites this error travelled through, oldest first.
    pub fn trace(&self) -> &[StepFrame] {
        &self.trace
    }

    /// True if this is a local or route timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::RouteTimeout)
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.repr.class_name, self.repr.message)?;
        if let Some(cause) = self.cause() {
            write!(f, "; caused by {}", cause)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)?;
        for frame in &self.trace {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for AsyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<Error> for AsyncError {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Config(_) | Error::HandlerAlreadyRegistered(_) => ErrorKind::IllegalState,
            _ => ErrorKind::Failed,
        };
        AsyncError::of_kind(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_reconstruction() {
        let err = AsyncError::remote("IllegalState", "bad");
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        let err = AsyncError::remote("com.acme.QuotaExceeded", "over quota");
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(err.class_name(), "com.acme.QuotaExceeded");
        assert_eq!(err.message(), "over quota");
    }

    #[test]
    fn test_step_coalescing() {
        let here = Location::caller();
        let mut err = AsyncError::new("x");
        for _ in 0..200 {
            err = err.with_step(here);
        }
        assert_eq!(err.trace().len(), 1);
        assert_eq!(err.trace()[0].count, 200);
        assert!(err.trace()[0].to_string().ends_with("(x200)"));
    }

    #[test]
    fn test_cause_chain() {
        let root = AsyncError::new("x");
        let wrapped = AsyncError::new("outer").with_cause(root);
        let messages: Vec<_> = wrapped.chain().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, vec!["outer", "x"]);
    }

    #[test]
    fn test_from_std_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = AsyncError::from_error(io);
        assert_eq!(err.class_name(), "Error");
        assert_eq!(err.message(), "disk");
    }
}
