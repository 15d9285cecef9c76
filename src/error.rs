//! Defines the error types used throughout tdsl.
use std::fmt;

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A node the transaction read or wanted to lock was locked by another thread.
    Locked,
    /// A node's committed version is newer than the transaction's read version.
    VersionConflict,
    /// A node was last written by a singleton operation at exactly the
    /// transaction's read version, so its provenance is ambiguous.
    SingletonAmbiguity,
    /// A write-set node could not be locked during commit.
    LockContention,
    /// An earlier operation of this transaction already aborted.
    Invalidated,
}

impl AbortReason {
    /// A short, stable label suitable for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Locked => "locked",
            AbortReason::VersionConflict => "version_conflict",
            AbortReason::SingletonAmbiguity => "singleton_ambiguity",
            AbortReason::LockContention => "lock_contention",
            AbortReason::Invalidated => "invalidated",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Locked => write!(f, "observed a node locked by another thread"),
            AbortReason::VersionConflict => write!(f, "observed a version newer than the snapshot"),
            AbortReason::SingletonAmbiguity => {
                write!(f, "observed a singleton write at the snapshot version")
            }
            AbortReason::LockContention => write!(f, "could not lock the write set"),
            AbortReason::Invalidated => write!(f, "the transaction had already aborted"),
        }
    }
}

/// The primary error enum for all fallible operations in tdsl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// The transaction failed optimistic validation and was rolled back.
    ///
    /// Nothing it buffered became visible. The whole transaction can be
    /// retried from `begin()`.
    Abort(AbortReason),
    /// Occurs when `begin()` is called on a `Handle` that already has an active transaction.
    TransactionAlreadyActive,
    /// Occurs when `commit()` or `rollback()` is called on a `Handle` with no active transaction.
    NoActiveTransaction,
    /// A precondition on an argument was violated, e.g. a null node handed to the index.
    InvalidArgument(&'static str),
    /// Represents an error in the list or handle configuration.
    Configuration(String),
}

impl TxError {
    /// Returns `true` if the error is a transaction abort and the transaction
    /// may simply be retried.
    pub fn is_abort(&self) -> bool {
        matches!(self, TxError::Abort(_))
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Abort(reason) => write!(f, "Transaction aborted: {}", reason),
            TxError::TransactionAlreadyActive => {
                write!(f, "A transaction is already active on this handle")
            }
            TxError::NoActiveTransaction => {
                write!(f, "No active transaction on this handle")
            }
            TxError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            TxError::Configuration(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for TxError {}

impl From<AbortReason> for TxError {
    fn from(reason: AbortReason) -> Self {
        TxError::Abort(reason)
    }
}
