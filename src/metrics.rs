//! Metric names and label keys emitted by tdsl.
//!
//! Nothing here installs a recorder. Without one, every `counter!` call in
//! the crate is a no-op.

// --- Metric Keys ---

/// Tracks the total number of transactions, labeled by their final status.
///
/// Labels:
/// - `status`: "committed", "aborted"
pub const TRANSACTIONS_TOTAL: &str = "tdsl_transactions_total";

/// Tracks transaction aborts by cause.
///
/// Labels:
/// - `reason`: see [`crate::error::AbortReason::as_str`]
pub const ABORTS_TOTAL: &str = "tdsl_aborts_total";

/// Tracks the total number of user-initiated operations.
///
/// Labels:
/// - `type`: "get", "put", "put_if_absent", "remove", "contains_key"
/// - `mode`: "singleton", "transactional"
pub const OPERATIONS_TOTAL: &str = "tdsl_operations_total";

/// Tracks changes of the index height.
///
/// Labels:
/// - `direction`: "grow", "reduce"
pub const INDEX_LEVEL_CHANGES_TOTAL: &str = "tdsl_index_level_changes_total";

/// Tracks the number of list nodes handed to the epoch reclaimer.
pub const NODES_RETIRED_TOTAL: &str = "tdsl_nodes_retired_total";

// --- Label Keys ---

pub const LABEL_STATUS: &str = "status";
pub const LABEL_REASON: &str = "reason";
pub const LABEL_OPERATION_TYPE: &str = "type";
pub const LABEL_MODE: &str = "mode";
pub const LABEL_DIRECTION: &str = "direction";
