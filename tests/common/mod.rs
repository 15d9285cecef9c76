//! Helpers shared by the integration suites.

use std::sync::{Arc, Once};

use tdsl::{Handle, TransactionManager, TxList};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=tdsl=trace`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fresh manager with one list and one handle on it.
#[allow(dead_code)]
pub fn setup<K, V>() -> (Arc<TransactionManager>, TxList<K, V>, Handle<K, V>)
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let list = TxList::new(&manager);
    let handle = manager.handle();
    (manager, list, handle)
}

/// Writes `entries` in one transaction, so no node carries the singleton flag.
#[allow(dead_code)]
pub fn seed<K, V>(manager: &Arc<TransactionManager>, list: &TxList<K, V>, entries: &[(K, V)])
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut h = manager.handle();
    h.transaction(|h| {
        for (k, v) in entries {
            list.put(h, k.clone(), v.clone())?;
        }
        Ok(())
    })
    .unwrap();
}
