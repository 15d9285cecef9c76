//! Configuration for `TxList`.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::TxError;
use crate::transaction::TransactionManager;
use crate::TxList;

const DEFAULT_MAX_LEVEL: usize = 32;

/// Settings of one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListConfig {
    /// The maximum height of the skip-list index.
    pub max_level: usize,
    /// Whether predecessor lookups go through the skip-list index. Without
    /// it every lookup starts from the head of the list.
    pub indexed: bool,
}

impl Default for ListConfig {
    fn default() -> Self {
        ListConfig {
            max_level: DEFAULT_MAX_LEVEL,
            indexed: true,
        }
    }
}

impl ListConfig {
    fn validate(&self) -> Result<(), TxError> {
        if self.max_level == 0 {
            return Err(TxError::Configuration(
                "max_level must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A builder for creating a `TxList` with custom configuration.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tdsl::{TransactionManager, TxList};
///
/// let manager = Arc::new(TransactionManager::new());
/// let list = TxList::<u32, String>::builder()
///     .max_level(12)
///     .build(&manager)
///     .unwrap();
/// assert_eq!(list.config().max_level, 12);
/// ```
pub struct ListBuilder<K, V> {
    config: ListConfig,
    _phantom: PhantomData<(K, V)>,
}

impl<K, V> Default for ListBuilder<K, V> {
    fn default() -> Self {
        ListBuilder {
            config: ListConfig::default(),
            _phantom: PhantomData,
        }
    }
}

impl<K, V> ListBuilder<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Caps the height of the skip-list index.
    pub fn max_level(mut self, max_level: usize) -> Self {
        self.config.max_level = max_level;
        self
    }

    /// Enables or disables the skip-list index.
    pub fn indexed(mut self, indexed: bool) -> Self {
        self.config.indexed = indexed;
        self
    }

    /// Builds the list on top of `manager`'s version clock.
    pub fn build(self, manager: &Arc<TransactionManager>) -> Result<TxList<K, V>, TxError> {
        self.config.validate()?;
        Ok(TxList::with_config(manager, self.config))
    }
}
