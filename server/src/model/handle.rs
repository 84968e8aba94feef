use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task;

use super::GaussianStore;

/// The shared interface to the model store.
///
/// Clones are handles to the same store. Structural mutations and
/// training steps go through `mutate`, which hops onto the blocking
/// pool so a long critical section never stalls the async runtime;
/// the critical section itself is the write guard, so a mutation can
/// never be observed half-applied.
#[derive(Clone, Default)]
pub struct StoreHandle(Arc<RwLock<GaussianStore>>);

impl StoreHandle {
    pub fn new(store: GaussianStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, GaussianStore> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, GaussianStore> {
        self.0.write()
    }

    /// Runs `f` under the write guard on the blocking pool.
    ///
    /// # Returns
    /// Whatever `f` returns.
    pub async fn mutate<T, F>(&self, f: F) -> T
    where
        T: Send,
        F: FnOnce(&mut GaussianStore) -> T + Send,
    {
        task::block_in_place(|| f(&mut self.0.write()))
    }

    /// Runs `f` under the read guard on the blocking pool.
    pub async fn inspect<T, F>(&self, f: F) -> T
    where
        T: Send,
        F: FnOnce(&GaussianStore) -> T + Send,
    {
        task::block_in_place(|| f(&self.0.read()))
    }
}
