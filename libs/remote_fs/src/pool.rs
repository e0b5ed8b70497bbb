//! Per-descriptor pool of dialed filesystem connections.
//!
//! Growth is demand-driven and uncapped; what bounds it in practice is the
//! executor's fan-out. A lease is scoped: the connection comes back to the
//! pool on drop, on every exit path, marked broken if the holder said so.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bridge::FsBridge;
use crate::{FilesystemDescriptor, FsError, GenericRemoteFs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Present in the list but carrying no live client.
    NonInitialized,
    FreeInitialized,
    BusyOk,
    /// The holder observed an I/O failure; the next lease re-dials it.
    BusyBad,
}

struct PooledConn {
    id: u64,
    fs: Option<GenericRemoteFs>,
    state: ConnState,
}

struct PoolInner {
    descriptor: FilesystemDescriptor,
    conns: Mutex<Vec<PooledConn>>,
    next_id: AtomicU64,
    /// When present, new connections are clones of this adapter instead of
    /// fresh dials. Used for shared-client backends and fault injection.
    template: Option<GenericRemoteFs>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(descriptor: FilesystemDescriptor) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                descriptor,
                conns: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                template: None,
            }),
        }
    }

    /// A pool that vends clones of a pre-built adapter instead of dialing.
    pub fn with_adapter(descriptor: FilesystemDescriptor, adapter: GenericRemoteFs) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                descriptor,
                conns: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                template: Some(adapter),
            }),
        }
    }

    async fn dial(&self, bridge: &FsBridge) -> Result<GenericRemoteFs, FsError> {
        match &self.inner.template {
            Some(template) => Ok(template.clone()),
            None => bridge.get_file_system(&self.inner.descriptor).await,
        }
    }

    pub fn descriptor(&self) -> &FilesystemDescriptor {
        &self.inner.descriptor
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }

    /// Leases a connection:
    /// 1. prefer a free initialized one;
    /// 2. else resurrect a broken one by re-dialing it in place;
    /// 3. else dial a fresh connection, admit it and grab it in one step.
    /// A descriptor that cannot be dialed at all surfaces as
    /// [`FsError::NotReachable`].
    pub async fn lease(&self, bridge: &FsBridge) -> Result<PoolLease, FsError> {
        if let Some(lease) = self.grab_free() {
            return Ok(lease);
        }

        if let Some(id) = self.reserve_bad() {
            match self.dial(bridge).await {
                Ok(fs) => {
                    self.install(id, fs.clone());
                    return Ok(PoolLease::new(self.inner.clone(), id, fs));
                }
                Err(e) => {
                    debug!(descriptor = %self.inner.descriptor, "re-dial of broken connection failed: {e:#}");
                    self.set_state(id, ConnState::NonInitialized);
                    // fall through to dialing a brand new connection
                }
            }
        }

        let fs = self.dial(bridge).await?;
        Ok(self.admit_and_grab(fs))
    }

    fn grab_free(&self) -> Option<PoolLease> {
        let mut conns = self.inner.conns.lock().unwrap();
        let conn = conns
            .iter_mut()
            .find(|c| c.state == ConnState::FreeInitialized)?;
        conn.state = ConnState::BusyOk;
        let fs = conn
            .fs
            .clone()
            .expect("free initialized connection always carries a client");
        Some(PoolLease::new(self.inner.clone(), conn.id, fs))
    }

    /// Reserves any connection that is neither free nor busy-ok (broken or
    /// uninitialized), flipping it busy so no one else grabs it meanwhile.
    fn reserve_bad(&self) -> Option<u64> {
        let mut conns = self.inner.conns.lock().unwrap();
        let conn = conns
            .iter_mut()
            .find(|c| matches!(c.state, ConnState::BusyBad | ConnState::NonInitialized))?;
        conn.state = ConnState::BusyOk;
        conn.fs = None;
        Some(conn.id)
    }

    fn install(&self, id: u64, fs: GenericRemoteFs) {
        let mut conns = self.inner.conns.lock().unwrap();
        if let Some(conn) = conns.iter_mut().find(|c| c.id == id) {
            conn.fs = Some(fs);
            conn.state = ConnState::BusyOk;
        }
    }

    fn set_state(&self, id: u64, state: ConnState) {
        let mut conns = self.inner.conns.lock().unwrap();
        if let Some(conn) = conns.iter_mut().find(|c| c.id == id) {
            conn.state = state;
        }
    }

    /// Admits a freshly dialed connection and leases it in the same index
    /// lock, so a concurrent caller cannot steal it in between.
    fn admit_and_grab(&self, fs: GenericRemoteFs) -> PoolLease {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.conns.lock().unwrap().push(PooledConn {
            id,
            fs: Some(fs.clone()),
            state: ConnState::BusyOk,
        });
        PoolLease::new(self.inner.clone(), id, fs)
    }
}

/// Scoped lease of one pooled connection. Dereferences to the filesystem;
/// dropping it returns the connection to the pool.
pub struct PoolLease {
    pool: Arc<PoolInner>,
    id: u64,
    fs: GenericRemoteFs,
    broken: AtomicBool,
}

impl PoolLease {
    fn new(pool: Arc<PoolInner>, id: u64, fs: GenericRemoteFs) -> Self {
        PoolLease {
            pool,
            id,
            fs,
            broken: AtomicBool::new(false),
        }
    }

    pub fn fs(&self) -> &GenericRemoteFs {
        &self.fs
    }

    /// The holder observed an I/O error on this connection; return it to the
    /// pool as broken so the next lease re-dials it.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }
}

impl std::ops::Deref for PoolLease {
    type Target = GenericRemoteFs;

    fn deref(&self) -> &Self::Target {
        &self.fs
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let state = if self.broken.load(Ordering::Relaxed) {
            ConnState::BusyBad
        } else {
            ConnState::FreeInitialized
        };
        let mut conns = self.pool.conns.lock().unwrap();
        if let Some(conn) = conns.iter_mut().find(|c| c.id == self.id) {
            conn.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use crate::meta_cache::MetaCache;
    use crate::{DfsType, RemoteFsConfig};

    fn local_bridge() -> FsBridge {
        FsBridge::new(
            Arc::new(TaskExecutor::new(8)),
            Arc::new(MetaCache::new()),
            RemoteFsConfig::default(),
        )
    }

    fn local_pool() -> ConnectionPool {
        ConnectionPool::new(FilesystemDescriptor::new(DfsType::Local, "", 0))
    }

    #[tokio::test]
    async fn lease_reuses_released_connection() {
        let bridge = local_bridge();
        let pool = local_pool();

        let lease = pool.lease(&bridge).await.unwrap();
        assert_eq!(pool.connection_count(), 1);
        drop(lease);

        let _again = pool.lease(&bridge).await.unwrap();
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_leases_grow_the_pool() {
        let bridge = local_bridge();
        let pool = local_pool();

        let a = pool.lease(&bridge).await.unwrap();
        let b = pool.lease(&bridge).await.unwrap();
        assert_eq!(pool.connection_count(), 2);
        drop(a);
        drop(b);

        // both come back free and are preferred over dialing new ones
        let _c = pool.lease(&bridge).await.unwrap();
        let _d = pool.lease(&bridge).await.unwrap();
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test]
    async fn broken_connection_is_redialed_not_leaked() {
        let bridge = local_bridge();
        let pool = local_pool();

        let lease = pool.lease(&bridge).await.unwrap();
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.connection_count(), 1);

        // the broken slot is resurrected in place
        let _again = pool.lease(&bridge).await.unwrap();
        assert_eq!(pool.connection_count(), 1);
    }
}
