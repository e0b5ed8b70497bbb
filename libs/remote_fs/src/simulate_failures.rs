//! A wrapper around a real adapter that misbehaves on purpose. For testing:
//! fail-first-N exercises the retry schedule and the failure cooldown, hang
//! exercises the executor's timeout enforcement.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{
    BlockLocation, CreateOptions, FsError, FsObjectStatus, GenericRemoteFs, RemoteFileSystem,
    RemotePath, RemoteReader, RemoteWriter,
};

#[derive(Debug, Clone, Copy)]
pub enum FailurePolicy {
    /// Attempts of each distinct operation fail until its counter reaches
    /// N; the attempt that reaches it goes through and the counter resets.
    /// N = 0 makes the wrapper a transparent call counter.
    FailFirst(u64),
    /// Every call parks forever; only an external timeout gets rid of it.
    Hang,
}

impl FailurePolicy {
    pub fn fail_first(attempts: u64) -> Self {
        FailurePolicy::FailFirst(attempts)
    }

    pub fn hang() -> Self {
        FailurePolicy::Hang
    }
}

/// Used to identify retries of different unique operations.
#[derive(Debug, Hash, Eq, PartialEq)]
enum RemoteOp {
    Exists(RemotePath),
    FileStatus(RemotePath),
    ListStatus(RemotePath),
    BlockLocations(RemotePath),
    OpenRead(RemotePath),
    CreateWrite(RemotePath),
    Namespace(RemotePath),
    FsStats,
}

pub struct UnreliableWrapper {
    inner: GenericRemoteFs,
    policy: FailurePolicy,
    attempts: Mutex<HashMap<RemoteOp, u64>>,
    calls: AtomicU64,
}

impl UnreliableWrapper {
    pub fn new(inner: GenericRemoteFs, policy: FailurePolicy) -> Self {
        UnreliableWrapper {
            inner,
            policy,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Total calls that reached this wrapper, failed or not.
    pub fn calls_made(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn attempt(&self, op: RemoteOp) -> Result<(), FsError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let attempts_to_fail = match self.policy {
            FailurePolicy::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves");
            }
            FailurePolicy::FailFirst(n) => n,
        };
        if attempts_to_fail == 0 {
            return Ok(());
        }
        let mut attempts = self.attempts.lock().unwrap();
        match attempts.entry(op) {
            Entry::Occupied(mut e) => {
                let attempts_before_this = {
                    let p = e.get_mut();
                    *p += 1;
                    *p
                };
                if attempts_before_this >= attempts_to_fail {
                    // let it succeed
                    e.remove();
                    Ok(())
                } else {
                    Err(FsError::Other(anyhow::anyhow!(
                        "simulated failure of remote operation {:?}",
                        e.key()
                    )))
                }
            }
            Entry::Vacant(e) => {
                let error = anyhow::anyhow!("simulated failure of remote operation {:?}", e.key());
                e.insert(1);
                Err(FsError::Other(error))
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteFileSystem for UnreliableWrapper {
    async fn exists(&self, path: &RemotePath) -> Result<bool, FsError> {
        self.attempt(RemoteOp::Exists(path.clone())).await?;
        self.inner.exists(path).await
    }

    async fn file_status(&self, path: &RemotePath) -> Result<FsObjectStatus, FsError> {
        self.attempt(RemoteOp::FileStatus(path.clone())).await?;
        self.inner.file_status(path).await
    }

    async fn list_status(&self, path: &RemotePath) -> Result<Vec<FsObjectStatus>, FsError> {
        self.attempt(RemoteOp::ListStatus(path.clone())).await?;
        self.inner.list_status(path).await
    }

    async fn block_locations(&self, path: &RemotePath) -> Result<Vec<BlockLocation>, FsError> {
        self.attempt(RemoteOp::BlockLocations(path.clone())).await?;
        self.inner.block_locations(path).await
    }

    async fn open_read(&self, path: &RemotePath) -> Result<RemoteReader, FsError> {
        self.attempt(RemoteOp::OpenRead(path.clone())).await?;
        self.inner.open_read(path).await
    }

    async fn create_write(
        &self,
        path: &RemotePath,
        opts: CreateOptions,
    ) -> Result<RemoteWriter, FsError> {
        self.attempt(RemoteOp::CreateWrite(path.clone())).await?;
        self.inner.create_write(path, opts).await
    }

    async fn create_directory(&self, path: &RemotePath) -> Result<(), FsError> {
        self.attempt(RemoteOp::Namespace(path.clone())).await?;
        self.inner.create_directory(path).await
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.attempt(RemoteOp::Namespace(from.clone())).await?;
        self.inner.rename(from, to).await
    }

    async fn delete(&self, path: &RemotePath, recursive: bool) -> Result<bool, FsError> {
        self.attempt(RemoteOp::Namespace(path.clone())).await?;
        self.inner.delete(path, recursive).await
    }

    async fn copy(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.attempt(RemoteOp::Namespace(from.clone())).await?;
        self.inner.copy(from, to).await
    }

    async fn chown(
        &self,
        path: &RemotePath,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), FsError> {
        self.attempt(RemoteOp::Namespace(path.clone())).await?;
        self.inner.chown(path, owner, group).await
    }

    async fn chmod(&self, path: &RemotePath, mode: u32) -> Result<(), FsError> {
        self.attempt(RemoteOp::Namespace(path.clone())).await?;
        self.inner.chmod(path, mode).await
    }

    async fn set_replication(&self, path: &RemotePath, replication: u32) -> Result<bool, FsError> {
        self.attempt(RemoteOp::Namespace(path.clone())).await?;
        self.inner.set_replication(path, replication).await
    }

    async fn get_used(&self) -> Result<u64, FsError> {
        self.attempt(RemoteOp::FsStats).await?;
        self.inner.get_used().await
    }

    async fn get_capacity(&self) -> Result<u64, FsError> {
        self.inner.get_capacity().await
    }

    fn default_block_size(&self) -> u64 {
        self.inner.default_block_size()
    }
}
