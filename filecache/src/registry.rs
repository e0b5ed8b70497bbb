//! The cache facade: one explicitly constructed service object owned by the
//! embedding engine. It resolves filesystem descriptors into pooled
//! adapters, routes cache lookups, owns the background sweeper and keeps
//! the CREATE_FROM_SELECT side table.
//!
//! There is deliberately no process-wide singleton here; the engine's main
//! object holds the registry and threads it into whoever needs it, which
//! removes the initialization-order hazards a static would bring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use remote_fs::bridge::FsBridge;
use remote_fs::executor::TaskExecutor;
use remote_fs::meta_cache::MetaCache;
use remote_fs::pool::ConnectionPool;
use remote_fs::{
    BlockLocation, DfsType, FilesystemDescriptor, FsObjectStatus, GenericRemoteFs,
    RemoteFileSystem, RemoteFsConfig, RemotePath,
};

use crate::cache::FileCache;
use crate::cached_file::{CachedFile, DownloadContext, DownloadError, FileNature, FileState};
use crate::config::CacheConfig;
use crate::handle::{FileHandle, OpenMode, OpenOptions};
use crate::namespace::{self, RemoteOrigin};
use crate::{sweep, CacheError};

/// A registered CREATE_FROM_SELECT association: the remote sink a local
/// cache file must be uploaded into when its writer closes.
#[derive(Debug, Clone)]
pub struct CfsPair {
    pub descriptor: FilesystemDescriptor,
    pub remote_path: RemotePath,
}

#[derive(Clone)]
struct DescriptorEntry {
    descriptor: FilesystemDescriptor,
    pool: ConnectionPool,
}

pub(crate) struct RegistryShared {
    remote_config: RemoteFsConfig,
    cache_config: Mutex<CacheConfig>,
    pub(crate) bridge: FsBridge,
    pub(crate) cache: OnceCell<Arc<FileCache>>,
    routing: Mutex<HashMap<(DfsType, String), DescriptorEntry>>,
    cfs_pairs: Mutex<HashMap<Utf8PathBuf, CfsPair>>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct CacheRegistry {
    pub(crate) shared: Arc<RegistryShared>,
}

impl CacheRegistry {
    pub fn new(cache_config: CacheConfig, remote_config: RemoteFsConfig) -> Self {
        let executor = Arc::new(TaskExecutor::new(remote_config.executor_workers));
        let meta = Arc::new(MetaCache::new());
        let bridge = FsBridge::new(executor, meta, remote_config.clone());
        CacheRegistry {
            shared: Arc::new(RegistryShared {
                remote_config,
                cache_config: Mutex::new(cache_config),
                bridge,
                cache: OnceCell::new(),
                routing: Mutex::new(HashMap::new()),
                cfs_pairs: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Sets the cache root. The directory must exist and be writable.
    /// Rejected once the cache is initialized.
    pub fn configure_local_storage(&self, root: &Utf8Path) -> Result<(), CacheError> {
        if self.shared.cache.get().is_some() {
            return Err(CacheError::Config(
                "cache storage cannot be moved after initialization".to_owned(),
            ));
        }
        let meta = std::fs::metadata(root)
            .map_err(|e| CacheError::Config(format!("cache root {root} is not usable: {e}")))?;
        if !meta.is_dir() {
            return Err(CacheError::Config(format!(
                "cache root {root} is not a directory"
            )));
        }
        let probe = root.join(".cache_write_probe");
        std::fs::write(&probe, b"")
            .and_then(|()| std::fs::remove_file(&probe))
            .map_err(|e| CacheError::Config(format!("cache root {root} is not writable: {e}")))?;
        self.shared.cache_config.lock().unwrap().cache_root = root.to_path_buf();
        Ok(())
    }

    /// Finalizes cache sizing. Rejected once the cache is initialized.
    pub fn configure_size_limits(
        &self,
        mem_limit_percent: u8,
        size_hard_limit: u64,
        timeslice: Duration,
    ) -> Result<(), CacheError> {
        if self.shared.cache.get().is_some() {
            return Err(CacheError::Config(
                "cache limits cannot be changed after initialization".to_owned(),
            ));
        }
        let mut config = self.shared.cache_config.lock().unwrap();
        config.cache_mem_limit_percent = mem_limit_percent;
        config.cache_size_hard_limit = size_hard_limit;
        config.cache_eviction_timeslice = timeslice;
        Ok(())
    }

    /// Brings the cache up: enumerates the on-disk state and starts the
    /// sweeper. Idempotent; a second call is a no-op.
    pub fn init(&self) -> Result<(), CacheError> {
        if self.shared.cache.get().is_some() {
            return Ok(());
        }
        let config = self.shared.cache_config.lock().unwrap().clone();
        config
            .validate()
            .map_err(|e| CacheError::Config(format!("{e:#}")))?;

        let hard_limit = if config.cache_size_hard_limit > 0 {
            config.cache_size_hard_limit
        } else {
            let total = fs2::total_space(config.cache_root.as_std_path()).map_err(|e| {
                CacheError::Config(format!("cannot size cache volume {}: {e}", config.cache_root))
            })?;
            total / 100 * config.cache_mem_limit_percent as u64
        };

        let cache = Arc::new(FileCache::new(
            config.cache_root.clone(),
            hard_limit,
            config.failed_download_cooldown,
            config.download_chunk_bytes,
        ));
        cache
            .load_resident()
            .map_err(|e| CacheError::Config(format!("{e:#}")))?;

        if self.shared.cache.set(cache.clone()).is_err() {
            // lost an init race; the winner owns the sweeper
            return Ok(());
        }
        let sweeper = sweep::spawn_sweeper(
            cache,
            config.cache_eviction_timeslice,
            self.shared.cancel.clone(),
        );
        *self.shared.sweeper.lock().unwrap() = Some(sweeper);
        info!(hard_limit, root = %config.cache_root, "cache layer initialized");
        Ok(())
    }

    /// Stops the sweeper and interrupts in-flight waits.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let sweeper = self.shared.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }

    fn cache(&self) -> Result<&Arc<FileCache>, CacheError> {
        self.shared
            .cache
            .get()
            .ok_or_else(|| CacheError::Config("cache layer is not initialized".to_owned()))
    }

    /// Bytes currently accounted against the hard limit.
    pub fn cache_occupancy(&self) -> u64 {
        self.shared.cache.get().map(|c| c.occupancy()).unwrap_or(0)
    }

    pub fn cached_file_count(&self) -> usize {
        self.shared.cache.get().map(|c| c.file_count()).unwrap_or(0)
    }

    /// Resolves the `"default"` placeholder against the ambient
    /// configuration; other descriptors pass through.
    fn resolve(&self, descriptor: &FilesystemDescriptor) -> Result<FilesystemDescriptor, CacheError> {
        if !descriptor.is_default_placeholder()
            && descriptor.dfs_type != DfsType::DefaultFromConfig
        {
            return Ok(descriptor.clone());
        }
        let mut resolved = self
            .shared
            .remote_config
            .default_descriptor()
            .map_err(|e| CacheError::Config(format!("{e:#}")))?
            .ok_or_else(|| {
                CacheError::Config("fs_default_name is not configured".to_owned())
            })?;
        resolved.credentials = descriptor.credentials.clone();
        resolved.credentials_key = descriptor.credentials_key.clone();
        resolved.effective = true;
        Ok(resolved)
    }

    /// Registers a descriptor; repeated calls for the same routing identity
    /// are no-ops.
    pub fn configure_file_system(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<(), CacheError> {
        let resolved = self.resolve(descriptor)?;
        if resolved.dfs_type == DfsType::Other {
            return Err(CacheError::Config(format!(
                "unknown filesystem type for {resolved}"
            )));
        }
        let mut routing = self.shared.routing.lock().unwrap();
        routing
            .entry(resolved.routing_key())
            .or_insert_with(|| DescriptorEntry {
                pool: ConnectionPool::new(resolved.clone()),
                descriptor: resolved,
            });
        Ok(())
    }

    /// Like [`Self::configure_file_system`] but with a pre-built adapter the
    /// pool vends instead of dialing. This is how fault injection wraps a
    /// filesystem in tests.
    pub fn configure_file_system_with_adapter(
        &self,
        descriptor: &FilesystemDescriptor,
        adapter: GenericRemoteFs,
    ) -> Result<(), CacheError> {
        let resolved = self.resolve(descriptor)?;
        let mut routing = self.shared.routing.lock().unwrap();
        routing
            .entry(resolved.routing_key())
            .or_insert_with(|| DescriptorEntry {
                pool: ConnectionPool::with_adapter(resolved.clone(), adapter),
                descriptor: resolved,
            });
        Ok(())
    }

    pub fn contains_file_system(&self, descriptor: &FilesystemDescriptor) -> bool {
        match self.resolve(descriptor) {
            Ok(resolved) => self
                .shared
                .routing
                .lock()
                .unwrap()
                .contains_key(&resolved.routing_key()),
            Err(_) => false,
        }
    }

    pub fn remove_file_system(&self, descriptor: &FilesystemDescriptor) -> bool {
        match self.resolve(descriptor) {
            Ok(resolved) => self
                .shared
                .routing
                .lock()
                .unwrap()
                .remove(&resolved.routing_key())
                .is_some(),
            Err(_) => false,
        }
    }

    fn entry(&self, descriptor: &FilesystemDescriptor) -> Result<DescriptorEntry, CacheError> {
        let resolved = self.resolve(descriptor)?;
        self.shared
            .routing
            .lock()
            .unwrap()
            .get(&resolved.routing_key())
            .cloned()
            .ok_or_else(|| {
                CacheError::Config(format!("filesystem {resolved} is not registered"))
            })
    }

    fn origin(
        &self,
        entry: &DescriptorEntry,
        path: &RemotePath,
        transform: Option<&str>,
    ) -> RemoteOrigin {
        let origin = RemoteOrigin::new(entry.descriptor.clone(), path.clone());
        match transform {
            Some(transform) => origin.with_transform(transform),
            None => origin,
        }
    }

    /// Inserts (or returns) the cache entry for an origin without starting a
    /// transfer; the producing side happens on open.
    pub fn add(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        transform: Option<&str>,
    ) -> Result<(CachedFile, bool), CacheError> {
        let entry = self.entry(descriptor)?;
        let cache = self.cache()?;
        let origin = self.origin(&entry, path, transform);
        let (file, admitted) =
            cache.add(&namespace::local_path(cache.root(), &origin), FileNature::Physical);
        file.set_origin(&origin);
        Ok((file, admitted))
    }

    /// Cache lookup without materialization.
    pub fn find(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        transform: Option<&str>,
    ) -> Result<Option<CachedFile>, CacheError> {
        let entry = self.entry(descriptor)?;
        let cache = self.cache()?;
        let origin = self.origin(&entry, path, transform);
        Ok(cache.find(&namespace::local_path(cache.root(), &origin)))
    }

    /// Drops a single cached artifact; physical removal honors pins.
    pub fn delete_file(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        transform: Option<&str>,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(descriptor)?;
        let cache = self.cache()?;
        let origin = self.origin(&entry, path, transform);
        Ok(cache.remove(&namespace::local_path(cache.root(), &origin), true))
    }

    /// Best-effort removal of every cached artifact under a remote prefix.
    pub fn delete_path(
        &self,
        descriptor: &FilesystemDescriptor,
        prefix: &RemotePath,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(descriptor)?;
        let cache = self.cache()?;
        let origin = self.origin(&entry, prefix, None);
        Ok(cache.delete_prefix(&namespace::local_path(cache.root(), &origin)))
    }

    /// Opens a scan target. Remote reads resolve through the cache (waiting
    /// on or becoming the producer); writes to remote filesystems create a
    /// CREATE_FROM_SELECT pair uploaded on close.
    pub async fn open(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        options: OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<FileHandle, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry
            .pool
            .lease(&self.shared.bridge)
            .await
            .map_err(|_| CacheError::NotReachable(entry.descriptor.to_string()))?;

        match options.mode {
            OpenMode::Read if entry.descriptor.is_local() => {
                let reader = lease.fs().open_read(path).await?;
                Ok(FileHandle::direct_read(lease, reader))
            }
            OpenMode::Read => {
                let cache = self.cache()?;
                let origin = self.origin(&entry, path, options.transform.as_deref());
                let ctx = DownloadContext {
                    cache,
                    bridge: &self.shared.bridge,
                    fs: lease.fs(),
                    cancel,
                    wait_deadline: options.wait_timeout,
                    strict_capacity: options.strict_capacity,
                };
                let pin = cache
                    .find_or_download(&origin, &ctx)
                    .await
                    .map_err(map_download_error)?;
                drop(lease);
                let local = remote_fs::LocalFs::new();
                let local_remote_path = RemotePath::new(pin.local_path())
                    .map_err(|e| CacheError::Config(e.to_string()))?;
                let reader = local.open_read(&local_remote_path).await?;
                Ok(FileHandle::cached_read(pin, reader))
            }
            OpenMode::Write if entry.descriptor.is_local() => {
                let writer = lease
                    .fs()
                    .create_write(path, options.create_options())
                    .await?;
                Ok(FileHandle::direct_write(lease, writer))
            }
            OpenMode::Write => {
                let cache = self.cache()?;
                let origin = self.origin(&entry, path, None);
                let local_path = namespace::local_path(cache.root(), &origin);

                let (file, _) = cache.add(&local_path, FileNature::CreateFromSelect);
                file.set_origin(&origin);
                let previous_size = match file.state() {
                    FileState::New | FileState::Failed { .. } | FileState::Deleted => None,
                    FileState::Ready { size } | FileState::Evicting { size } => Some(size),
                    FileState::Downloading => {
                        return Err(CacheError::Config(format!(
                            "{local_path} is already being produced"
                        )))
                    }
                };
                file.set_state(FileState::Downloading);

                let local = remote_fs::LocalFs::new();
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| CacheError::Other(e.into()))?;
                }
                let local_remote_path = RemotePath::new(&local_path)
                    .map_err(|e| CacheError::Config(e.to_string()))?;
                let writer = local
                    .create_write(
                        &local_remote_path,
                        remote_fs::CreateOptions {
                            overwrite: true,
                            ..Default::default()
                        },
                    )
                    .await?;

                self.register_create_from_select(
                    local_path.clone(),
                    CfsPair {
                        descriptor: entry.descriptor.clone(),
                        remote_path: path.clone(),
                    },
                );
                Ok(FileHandle::create_from_select(
                    self.clone(),
                    lease,
                    writer,
                    file,
                    local_path,
                    previous_size,
                    options,
                ))
            }
        }
    }

    pub fn register_create_from_select(&self, local_path: Utf8PathBuf, pair: CfsPair) {
        let mut pairs = self.shared.cfs_pairs.lock().unwrap();
        if pairs.insert(local_path.clone(), pair).is_some() {
            warn!(%local_path, "replacing an existing create-from-select registration");
        }
    }

    /// Removes and returns the registration; the second call for the same
    /// local path comes back empty.
    pub fn unregister_create_from_select(&self, local_path: &Utf8Path) -> Option<CfsPair> {
        self.shared.cfs_pairs.lock().unwrap().remove(local_path)
    }

    // -- namespace and stat surface, routed through the bridge --------------

    pub async fn exists(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        force: bool,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(self
            .shared
            .bridge
            .exists(lease.fs(), &entry.descriptor, path, force)
            .await?)
    }

    pub async fn path_info(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        force: bool,
    ) -> Result<FsObjectStatus, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(self
            .shared
            .bridge
            .file_status(lease.fs(), &entry.descriptor, path, force)
            .await?)
    }

    pub async fn list_status(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        force: bool,
    ) -> Result<Vec<FsObjectStatus>, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(self
            .shared
            .bridge
            .list_status(lease.fs(), &entry.descriptor, path, force)
            .await?)
    }

    pub async fn block_locations(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
    ) -> Result<Vec<BlockLocation>, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(self
            .shared
            .bridge
            .block_locations(lease.fs(), &entry.descriptor, path)
            .await?)
    }

    pub async fn create_directory(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
    ) -> Result<(), CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        lease.fs().create_directory(path).await?;
        self.shared
            .bridge
            .meta_cache()
            .invalidate(&entry.descriptor, path);
        Ok(())
    }

    /// Renames the remote object. The cached copy of the old name is
    /// dropped; `move` is the same operation.
    pub async fn rename(
        &self,
        descriptor: &FilesystemDescriptor,
        from: &RemotePath,
        to: &RemotePath,
    ) -> Result<(), CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        lease.fs().rename(from, to).await?;
        let meta = self.shared.bridge.meta_cache();
        meta.invalidate(&entry.descriptor, from);
        meta.invalidate(&entry.descriptor, to);
        let _ = self.delete_file(descriptor, from, None);
        Ok(())
    }

    /// Deletes the remote object and drops any cached copy.
    pub async fn delete(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        recursive: bool,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        let deleted = lease.fs().delete(path, recursive).await?;
        self.shared
            .bridge
            .meta_cache()
            .invalidate(&entry.descriptor, path);
        if recursive {
            let _ = self.delete_path(descriptor, path);
        } else {
            let _ = self.delete_file(descriptor, path, None);
        }
        Ok(deleted)
    }

    pub async fn copy(
        &self,
        descriptor: &FilesystemDescriptor,
        from: &RemotePath,
        to: &RemotePath,
    ) -> Result<(), CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        lease.fs().copy(from, to).await?;
        self.shared
            .bridge
            .meta_cache()
            .invalidate(&entry.descriptor, to);
        Ok(())
    }

    pub async fn chown(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        lease.fs().chown(path, owner, group).await?;
        self.shared
            .bridge
            .meta_cache()
            .invalidate(&entry.descriptor, path);
        Ok(())
    }

    pub async fn chmod(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        mode: u32,
    ) -> Result<(), CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        lease.fs().chmod(path, mode).await?;
        self.shared
            .bridge
            .meta_cache()
            .invalidate(&entry.descriptor, path);
        Ok(())
    }

    pub async fn set_replication(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        replication: u32,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(lease.fs().set_replication(path, replication).await?)
    }

    pub async fn get_capacity(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<u64, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(lease.fs().get_capacity().await?)
    }

    pub async fn get_used(&self, descriptor: &FilesystemDescriptor) -> Result<u64, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(lease.fs().get_used().await?)
    }

    pub async fn get_default_block_size(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<u64, CacheError> {
        let entry = self.entry(descriptor)?;
        let lease = entry.pool.lease(&self.shared.bridge).await?;
        Ok(lease.fs().default_block_size())
    }
}

pub(crate) fn map_download_error(e: DownloadError) -> CacheError {
    match e {
        DownloadError::Cancelled => CacheError::Cancelled,
        DownloadError::WaitTimeout => CacheError::Timeout,
        DownloadError::Failed(msg) => CacheError::RemoteIO(msg),
        DownloadError::Deleted => {
            CacheError::RemoteIO("cache entry deleted while resolving".to_owned())
        }
        DownloadError::CapacityExceeded => CacheError::CapacityExceeded(
            "admission would exceed the hard limit and over-commit was refused".to_owned(),
        ),
    }
}
