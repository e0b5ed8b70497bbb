//! The bridge: every metadata round-trip to a remote filesystem goes through
//! here, wrapped in the interruptible executor and the retry schedule, with
//! results published to the metadata cache.
//!
//! The schedule is arithmetic, not exponential: the delay before retry `k`
//! (1-indexed) is `k * backoff_step`. Retries happen only on timeouts and
//! transport failures; an answer the caller merely dislikes (a successful
//! `false`, a `NotFound`) is terminal.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::executor::{TaskExecutor, TaskOutcome};
use crate::meta_cache::{Existence, MetaCache};
use crate::{
    BlockLocation, FilesystemDescriptor, FsError, FsObjectStatus, GenericRemoteFs, RemoteFsConfig,
    RemotePath,
};

pub struct FsBridge {
    executor: Arc<TaskExecutor>,
    meta: Arc<MetaCache>,
    config: RemoteFsConfig,
}

impl FsBridge {
    pub fn new(executor: Arc<TaskExecutor>, meta: Arc<MetaCache>, config: RemoteFsConfig) -> Self {
        FsBridge {
            executor,
            meta,
            config,
        }
    }

    pub fn meta_cache(&self) -> &Arc<MetaCache> {
        &self.meta
    }

    pub fn config(&self) -> &RemoteFsConfig {
        &self.config
    }

    /// Dials the filesystem a descriptor names, under the descriptor's
    /// timeout schedule. Terminal failure means the descriptor is not
    /// reachable, which is how the connection pool surfaces it.
    pub async fn get_file_system(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<GenericRemoteFs, FsError> {
        let result = self
            .retry(descriptor, "dial", {
                let descriptor = descriptor.clone();
                let config = self.config.clone();
                move || {
                    let descriptor = descriptor.clone();
                    let config = config.clone();
                    async move { GenericRemoteFs::dial(&descriptor, &config).await }
                }
            })
            .await;
        match result {
            Ok(fs) => Ok(fs),
            Err(FsError::Timeout) | Err(FsError::Other(_)) => Err(FsError::NotReachable),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(
        &self,
        fs: &GenericRemoteFs,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        force: bool,
    ) -> Result<bool, FsError> {
        if !force {
            match self.meta.existence(descriptor, path) {
                Existence::Exists => return Ok(true),
                Existence::DoesNotExist => return Ok(false),
                Existence::Unknown => {}
            }
        }
        let result = self
            .retry(descriptor, "exists", {
                let fs = fs.clone();
                let path = path.clone();
                move || {
                    let fs = fs.clone();
                    let path = path.clone();
                    async move { fs.exists(&path).await }
                }
            })
            .await;
        match &result {
            Ok(exists) => self.meta.record_existence(descriptor, path, *exists),
            Err(_) => self.meta.record_failure(descriptor, path),
        }
        result
    }

    pub async fn file_status(
        &self,
        fs: &GenericRemoteFs,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        force: bool,
    ) -> Result<FsObjectStatus, FsError> {
        if !force {
            if let Some(status) = self.meta.status(descriptor, path) {
                return Ok(status);
            }
        }
        let result = self
            .retry(descriptor, "file_status", {
                let fs = fs.clone();
                let path = path.clone();
                move || {
                    let fs = fs.clone();
                    let path = path.clone();
                    async move { fs.file_status(&path).await }
                }
            })
            .await;
        match &result {
            Ok(status) => self.meta.record_status(descriptor, path, status.clone()),
            Err(FsError::NotFound) => self.meta.record_existence(descriptor, path, false),
            Err(_) => self.meta.record_failure(descriptor, path),
        }
        result
    }

    pub async fn list_status(
        &self,
        fs: &GenericRemoteFs,
        descriptor: &FilesystemDescriptor,
        dir: &RemotePath,
        force: bool,
    ) -> Result<Vec<FsObjectStatus>, FsError> {
        if !force {
            if let Some(listing) = self.meta.listing(descriptor, dir) {
                return Ok(listing);
            }
        }
        let result = self
            .retry(descriptor, "list_status", {
                let fs = fs.clone();
                let dir = dir.clone();
                move || {
                    let fs = fs.clone();
                    let dir = dir.clone();
                    async move { fs.list_status(&dir).await }
                }
            })
            .await;
        match &result {
            Ok(children) => self.meta.record_listing(descriptor, dir, children),
            Err(_) => self.meta.record_failure(descriptor, dir),
        }
        result
    }

    /// Block locations are read through with the same timeout policy but are
    /// not stored: the metadata cache holds status and existence only.
    pub async fn block_locations(
        &self,
        fs: &GenericRemoteFs,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
    ) -> Result<Vec<BlockLocation>, FsError> {
        self.retry(descriptor, "block_locations", {
            let fs = fs.clone();
            let path = path.clone();
            move || {
                let fs = fs.clone();
                let path = path.clone();
                async move { fs.block_locations(&path).await }
            }
        })
        .await
    }

    /// The retry loop shared by all mediated calls. `make` synthesizes a
    /// fresh work unit per attempt; each attempt runs under the executor's
    /// per-attempt budget.
    async fn retry<T, F, Fut>(
        &self,
        descriptor: &FilesystemDescriptor,
        op: &str,
        make: F,
    ) -> Result<T, FsError>
    where
        T: Send + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FsError>> + Send + 'static,
    {
        let timeouts = self.config.timeouts_for(descriptor);
        let mut retries_done = 0u32;
        loop {
            let error = match self.executor.run(timeouts.timeout_base, make()).await {
                TaskOutcome::Ok(value) => {
                    if retries_done > 0 {
                        info!(%descriptor, op, retries_done, "remote call recovered");
                    }
                    return Ok(value);
                }
                TaskOutcome::Failure(e) if e.is_permanent() => return Err(e),
                TaskOutcome::Failure(e) => e,
                TaskOutcome::Timeout => FsError::Timeout,
            };
            if retries_done >= timeouts.retries {
                warn!(%descriptor, op, attempts = retries_done + 1, "remote call failed terminally: {error:#}");
                return Err(error);
            }
            retries_done += 1;
            let delay = timeouts.backoff_step * retries_done;
            warn!(%descriptor, op, retry = retries_done, ?delay, "remote call failed, backing off: {error:#}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate_failures::{FailurePolicy, UnreliableWrapper};
    use crate::{DfsType, FsTimeouts, LocalFs};
    use camino_tempfile::tempdir;
    use std::time::Duration;

    fn test_config(timeout: Duration, retries: u32, step: Duration) -> RemoteFsConfig {
        RemoteFsConfig {
            timeouts: FsTimeouts {
                timeout_base: timeout,
                retries,
                backoff_step: step,
            },
            ..RemoteFsConfig::default()
        }
    }

    fn bridge(config: RemoteFsConfig) -> FsBridge {
        FsBridge::new(
            Arc::new(TaskExecutor::new(8)),
            Arc::new(MetaCache::new()),
            config,
        )
    }

    fn local_descriptor() -> FilesystemDescriptor {
        FilesystemDescriptor::new(DfsType::Local, "", 0)
    }

    #[tokio::test]
    async fn retries_until_success() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("obj"), b"payload")
            .await
            .unwrap();
        let local = GenericRemoteFs::LocalFs(LocalFs::new_with_root(dir.path().to_path_buf()));
        let flaky = GenericRemoteFs::unreliable_wrapper(local, FailurePolicy::fail_first(2));

        let bridge = bridge(test_config(
            Duration::from_secs(1),
            5,
            Duration::from_millis(5),
        ));
        let d = local_descriptor();
        let path = RemotePath::from_string("/obj").unwrap();
        let status = bridge.file_status(&flaky, &d, &path, false).await.unwrap();
        assert_eq!(status.size, 7);
    }

    #[tokio::test]
    async fn terminal_timeout_within_schedule_budget() {
        // timeout 100ms, 2 retries, 20ms step => ~100*3 + 20*(1+2) = 360ms
        let dir = tempdir().unwrap();
        let local = GenericRemoteFs::LocalFs(LocalFs::new_with_root(dir.path().to_path_buf()));
        let hung = GenericRemoteFs::unreliable_wrapper(local, FailurePolicy::hang());

        let bridge = bridge(test_config(
            Duration::from_millis(100),
            2,
            Duration::from_millis(20),
        ));
        let d = local_descriptor();
        let path = RemotePath::from_string("/never").unwrap();

        let started = std::time::Instant::now();
        let err = bridge.exists(&hung, &d, &path, false).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, FsError::Timeout), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(340), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "too slow: {elapsed:?}");
    }

    #[tokio::test]
    async fn successful_false_is_not_retried() {
        let dir = tempdir().unwrap();
        let local = GenericRemoteFs::LocalFs(LocalFs::new_with_root(dir.path().to_path_buf()));
        let counted =
            GenericRemoteFs::unreliable_wrapper(local, FailurePolicy::fail_first(0));

        let bridge = bridge(test_config(
            Duration::from_secs(1),
            5,
            Duration::from_millis(5),
        ));
        let d = local_descriptor();
        let path = RemotePath::from_string("/missing").unwrap();
        assert!(!bridge.exists(&counted, &d, &path, true).await.unwrap());
        let GenericRemoteFs::Unreliable(wrapper) = &counted else {
            unreachable!()
        };
        assert_eq!(wrapper.calls_made(), 1);
    }

    #[tokio::test]
    async fn listing_primes_child_status() {
        // Property: after list_status, file_status of any child is served
        // from the metadata cache without a remote round-trip.
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("t")).await.unwrap();
        tokio::fs::write(dir.path().join("t/a"), b"aa").await.unwrap();
        tokio::fs::write(dir.path().join("t/b"), b"bbb").await.unwrap();
        let local = GenericRemoteFs::LocalFs(LocalFs::new_with_root(dir.path().to_path_buf()));
        let counted = GenericRemoteFs::unreliable_wrapper(local, FailurePolicy::fail_first(0));

        let bridge = bridge(test_config(
            Duration::from_secs(1),
            0,
            Duration::from_millis(5),
        ));
        let d = local_descriptor();
        let t = RemotePath::from_string("/t").unwrap();
        let listing = bridge.list_status(&counted, &d, &t, false).await.unwrap();
        assert_eq!(listing.len(), 2);

        let GenericRemoteFs::Unreliable(wrapper) = &counted else {
            unreachable!()
        };
        let calls_after_listing = wrapper.calls_made();

        let a = RemotePath::from_string("/t/a").unwrap();
        let from_listing = listing.iter().find(|s| s.path == a).unwrap();
        let cached = bridge.file_status(&counted, &d, &a, false).await.unwrap();
        assert_eq!(&cached, from_listing);
        assert_eq!(wrapper.calls_made(), calls_after_listing);
    }
}
