//! End-to-end scenarios against a scratch-directory "remote": the cache
//! registry drives a fault-injectable local adapter standing in for a
//! remote filesystem, exactly the way the unreliable wrapper is used in the
//! unit tests of the mediator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use camino_tempfile::{tempdir, Utf8TempDir};
use tokio_util::sync::CancellationToken;

use filecache::cached_file::FileState;
use filecache::config::CacheConfig;
use filecache::handle::OpenOptions;
use filecache::registry::CacheRegistry;
use filecache::CacheError;
use remote_fs::simulate_failures::FailurePolicy;
use remote_fs::{
    DfsType, FilesystemDescriptor, FsTimeouts, GenericRemoteFs, LocalFs, RemoteFsConfig,
    RemotePath, UnreliableWrapper,
};

struct TestEnv {
    registry: CacheRegistry,
    descriptor: FilesystemDescriptor,
    wrapper: Arc<UnreliableWrapper>,
    remote_dir: Utf8TempDir,
    _cache_dir: Utf8TempDir,
}

impl TestEnv {
    fn new(policy: FailurePolicy, hard_limit: u64) -> Self {
        Self::with_timeouts(policy, hard_limit, FsTimeouts::default(), Duration::from_secs(60))
    }

    fn with_timeouts(
        policy: FailurePolicy,
        hard_limit: u64,
        timeouts: FsTimeouts,
        cooldown: Duration,
    ) -> Self {
        let remote_dir = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();

        let wrapper = Arc::new(UnreliableWrapper::new(
            GenericRemoteFs::LocalFs(LocalFs::new()),
            policy,
        ));

        let cache_config = CacheConfig {
            cache_root: cache_dir.path().to_path_buf(),
            cache_size_hard_limit: hard_limit,
            failed_download_cooldown: cooldown,
            ..CacheConfig::default()
        };
        let remote_config = RemoteFsConfig {
            timeouts,
            ..RemoteFsConfig::default()
        };

        let registry = CacheRegistry::new(cache_config, remote_config);
        registry.init().unwrap();

        let descriptor = FilesystemDescriptor::new(DfsType::Hdfs, "nn1", 8020);
        registry
            .configure_file_system_with_adapter(
                &descriptor,
                GenericRemoteFs::Unreliable(wrapper.clone()),
            )
            .unwrap();

        TestEnv {
            registry,
            descriptor,
            wrapper,
            remote_dir,
            _cache_dir: cache_dir,
        }
    }

    fn put_remote(&self, name: &str, payload: &[u8]) -> RemotePath {
        let path = self.remote_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, payload).unwrap();
        RemotePath::new(&path).unwrap()
    }

    fn remote_path(&self, name: &str) -> RemotePath {
        RemotePath::new(&self.remote_dir.path().join(name)).unwrap()
    }

    async fn read_all(&self, path: &RemotePath) -> Result<Vec<u8>, CacheError> {
        let cancel = CancellationToken::new();
        let mut handle = self
            .registry
            .open(&self.descriptor, path, OpenOptions::read(), &cancel)
            .await?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = handle.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        handle.close().await?;
        Ok(out)
    }
}

// A cached artifact is served without touching the remote side again.
#[tokio::test]
async fn hit_serves_without_remote_calls() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), u64::MAX);
    let payload = vec![42u8; 10_000];
    let remote = env.put_remote("a/b/c.parq", &payload);

    assert_eq!(env.read_all(&remote).await.unwrap(), payload);
    let calls_after_miss = env.wrapper.calls_made();
    assert!(calls_after_miss >= 1);

    assert_eq!(env.read_all(&remote).await.unwrap(), payload);
    assert_eq!(env.wrapper.calls_made(), calls_after_miss, "hit must not go remote");

    let cached = env
        .registry
        .find(&env.descriptor, &remote, None)
        .unwrap()
        .expect("artifact is cached");
    assert!(matches!(cached.state(), FileState::Ready { size } if size == payload.len() as u64));
}

// One producer per fingerprint no matter how many concurrent misses.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_elect_one_producer() {
    let env = Arc::new(TestEnv::new(FailurePolicy::fail_first(0), u64::MAX));
    let payload = vec![7u8; 50_000];
    let remote = env.put_remote("x", &payload);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let env = env.clone();
        let remote = remote.clone();
        tasks.spawn(async move { env.read_all(&remote).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), payload);
    }

    assert_eq!(env.wrapper.calls_made(), 1, "exactly one download may start");
    assert_eq!(env.registry.cache_occupancy(), payload.len() as u64);
    let cached = env
        .registry
        .find(&env.descriptor, &remote, None)
        .unwrap()
        .expect("cached after the race");
    assert!(matches!(cached.state(), FileState::Ready { size } if size == payload.len() as u64));
}

// Weighted LRU eviction with pinning, through the public surface.
#[tokio::test]
async fn eviction_honors_lru_order_and_pins() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), 100_000);
    let size = 30_000usize;
    let f1 = env.put_remote("f1", &vec![1u8; size]);
    let f2 = env.put_remote("f2", &vec![2u8; size]);
    let f3 = env.put_remote("f3", &vec![3u8; size]);
    let f4 = env.put_remote("f4", &vec![4u8; size]);
    let f5 = env.put_remote("f5", &vec![5u8; size]);

    env.read_all(&f1).await.unwrap();
    env.read_all(&f2).await.unwrap();
    env.read_all(&f3).await.unwrap();

    // f4 admission breaches the bound; f1 is the oldest touch
    env.read_all(&f4).await.unwrap();
    assert_eq!(env.registry.cache_occupancy(), 90_000);
    assert!(env.registry.find(&env.descriptor, &f1, None).unwrap().is_none());

    // hold a live handle on f2 (the LRU), refresh f3 and f4 behind it
    let cancel = CancellationToken::new();
    let mut pinned = env
        .registry
        .open(&env.descriptor, &f2, OpenOptions::read(), &cancel)
        .await
        .unwrap();
    env.read_all(&f3).await.unwrap();
    env.read_all(&f4).await.unwrap();

    // f5 admission: f3 evicts, pinned f2 survives despite being LRU
    env.read_all(&f5).await.unwrap();
    assert!(env.registry.cache_occupancy() <= 100_000);
    assert!(env.registry.find(&env.descriptor, &f2, None).unwrap().is_some());
    assert!(env.registry.find(&env.descriptor, &f3, None).unwrap().is_none());

    // the pinned handle still reads its bytes
    let mut buf = vec![0u8; 16];
    let n = pinned.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &vec![2u8; 16][..]);
    pinned.close().await.unwrap();
}

// A dead remote surfaces as a typed timeout within the schedule budget.
#[tokio::test]
async fn timeout_propagates_within_schedule_budget() {
    let env = TestEnv::with_timeouts(
        FailurePolicy::hang(),
        u64::MAX,
        FsTimeouts {
            timeout_base: Duration::from_millis(100),
            retries: 2,
            backoff_step: Duration::from_millis(20),
        },
        Duration::from_secs(60),
    );
    let path = env.remote_path("never");

    let started = Instant::now();
    let err = env
        .registry
        .path_info(&env.descriptor, &path, false)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, CacheError::Timeout), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(340), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "too slow: {elapsed:?}");
}

// A failed producer parks the fingerprint for a cooldown; no new
// producer starts until it expires.
#[tokio::test]
async fn failure_cooldown_suppresses_retries() {
    let env = TestEnv::with_timeouts(
        FailurePolicy::fail_first(1),
        u64::MAX,
        FsTimeouts::default(),
        Duration::from_millis(400),
    );
    let payload = vec![9u8; 1000];
    let remote = env.put_remote("flaky", &payload);

    let err = env.read_all(&remote).await.unwrap_err();
    assert!(matches!(err, CacheError::RemoteIO(_)), "got {err:?}");
    assert_eq!(env.wrapper.calls_made(), 1);

    for _ in 0..3 {
        let err = env.read_all(&remote).await.unwrap_err();
        assert!(matches!(err, CacheError::RemoteIO(_)), "got {err:?}");
    }
    assert_eq!(env.wrapper.calls_made(), 1, "cooldown must not start producers");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.read_all(&remote).await.unwrap(), payload);
    assert_eq!(env.wrapper.calls_made(), 2);
}

// CREATE_FROM_SELECT output lands in the cache and in its remote sink;
// the registration is consumed exactly once.
#[tokio::test]
async fn create_from_select_uploads_on_close() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), u64::MAX);
    let remote = env.remote_path("out/part-0.parq");
    let payload = vec![6u8; 4096];

    let cancel = CancellationToken::new();
    let mut handle = env
        .registry
        .open(&env.descriptor, &remote, OpenOptions::write(), &cancel)
        .await
        .unwrap();
    handle.write(&payload).await.unwrap();
    let written = handle.close().await.unwrap();
    assert_eq!(written, payload.len() as u64);

    // the remote sink received the bytes
    let uploaded = std::fs::read(env.remote_dir.path().join("out/part-0.parq")).unwrap();
    assert_eq!(uploaded, payload);

    // the local output is cache-resident
    let cached = env
        .registry
        .find(&env.descriptor, &remote, None)
        .unwrap()
        .expect("output is cached");
    assert!(matches!(cached.state(), FileState::Ready { size } if size == payload.len() as u64));

    // the registration was consumed by the close
    assert!(env
        .registry
        .unregister_create_from_select(cached.local_path())
        .is_none());
}

// Waiters accept a deadline independent of the producer's fate.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_deadline_fires_while_producer_hangs() {
    let env = Arc::new(TestEnv::with_timeouts(
        FailurePolicy::hang(),
        u64::MAX,
        FsTimeouts {
            timeout_base: Duration::from_secs(2),
            retries: 0,
            backoff_step: Duration::from_millis(10),
        },
        Duration::from_secs(60),
    ));
    let path = env.remote_path("slow");

    let producer = {
        let env = env.clone();
        let path = path.clone();
        tokio::spawn(async move { env.read_all(&path).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let options = OpenOptions {
        wait_timeout: Some(Duration::from_millis(100)),
        ..OpenOptions::read()
    };
    let started = Instant::now();
    let err = env
        .registry
        .open(&env.descriptor, &path, options, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    // the producer eventually fails on its own schedule
    let producer_result = producer.await.unwrap();
    assert!(producer_result.is_err());
}

// A cancelled producer leaves no artifact and the next open starts fresh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_aborts_producer_cleanly() {
    let env = Arc::new(TestEnv::with_timeouts(
        FailurePolicy::hang(),
        u64::MAX,
        FsTimeouts {
            timeout_base: Duration::from_secs(30),
            retries: 0,
            backoff_step: Duration::from_millis(10),
        },
        Duration::from_secs(60),
    ));
    let payload = vec![3u8; 2000];
    let remote = env.put_remote("cancelme", &payload);

    let cancel = CancellationToken::new();
    let producer = {
        let env = env.clone();
        let remote = remote.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            env.registry
                .open(&env.descriptor, &remote, OpenOptions::read(), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::Cancelled), "got {err:?}");
    assert!(env.registry.find(&env.descriptor, &remote, None).unwrap().is_none());
    assert_eq!(env.registry.cache_occupancy(), 0);

    // swap in a healthy adapter under the same routing identity
    assert!(env.registry.remove_file_system(&env.descriptor));
    env.registry
        .configure_file_system_with_adapter(
            &env.descriptor,
            GenericRemoteFs::LocalFs(LocalFs::new()),
        )
        .unwrap();
    assert_eq!(env.read_all(&remote).await.unwrap(), payload);
}

// The configuration surface: staged setup, idempotent init, frozen after.
#[tokio::test]
async fn staged_configuration_and_idempotent_init() {
    let cache_dir = tempdir().unwrap();
    let registry = CacheRegistry::new(CacheConfig::default(), RemoteFsConfig::default());

    // init without a root is a configuration error
    assert!(matches!(registry.init(), Err(CacheError::Config(_))));

    registry.configure_local_storage(cache_dir.path()).unwrap();
    registry
        .configure_size_limits(50, 1_000_000, Duration::from_secs(5))
        .unwrap();
    registry.init().unwrap();
    registry.init().unwrap();

    // sizing is frozen once initialized
    assert!(matches!(
        registry.configure_size_limits(10, 1, Duration::from_secs(1)),
        Err(CacheError::Config(_))
    ));
    assert!(matches!(
        registry.configure_local_storage(cache_dir.path()),
        Err(CacheError::Config(_))
    ));

    let missing_root = Utf8PathBuf::from("/definitely/not/here");
    let other = CacheRegistry::new(CacheConfig::default(), RemoteFsConfig::default());
    assert!(matches!(
        other.configure_local_storage(&missing_root),
        Err(CacheError::Config(_))
    ));

    registry.shutdown().await;
}

// Local descriptors bypass the cache: direct I/O, nothing admitted.
#[tokio::test]
async fn local_descriptor_is_direct() {
    let data_dir = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    let cache_config = CacheConfig {
        cache_root: cache_dir.path().to_path_buf(),
        cache_size_hard_limit: u64::MAX,
        ..CacheConfig::default()
    };
    let registry = CacheRegistry::new(cache_config, RemoteFsConfig::default());
    registry.init().unwrap();
    let descriptor = FilesystemDescriptor::local();
    registry.configure_file_system(&descriptor).unwrap();

    let path = RemotePath::new(&data_dir.path().join("direct.dat")).unwrap();
    let cancel = CancellationToken::new();

    let mut writer = registry
        .open(&descriptor, &path, OpenOptions::write(), &cancel)
        .await
        .unwrap();
    writer.write(b"direct bytes").await.unwrap();
    writer.close().await.unwrap();

    let mut reader = registry
        .open(&descriptor, &path, OpenOptions::read(), &cancel)
        .await
        .unwrap();
    let mut buf = vec![0u8; 64];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"direct bytes");
    reader.close().await.unwrap();

    assert_eq!(registry.cached_file_count(), 0);
    assert_eq!(registry.cache_occupancy(), 0);
}

// A dirty artifact is re-materialized on the next unpinned open.
#[tokio::test]
async fn dirty_flag_forces_redownload() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), u64::MAX);
    let remote = env.put_remote("d", b"old-bytes");
    assert_eq!(env.read_all(&remote).await.unwrap(), b"old-bytes");
    let calls_after_first = env.wrapper.calls_made();

    env.put_remote("d", b"new-bytes!");
    let cached = env
        .registry
        .find(&env.descriptor, &remote, None)
        .unwrap()
        .unwrap();
    cached.mark_dirty();

    assert_eq!(env.read_all(&remote).await.unwrap(), b"new-bytes!");
    assert_eq!(env.wrapper.calls_made(), calls_after_first + 1);
    // accounting follows the new size
    assert_eq!(env.registry.cache_occupancy(), b"new-bytes!".len() as u64);
}

// Opting out of over-commit turns an uncoverable admission into a typed
// capacity error instead of a transient limit breach.
#[tokio::test]
async fn strict_capacity_refuses_overcommit() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), 10_000);
    let a = env.put_remote("a", &vec![1u8; 8_000]);
    let b = env.put_remote("b", &vec![2u8; 8_000]);

    // make `a` resident and pin it so nothing is evictable
    env.read_all(&a).await.unwrap();
    let cancel = CancellationToken::new();
    let _pin = env
        .registry
        .open(&env.descriptor, &a, OpenOptions::read(), &cancel)
        .await
        .unwrap();

    let options = OpenOptions {
        strict_capacity: true,
        ..OpenOptions::read()
    };
    let err = env
        .registry
        .open(&env.descriptor, &b, options, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::CapacityExceeded(_)), "got {err:?}");
    assert!(env.registry.find(&env.descriptor, &b, None).unwrap().is_none());

    // the default mode admits the same file and over-commits transiently
    assert_eq!(env.read_all(&b).await.unwrap(), vec![2u8; 8_000]);
}

// A closed handle answers InvalidHandle, not garbage.
#[tokio::test]
async fn closed_handle_is_invalid() {
    let env = TestEnv::new(FailurePolicy::fail_first(0), u64::MAX);
    let remote = env.put_remote("once", b"payload");

    let cancel = CancellationToken::new();
    let mut handle = env
        .registry
        .open(&env.descriptor, &remote, OpenOptions::read(), &cancel)
        .await
        .unwrap();
    handle.close().await.unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        handle.read(&mut buf).await,
        Err(CacheError::InvalidHandle)
    ));
    assert!(matches!(handle.close().await, Err(CacheError::InvalidHandle)));
}
