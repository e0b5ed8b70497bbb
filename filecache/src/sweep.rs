//! The background eviction task: at every timeslice it finishes deferred
//! evictions whose pins are gone and re-enforces the size bound that
//! admissions may have transiently overshot.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::cache::FileCache;

/// A random fraction of the period before the first iteration, so many
/// processes restarted together do not sweep in lockstep.
async fn random_init_delay(period: Duration, cancel: &CancellationToken) -> Result<(), ()> {
    let delay = period.mul_f64(rand::thread_rng().gen::<f64>());
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

pub(crate) fn spawn_sweeper(
    cache: Arc<FileCache>,
    timeslice: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            if random_init_delay(timeslice, &cancel).await.is_err() {
                return;
            }
            loop {
                let start = tokio::time::Instant::now();
                cache.sweep();
                debug!(
                    occupancy = cache.occupancy(),
                    files = cache.file_count(),
                    "sweep iteration complete"
                );
                if tokio::time::timeout_at(start + timeslice, cancel.cancelled())
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        }
        .instrument(info_span!("cache_sweeper")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cached_file::{CachedFile, FileNature, FileState};
    use camino_tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancellation() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FileCache::new(
            dir.path().to_path_buf(),
            u64::MAX,
            Duration::from_secs(1),
            1024,
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(cache, Duration::from_secs(1), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn deferred_eviction_finishes_on_next_sweep() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(
            dir.path().to_path_buf(),
            u64::MAX,
            Duration::from_secs(1),
            1024,
        );

        // a pinned file that was explicitly removed stays on disk...
        let target = dir.path().join("f");
        std::fs::write(&target, vec![1u8; 100]).unwrap();
        let file = admit_resident(&cache, &target, 100);
        let pin = file.pin();
        assert!(cache.remove(&target, true));
        cache.sweep();
        assert!(target.exists(), "pinned file must survive the sweep");
        assert!(matches!(file.state(), FileState::Evicting { .. }));

        // ...until the last pin drops and the next sweep runs
        drop(pin);
        cache.sweep();
        assert!(!target.exists());
        assert!(matches!(file.state(), FileState::Deleted));
    }

    fn admit_resident(
        cache: &FileCache,
        path: &camino::Utf8Path,
        size: u64,
    ) -> CachedFile {
        // go through the public insert so index and accounting agree
        let (file, admitted) = cache.add(path, FileNature::Physical);
        assert!(admitted);
        file.set_state(FileState::Ready { size });
        cache.reconcile_admission(&file, size, None);
        file
    }
}
