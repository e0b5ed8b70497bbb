//! The cache engine: an index of cached files weighted by on-disk size,
//! with admission that makes room by evicting the least recently touched
//! unpinned files.
//!
//! Accounting invariant: `total_bytes` is the sum of sizes over READY and
//! EVICTING files, both indexed ones and those parked on the deferred
//! eviction list. A file stops counting only when its bytes actually leave
//! the disk. DOWNLOADING files weigh nothing until the producer reconciles
//! them on READY.
//!
//! Lock discipline: the index mutex is held for map surgery only, never
//! across filesystem calls or awaits; victims are unlinked after release.
//! Per-file state locks nest inside the index lock (index → file order).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::cached_file::{CachedFile, DownloadContext, DownloadError, FileNature, FilePin, FileState};
use crate::metrics::{EvictionReason, CACHE_METRICS};
use crate::namespace::{self, RemoteOrigin};

struct CacheIndex {
    files: HashMap<Utf8PathBuf, CachedFile>,
    /// Monotonic access counter; total order over touches, ties impossible.
    tick: u64,
    total_bytes: u64,
}

pub struct FileCache {
    root: Utf8PathBuf,
    hard_limit: u64,
    failure_cooldown: Duration,
    download_chunk: usize,
    inner: Mutex<CacheIndex>,
    /// Files whose physical removal is reserved but deferred: still pinned,
    /// or their unlink failed. The sweeper finishes the job.
    evicting: Mutex<Vec<(CachedFile, u64)>>,
}

impl FileCache {
    pub fn new(
        root: Utf8PathBuf,
        hard_limit: u64,
        failure_cooldown: Duration,
        download_chunk: usize,
    ) -> Self {
        FileCache {
            root,
            hard_limit,
            failure_cooldown,
            download_chunk,
            inner: Mutex::new(CacheIndex {
                files: HashMap::new(),
                tick: 0,
                total_bytes: 0,
            }),
            evicting: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    pub(crate) fn failure_cooldown(&self) -> Duration {
        self.failure_cooldown
    }

    pub(crate) fn download_chunk(&self) -> usize {
        self.download_chunk
    }

    /// Bytes accounted against the hard limit.
    pub fn occupancy(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn file_count(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }

    /// O(1) lookup; a hit counts as an access and refreshes eviction order.
    pub fn find(&self, local_path: &Utf8Path) -> Option<CachedFile> {
        let mut index = self.inner.lock().unwrap();
        let file = index.files.get(local_path)?.clone();
        if matches!(file.state(), FileState::Deleted) {
            index.files.remove(local_path);
            return None;
        }
        index.tick += 1;
        file.touch(index.tick);
        Some(file)
    }

    /// Inserts a NEW file if the path is vacant. The winner of a concurrent
    /// insert race is returned either way; the loser observes
    /// `admitted == false` and must not start a second producer.
    pub fn add(&self, local_path: &Utf8Path, nature: FileNature) -> (CachedFile, bool) {
        let mut index = self.inner.lock().unwrap();
        index.tick += 1;
        let tick = index.tick;
        if let Some(existing) = index.files.get(local_path) {
            if !matches!(existing.state(), FileState::Deleted) {
                let existing = existing.clone();
                existing.touch(tick);
                return (existing, false);
            }
        }
        let file = CachedFile::new(local_path.to_path_buf(), nature);
        file.touch(tick);
        index.files.insert(local_path.to_path_buf(), file.clone());
        CACHE_METRICS.resident_files.set(index.files.len() as i64);
        (file, true)
    }

    /// The full miss-to-pin path: index insert, producer election, wait or
    /// transfer, admission reconciliation.
    pub(crate) async fn find_or_download(
        &self,
        origin: &RemoteOrigin,
        ctx: &DownloadContext<'_>,
    ) -> Result<FilePin, DownloadError> {
        let local_path = namespace::local_path(&self.root, origin);
        // a file deleted underneath a waiter is retried with a fresh entry;
        // two rounds of that means something is actively deleting this path
        for _ in 0..3 {
            let (file, _admitted) = self.add(&local_path, FileNature::Physical);
            file.set_origin(origin);
            match file.ensure_ready(ctx).await {
                Ok(pin) => {
                    let mut index = self.inner.lock().unwrap();
                    index.tick += 1;
                    file.touch(index.tick);
                    return Ok(pin);
                }
                Err(DownloadError::Deleted) => {
                    self.forget(&file);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DownloadError::Deleted)
    }

    /// Producer callback on READY: account the fresh bytes and make room.
    pub(crate) fn reconcile_admission(
        &self,
        file: &CachedFile,
        new_size: u64,
        redownload_of: Option<u64>,
    ) {
        let victims = {
            let mut index = self.inner.lock().unwrap();
            if let Some(old) = redownload_of {
                index.total_bytes = index.total_bytes.saturating_sub(old);
            }
            index.total_bytes += new_size;
            CACHE_METRICS.occupancy_bytes.set(index.total_bytes as i64);

            let still_indexed = index
                .files
                .get(file.local_path())
                .is_some_and(|indexed| indexed.same(file));
            if !still_indexed {
                // removed while downloading; the bytes stay accounted until
                // the sweeper can drop them
                drop(index);
                if let FileState::Ready { size } = file.state() {
                    file.set_state(FileState::Evicting { size });
                }
                self.evicting.lock().unwrap().push((file.clone(), new_size));
                return;
            }

            self.select_victims(&mut index, Some(file.local_path()))
        };
        self.unlink_victims(victims, EvictionReason::MakeRoom);
    }

    /// Drops the index entry if it still refers to this incarnation.
    pub(crate) fn forget(&self, file: &CachedFile) {
        let mut index = self.inner.lock().unwrap();
        if index
            .files
            .get(file.local_path())
            .is_some_and(|indexed| indexed.same(file))
        {
            index.files.remove(file.local_path());
            CACHE_METRICS.resident_files.set(index.files.len() as i64);
        }
    }

    /// Unlinks a file from the index; with `physical`, also schedules the
    /// bytes for removal, deferred while pins exist. Returns whether the
    /// path was known.
    pub fn remove(&self, local_path: &Utf8Path, physical: bool) -> bool {
        let file = {
            let mut index = self.inner.lock().unwrap();
            let file = index.files.remove(local_path);
            if let Some(file) = &file {
                if let Some(size) = file.size() {
                    if !physical {
                        // the bytes leave cache management entirely
                        index.total_bytes = index.total_bytes.saturating_sub(size);
                        CACHE_METRICS.occupancy_bytes.set(index.total_bytes as i64);
                    }
                }
                CACHE_METRICS.resident_files.set(index.files.len() as i64);
            }
            file
        };
        let Some(file) = file else {
            return false;
        };
        if !physical {
            return true;
        }
        match file.try_begin_eviction() {
            Some(size) => self.unlink_victims(vec![(file, size)], EvictionReason::Explicit),
            None => match file.state() {
                FileState::Ready { size } | FileState::Evicting { size } => {
                    // pinned; reserve and let the sweeper finish
                    file.set_state(FileState::Evicting { size });
                    self.evicting.lock().unwrap().push((file, size));
                }
                FileState::New | FileState::Downloading => {
                    // the producer's reconciliation notices the missing
                    // index entry and parks the result for the sweeper
                }
                FileState::Failed { .. } | FileState::Deleted => {
                    file.set_state(FileState::Deleted);
                }
            },
        }
        true
    }

    /// Best-effort bulk removal of everything under a local prefix.
    pub fn delete_prefix(&self, prefix: &Utf8Path) -> bool {
        let matching: Vec<Utf8PathBuf> = {
            let index = self.inner.lock().unwrap();
            index
                .files
                .keys()
                .filter(|p| p.starts_with(prefix))
                .cloned()
                .collect()
        };
        let mut any = false;
        for path in &matching {
            any |= self.remove(path, true);
        }
        // leftover directories (and files the index never knew about), but
        // never the bytes of a still-pinned file parked for deferred removal
        let pinned_residue = self
            .evicting
            .lock()
            .unwrap()
            .iter()
            .any(|(file, _)| file.local_path().starts_with(prefix));
        if pinned_residue {
            return any;
        }
        match std::fs::remove_dir_all(prefix) {
            Ok(()) => any = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(%prefix, "bulk removal left residue: {e}"),
        }
        any
    }

    /// Re-admits everything under the cache root, oldest mtime first so the
    /// eviction order picks up roughly where the previous process left off.
    /// Stray temporaries are removed.
    pub fn load_resident(&self) -> anyhow::Result<usize> {
        use std::os::unix::fs::MetadataExt;
        let mut found: Vec<(Utf8PathBuf, u64, u64, SystemTime)> = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(anyhow::Error::new(e).context(format!("listing {dir}"))),
            };
            for entry in entries {
                let entry = entry?;
                let path = Utf8PathBuf::from_path_buf(entry.path())
                    .map_err(|bad| anyhow::anyhow!("non-utf8 path {bad:?} under cache root"))?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    stack.push(path);
                } else if crate::is_temporary(&path) {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(%path, "failed to remove stray temporary: {e}");
                    }
                } else {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((path, meta.len(), meta.ino(), mtime));
                }
            }
        }
        found.sort_by_key(|(_, _, _, mtime)| *mtime);

        let admitted = found.len();
        let victims = {
            let mut index = self.inner.lock().unwrap();
            for (path, size, ino, _) in found {
                index.tick += 1;
                let tick = index.tick;
                let file = CachedFile::new_resident(path.clone(), FileNature::Physical, size);
                file.touch(tick);
                file.set_ino(ino);
                index.total_bytes += size;
                index.files.insert(path, file);
            }
            CACHE_METRICS.resident_files.set(index.files.len() as i64);
            CACHE_METRICS.occupancy_bytes.set(index.total_bytes as i64);
            self.select_victims(&mut index, None)
        };
        self.unlink_victims(victims, EvictionReason::Sweep);
        info!(admitted, occupancy = self.occupancy(), "cache loaded from disk");
        Ok(admitted)
    }

    /// One pass of the background sweeper: finish deferred evictions whose
    /// pins are gone, drop expired FAILED entries, then re-enforce the size
    /// bound.
    pub fn sweep(&self) {
        CACHE_METRICS.sweep_iterations.inc();

        {
            // an expired FAILED entry carries no bytes; dropping it lets the
            // next lookup start clean instead of tripping over stale state
            let now = std::time::Instant::now();
            let mut index = self.inner.lock().unwrap();
            index.files.retain(|_, file| {
                !matches!(file.state(), FileState::Failed { retry_at, .. } if retry_at <= now)
            });
            CACHE_METRICS.resident_files.set(index.files.len() as i64);
        }

        let ready_to_unlink: Vec<(CachedFile, u64)> = {
            let mut parked = self.evicting.lock().unwrap();
            let mut still_parked = Vec::new();
            let mut ready = Vec::new();
            for (file, size) in parked.drain(..) {
                if file.is_pinned() {
                    still_parked.push((file, size));
                } else {
                    ready.push((file, size));
                }
            }
            *parked = still_parked;
            ready
        };
        self.unlink_victims(ready_to_unlink, EvictionReason::Sweep);

        let victims = {
            let mut index = self.inner.lock().unwrap();
            self.select_victims(&mut index, None)
        };
        self.unlink_victims(victims, EvictionReason::Sweep);
    }

    /// Picks eviction victims in ascending last-access order until the
    /// projected occupancy fits the bound. Pinned and in-flight files are
    /// skipped; the admission that could not be covered is allowed to
    /// overshoot. Selected victims are reserved (EVICTING) and removed from
    /// the index while the lock is held.
    fn select_victims(
        &self,
        index: &mut CacheIndex,
        exclude: Option<&Utf8Path>,
    ) -> Vec<(CachedFile, u64)> {
        if index.total_bytes <= self.hard_limit {
            return Vec::new();
        }
        let mut candidates: Vec<CachedFile> = index
            .files
            .values()
            .filter(|f| Some(f.local_path()) != exclude)
            .cloned()
            .collect();
        candidates.sort_by_key(|f| f.last_access_tick());

        let mut victims = Vec::new();
        let mut projected = index.total_bytes;
        for file in candidates {
            if projected <= self.hard_limit {
                break;
            }
            // pinned files and in-flight downloads fail the reservation
            let Some(size) = file.try_begin_eviction() else {
                continue;
            };
            index.files.remove(file.local_path());
            projected = projected.saturating_sub(size);
            victims.push((file, size));
        }
        CACHE_METRICS.resident_files.set(index.files.len() as i64);
        if projected > self.hard_limit {
            CACHE_METRICS.overshoot.inc();
            warn!(
                occupancy = projected,
                hard_limit = self.hard_limit,
                "cache exceeds its hard limit; nothing evictable is left"
            );
        }
        victims
    }

    /// Physically removes reserved victims. An unlink failure leaves the
    /// file EVICTING on the deferred list; its bytes stay accounted and the
    /// next sweep retries. A path whose inode no longer matches the
    /// reservation was replaced by a newer incarnation; its old bytes are
    /// already gone, so only the accounting is settled.
    fn unlink_victims(&self, victims: Vec<(CachedFile, u64)>, reason: EvictionReason) {
        use std::os::unix::fs::MetadataExt;
        for (file, size) in victims {
            let owns_path = match std::fs::metadata(file.local_path()) {
                Ok(meta) => file.ino().map_or(true, |ino| meta.ino() == ino),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(path = %file.local_path(), "eviction stat failed, will retry: {e}");
                    CACHE_METRICS.eviction_unlink_failures.inc();
                    self.evicting.lock().unwrap().push((file, size));
                    continue;
                }
            };
            if !owns_path {
                file.set_state(FileState::Deleted);
                self.sub_bytes(size);
                CACHE_METRICS.inc_evicted(reason);
                continue;
            }
            match std::fs::remove_file(file.local_path()) {
                Ok(()) => {
                    file.set_state(FileState::Deleted);
                    self.sub_bytes(size);
                    CACHE_METRICS.inc_evicted(reason);
                    debug!(path = %file.local_path(), size, "evicted");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    file.set_state(FileState::Deleted);
                    self.sub_bytes(size);
                    CACHE_METRICS.inc_evicted(reason);
                }
                Err(e) => {
                    warn!(path = %file.local_path(), "eviction unlink failed, will retry: {e}");
                    CACHE_METRICS.eviction_unlink_failures.inc();
                    self.evicting.lock().unwrap().push((file, size));
                }
            }
        }
    }

    fn sub_bytes(&self, n: u64) {
        let mut index = self.inner.lock().unwrap();
        index.total_bytes = index.total_bytes.saturating_sub(n);
        CACHE_METRICS.occupancy_bytes.set(index.total_bytes as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::{tempdir, Utf8TempDir};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const MIB: u64 = 1024 * 1024;

    fn cache_with_limit(dir: &Utf8TempDir, limit: u64) -> FileCache {
        FileCache::new(
            dir.path().to_path_buf(),
            limit,
            Duration::from_secs(1),
            64 * 1024,
        )
    }

    /// Writes real bytes and admits them READY, the way a finished producer
    /// would.
    fn admit(cache: &FileCache, dir: &Utf8TempDir, name: &str, size: u64) -> CachedFile {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; size as usize]).unwrap();
        let (file, admitted) = cache.add(&path, FileNature::Physical);
        assert!(admitted, "{name} admitted twice");
        file.set_state(FileState::Ready { size });
        cache.reconcile_admission(&file, size, None);
        file
    }

    #[test]
    fn add_returns_the_race_winner() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, u64::MAX);
        let path = dir.path().join("f");
        let (first, admitted_first) = cache.add(&path, FileNature::Physical);
        let (second, admitted_second) = cache.add(&path, FileNature::Physical);
        assert!(admitted_first);
        assert!(!admitted_second);
        assert!(first.same(&second));
    }

    #[test]
    fn find_touches_access_order() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, u64::MAX);
        let a = admit(&cache, &dir, "a", 10);
        let b = admit(&cache, &dir, "b", 10);
        assert!(a.last_access_tick() < b.last_access_tick());
        cache.find(a.local_path()).unwrap();
        assert!(a.last_access_tick() > b.last_access_tick());
    }

    // 100 MiB bound, four 30 MiB files, then a fifth with a pin in the way.
    #[test]
    fn admission_evicts_lru_and_respects_pins() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, 100 * MIB);

        let f1 = admit(&cache, &dir, "f1", 30 * MIB);
        let _f2 = admit(&cache, &dir, "f2", 30 * MIB);
        let _f3 = admit(&cache, &dir, "f3", 30 * MIB);
        assert_eq!(cache.occupancy(), 90 * MIB);

        // f4 pushes to 120 MiB; f1 is the least recently touched
        let _f4 = admit(&cache, &dir, "f4", 30 * MIB);
        assert_eq!(cache.occupancy(), 90 * MIB);
        assert!(matches!(f1.state(), FileState::Deleted));
        assert!(!dir.path().join("f1").exists());

        // pin f2, leave it the least recently touched, and admit f5:
        // f3 goes instead, f2 survives despite being the LRU
        let f2 = cache.find(&dir.path().join("f2")).unwrap();
        let pin = f2.pin();
        let f3 = cache.find(&dir.path().join("f3")).unwrap();
        let f4 = cache.find(&dir.path().join("f4")).unwrap();
        assert!(f2.last_access_tick() < f3.last_access_tick());
        assert!(f3.last_access_tick() < f4.last_access_tick());

        let _f5 = admit(&cache, &dir, "f5", 30 * MIB);
        assert!(dir.path().join("f2").exists(), "pinned LRU file must survive");
        assert!(!dir.path().join("f3").exists());
        assert!(dir.path().join("f4").exists());
        assert!(cache.occupancy() <= 100 * MIB);
        drop(pin);
    }

    #[test]
    fn overshoot_when_everything_is_pinned() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, 50 * MIB);
        let a = admit(&cache, &dir, "a", 30 * MIB);
        let _pin_a = a.pin();
        let b = admit(&cache, &dir, "b", 30 * MIB);
        let _pin_b = b.pin();
        // nothing evictable: admission still succeeded, bound exceeded
        assert_eq!(cache.occupancy(), 60 * MIB);
        assert!(dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());
    }

    /// After a randomized access trace, the evicted set is exactly the
    /// least-recently-touched prefix needed to fit the bound.
    #[test]
    fn randomized_trace_evicts_the_lru_prefix() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, 10 * MIB);

        let names: Vec<String> = (0..8).map(|i| format!("f{i}")).collect();
        let files: Vec<CachedFile> = names
            .iter()
            .map(|name| admit(&cache, &dir, name, MIB))
            .collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1CEB00DA);
        let mut order: Vec<usize> = (0..files.len()).collect();
        order.shuffle(&mut rng);
        for &i in &order {
            cache.find(files[i].local_path()).unwrap();
        }

        // 8 MiB resident; a 5 MiB admission must evict exactly the three
        // least recently touched files
        admit(&cache, &dir, "big", 5 * MIB);
        assert!(cache.occupancy() <= 10 * MIB);

        let (expect_evicted, expect_kept) = order.split_at(3);
        for &i in expect_evicted {
            assert!(
                matches!(files[i].state(), FileState::Deleted),
                "expected {} evicted",
                names[i]
            );
        }
        for &i in expect_kept {
            assert!(
                matches!(files[i].state(), FileState::Ready { .. }),
                "expected {} kept",
                names[i]
            );
        }
    }

    #[test]
    fn remove_without_physical_keeps_bytes() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, u64::MAX);
        let f = admit(&cache, &dir, "f", 100);
        assert!(cache.remove(f.local_path(), false));
        assert!(dir.path().join("f").exists());
        assert_eq!(cache.occupancy(), 0);
        assert!(cache.find(&dir.path().join("f")).is_none());
    }

    #[test]
    fn delete_prefix_is_bulk() {
        let dir = tempdir().unwrap();
        let cache = cache_with_limit(&dir, u64::MAX);
        std::fs::create_dir_all(dir.path().join("t")).unwrap();
        admit(&cache, &dir, "t/a", 10);
        admit(&cache, &dir, "t/b", 10);
        admit(&cache, &dir, "keep", 10);

        assert!(cache.delete_prefix(&dir.path().join("t")));
        assert!(!dir.path().join("t").exists());
        assert!(dir.path().join("keep").exists());
        assert_eq!(cache.occupancy(), 10);
        assert_eq!(cache.file_count(), 1);
    }

    #[test]
    fn load_resident_recovers_and_cleans_temporaries() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hdfs/nn1")).unwrap();
        std::fs::write(dir.path().join("hdfs/nn1/good"), vec![0u8; 123]).unwrap();
        std::fs::write(
            dir.path().join(format!("hdfs/nn1/partial{}", crate::TEMP_FILE_SUFFIX)),
            vec![0u8; 55],
        )
        .unwrap();

        let cache = cache_with_limit(&dir, u64::MAX);
        let admitted = cache.load_resident().unwrap();
        assert_eq!(admitted, 1);
        assert_eq!(cache.occupancy(), 123);
        assert!(!dir
            .path()
            .join(format!("hdfs/nn1/partial{}", crate::TEMP_FILE_SUFFIX))
            .exists());

        let found = cache.find(&dir.path().join("hdfs/nn1/good")).unwrap();
        assert!(matches!(found.state(), FileState::Ready { size: 123 }));
    }
}
