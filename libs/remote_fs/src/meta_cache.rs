//! Process-lifetime cache of remote object metadata.
//!
//! Layout follows the directory structure of the remote side: stat data of a
//! single object is stored as child metadata on its parent directory's
//! entry, a directory listing is stored on the directory's own entry. There
//! is no eviction; entries live until explicitly invalidated or until the
//! bridge overwrites them with fresher observations.
//!
//! Two levels of locking would be overkill here: all structural updates are
//! short, so one `RwLock` over the nested maps is enough. Writers hold it
//! only while splicing an entry.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{DfsType, FilesystemDescriptor, FsObjectStatus, RemotePath};

/// Tri-state existence answer. `Unknown` means the cache has nothing
/// authoritative and the caller must go remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Exists,
    DoesNotExist,
    Unknown,
}

/// Synchronization state of a directory entry with the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SyncState {
    #[default]
    SyncOk,
    /// The last bridge call for this entry failed terminally; cached reads
    /// return nothing so the next query is forced remote.
    SyncFailure,
}

#[derive(Default)]
struct DirEntry {
    state: SyncState,
    /// True once a full `list_status` of this directory has been stored;
    /// only then is the children map an exhaustive listing.
    listed: bool,
    children: HashMap<String, ChildMeta>,
}

#[derive(Default)]
struct ChildMeta {
    existence: Option<bool>,
    status: Option<FsObjectStatus>,
}

type DescriptorKey = (DfsType, String);

/// Directory path a child is keyed under; the top level is the empty string.
fn parent_key(path: &RemotePath) -> (String, String) {
    let dir = path.parent().map(|p| p.as_str().to_owned()).unwrap_or_default();
    let name = path.object_name().unwrap_or_default().to_owned();
    (dir, name)
}

#[derive(Default)]
pub struct MetaCache {
    inner: RwLock<HashMap<DescriptorKey, HashMap<String, DirEntry>>>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn existence(&self, descriptor: &FilesystemDescriptor, path: &RemotePath) -> Existence {
        let (dir, name) = parent_key(path);
        let inner = self.inner.read().unwrap();
        let Some(entry) = inner
            .get(&descriptor.routing_key())
            .and_then(|dirs| dirs.get(&dir))
        else {
            return Existence::Unknown;
        };
        if entry.state == SyncState::SyncFailure {
            return Existence::Unknown;
        }
        match entry.children.get(&name).and_then(|c| c.existence) {
            Some(true) => Existence::Exists,
            Some(false) => Existence::DoesNotExist,
            // An exhaustive listing is authoritative about absence too.
            None if entry.listed => Existence::DoesNotExist,
            None => Existence::Unknown,
        }
    }

    pub fn status(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
    ) -> Option<FsObjectStatus> {
        let (dir, name) = parent_key(path);
        let inner = self.inner.read().unwrap();
        let entry = inner
            .get(&descriptor.routing_key())
            .and_then(|dirs| dirs.get(&dir))?;
        if entry.state == SyncState::SyncFailure {
            return None;
        }
        entry.children.get(&name).and_then(|c| c.status.clone())
    }

    /// The exhaustive listing of `dir`, if one has been stored and has not
    /// been invalidated since.
    pub fn listing(
        &self,
        descriptor: &FilesystemDescriptor,
        dir: &RemotePath,
    ) -> Option<Vec<FsObjectStatus>> {
        let inner = self.inner.read().unwrap();
        let entry = inner
            .get(&descriptor.routing_key())
            .and_then(|dirs| dirs.get(dir.as_str()))?;
        if entry.state == SyncState::SyncFailure || !entry.listed {
            return None;
        }
        Some(entry.children.values().filter_map(|c| c.status.clone()).collect())
    }

    pub fn record_existence(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        exists: bool,
    ) {
        let (dir, name) = parent_key(path);
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entry(descriptor.routing_key())
            .or_default()
            .entry(dir)
            .or_default();
        entry.state = SyncState::SyncOk;
        let child = entry.children.entry(name).or_default();
        child.existence = Some(exists);
        if !exists {
            child.status = None;
        }
    }

    pub fn record_status(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &RemotePath,
        status: FsObjectStatus,
    ) {
        let (dir, name) = parent_key(path);
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entry(descriptor.routing_key())
            .or_default()
            .entry(dir)
            .or_default();
        entry.state = SyncState::SyncOk;
        let child = entry.children.entry(name).or_default();
        child.existence = Some(true);
        child.status = Some(status);
    }

    pub fn record_listing(
        &self,
        descriptor: &FilesystemDescriptor,
        dir: &RemotePath,
        children: &[FsObjectStatus],
    ) {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entry(descriptor.routing_key())
            .or_default()
            .entry(dir.as_str().to_owned())
            .or_default();
        entry.state = SyncState::SyncOk;
        entry.listed = true;
        entry.children.clear();
        for status in children {
            let name = status.path.object_name().unwrap_or_default().to_owned();
            entry.children.insert(
                name,
                ChildMeta {
                    existence: Some(true),
                    status: Some(status.clone()),
                },
            );
        }
    }

    /// Terminal bridge failure: poison the entry so subsequent queries for
    /// the same key carry `force` semantics.
    pub fn record_failure(&self, descriptor: &FilesystemDescriptor, path: &RemotePath) {
        let (dir, _name) = parent_key(path);
        let mut inner = self.inner.write().unwrap();
        let dirs = inner.entry(descriptor.routing_key()).or_default();
        dirs.entry(dir).or_default().state = SyncState::SyncFailure;
        // A failed listing also poisons the entry keyed by the path itself.
        if let Some(entry) = dirs.get_mut(path.as_str()) {
            entry.state = SyncState::SyncFailure;
        }
    }

    /// Drops everything known about `path`: its child record on the parent
    /// and, when `path` is a directory, its own listing entry.
    pub fn invalidate(&self, descriptor: &FilesystemDescriptor, path: &RemotePath) {
        let (dir, name) = parent_key(path);
        let mut inner = self.inner.write().unwrap();
        let Some(dirs) = inner.get_mut(&descriptor.routing_key()) else {
            return;
        };
        if let Some(entry) = dirs.get_mut(&dir) {
            entry.children.remove(&name);
            // The listing is no longer exhaustive once a child is unknown.
            entry.listed = false;
        }
        dirs.remove(path.as_str());
    }

    pub fn invalidate_descriptor(&self, descriptor: &FilesystemDescriptor) {
        self.inner
            .write()
            .unwrap()
            .remove(&descriptor.routing_key());
    }
}
