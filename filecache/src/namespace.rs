//! Deterministic mapping from a remote origin to a unique local path.
//!
//! `cache_root / fs_type / host[_port] / escaped-remote-path [ / xform-<hex8> ]`
//!
//! The mapping is a pure function of its inputs: no wall clock, no pid, no
//! access order. Any node of the cluster derives the same string for the
//! same origin, which is what lets cache identities survive across requests
//! and processes, and lets startup enumerate the cache from the directory
//! tree alone.

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use remote_fs::{FilesystemDescriptor, RemotePath};

/// A cacheable artifact's identity: where the bytes come from and the
/// optional transform applied on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrigin {
    pub descriptor: FilesystemDescriptor,
    pub path: RemotePath,
    pub transform: Option<String>,
}

impl RemoteOrigin {
    pub fn new(descriptor: FilesystemDescriptor, path: RemotePath) -> Self {
        RemoteOrigin {
            descriptor,
            path,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        let transform = transform.into();
        self.transform = (!transform.is_empty()).then_some(transform);
        self
    }
}

/// Escapes one path segment. Alphanumerics and `. _ -` pass through; `%`
/// and everything else becomes `%XX`, which keeps the mapping collision-free
/// and reversible.
fn escape_segment(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for &byte in segment.as_bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                escaped.push(byte as char)
            }
            _ => {
                escaped.push('%');
                escaped.push_str(&format!("{byte:02X}"));
            }
        }
    }
    escaped
}

fn host_segment(descriptor: &FilesystemDescriptor) -> String {
    if descriptor.host.is_empty() {
        return "local".to_owned();
    }
    let host = escape_segment(&descriptor.host);
    if descriptor.port == 0 {
        host
    } else {
        format!("{host}_{}", descriptor.port)
    }
}

/// Hash suffix directory for transformed artifacts, so the same object
/// fetched with different transforms gets distinct residency.
fn transform_segment(transform: &str) -> String {
    let digest = Sha256::digest(transform.as_bytes());
    format!("xform-{}", hex::encode(&digest[..4]))
}

/// The local path an origin materializes at. Pure; see module comment.
pub fn local_path(cache_root: &Utf8Path, origin: &RemoteOrigin) -> Utf8PathBuf {
    let mut path = cache_root.to_path_buf();
    path.push(origin.descriptor.dfs_type.scheme());
    path.push(host_segment(&origin.descriptor));
    for segment in origin.path.get_path().components() {
        path.push(escape_segment(segment.as_str()));
    }
    if let Some(transform) = origin.transform.as_deref() {
        path.push(transform_segment(transform));
    }
    path
}
