//! Timeout, retry and default-filesystem knobs for the mediator.
//!
//! The embedding engine parses these out of its own configuration file and
//! hands a ready [`RemoteFsConfig`] to the registry; per-descriptor overrides
//! are matched by `"<scheme>://<host>"`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::{DfsType, FilesystemDescriptor};

pub mod defaults {
    use std::time::Duration;

    /// Per-attempt budget of a mediated call (`fs_timeout_base_ms`).
    pub const DEFAULT_TIMEOUT_BASE: Duration = Duration::from_secs(20);

    /// Attempts after the first one (`fs_retries`).
    pub const DEFAULT_RETRIES: u32 = 5;

    /// Arithmetic backoff step (`fs_backoff_base_ms`): the delay before
    /// retry `k` is `k * step`.
    pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(4);

    /// Upper bound on concurrently executing mediated work units.
    pub const DEFAULT_EXECUTOR_WORKERS: usize = 16;
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Retry schedule of one descriptor (or the process-wide default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FsTimeouts {
    #[serde(rename = "fs_timeout_base_ms", with = "duration_ms")]
    pub timeout_base: Duration,
    #[serde(rename = "fs_retries")]
    pub retries: u32,
    #[serde(rename = "fs_backoff_base_ms", with = "duration_ms")]
    pub backoff_step: Duration,
}

impl Default for FsTimeouts {
    fn default() -> Self {
        FsTimeouts {
            timeout_base: defaults::DEFAULT_TIMEOUT_BASE,
            retries: defaults::DEFAULT_RETRIES,
            backoff_step: defaults::DEFAULT_BACKOFF_STEP,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteFsConfig {
    /// `fs_default_name`, e.g. `hdfs://namenode:8020`. Descriptors carrying
    /// the `"default"` host placeholder are resolved against this URI.
    #[serde(rename = "fs_default_name")]
    pub default_fs_name: Option<String>,

    #[serde(flatten)]
    pub timeouts: FsTimeouts,

    /// Overrides keyed by `"<scheme>://<host>"`.
    #[serde(rename = "fs_overrides")]
    pub per_descriptor: HashMap<String, FsTimeouts>,

    #[serde(rename = "fs_executor_workers")]
    pub executor_workers: usize,

    /// Custom S3 endpoint (minio and friends); applies to all s3n/s3a
    /// descriptors.
    pub s3_endpoint: Option<String>,

    pub s3_region: Option<String>,
}

impl Default for RemoteFsConfig {
    fn default() -> Self {
        RemoteFsConfig {
            default_fs_name: None,
            timeouts: FsTimeouts::default(),
            per_descriptor: HashMap::new(),
            executor_workers: defaults::DEFAULT_EXECUTOR_WORKERS,
            s3_endpoint: None,
            s3_region: None,
        }
    }
}

impl RemoteFsConfig {
    pub fn timeouts_for(&self, descriptor: &FilesystemDescriptor) -> FsTimeouts {
        let key = format!("{}://{}", descriptor.dfs_type.scheme(), descriptor.host);
        self.per_descriptor
            .get(&key)
            .copied()
            .unwrap_or(self.timeouts)
    }

    /// The descriptor the `"default"` placeholder stands for, parsed out of
    /// `fs_default_name`. `None` when the config carries no default.
    pub fn default_descriptor(&self) -> anyhow::Result<Option<FilesystemDescriptor>> {
        let Some(uri) = self.default_fs_name.as_deref() else {
            return Ok(None);
        };
        FilesystemDescriptor::from_uri(uri).map(Some)
    }
}

impl DfsType {
    pub fn scheme(&self) -> &'static str {
        match self {
            DfsType::Local => "file",
            DfsType::Hdfs => "hdfs",
            DfsType::S3n => "s3n",
            DfsType::S3a => "s3a",
            DfsType::Tachyon => "tachyon",
            DfsType::DefaultFromConfig => "default",
            DfsType::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spec_keys_with_overrides() {
        let toml = r#"
            fs_default_name = "hdfs://nn1:8020"
            fs_timeout_base_ms = 100
            fs_retries = 2
            fs_backoff_base_ms = 20

            [fs_overrides."s3a://warehouse"]
            fs_timeout_base_ms = 30000
            fs_retries = 3
            fs_backoff_base_ms = 1000
        "#;
        let config: RemoteFsConfig = toml_edit::de::from_str(toml).unwrap();
        assert_eq!(config.timeouts.timeout_base, Duration::from_millis(100));
        assert_eq!(config.timeouts.retries, 2);
        assert_eq!(config.timeouts.backoff_step, Duration::from_millis(20));

        let d = FilesystemDescriptor::new(DfsType::S3a, "warehouse", 0);
        let t = config.timeouts_for(&d);
        assert_eq!(t.timeout_base, Duration::from_secs(30));
        assert_eq!(t.retries, 3);

        let other = FilesystemDescriptor::new(DfsType::Hdfs, "nn2", 8020);
        assert_eq!(config.timeouts_for(&other), config.timeouts);

        let default_descriptor = config.default_descriptor().unwrap().unwrap();
        assert_eq!(default_descriptor.host, "nn1");
        assert_eq!(default_descriptor.port, 8020);
    }
}
