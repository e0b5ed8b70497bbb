//! Cache sizing and placement knobs.
//!
//! The embedding engine owns the configuration file; this module owns the
//! key names and defaults for the cache section and a helper that splits
//! one TOML document into the cache and mediator halves.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use remote_fs::RemoteFsConfig;

pub mod defaults {
    use std::time::Duration;

    /// `cache_eviction_timeslice`: cadence of the background sweep.
    pub const DEFAULT_EVICTION_TIMESLICE: Duration = Duration::from_secs(10);

    /// `cache_mem_limit_percent`: share of the cache volume the cache may
    /// occupy when no explicit hard limit is configured.
    pub const DEFAULT_MEM_LIMIT_PERCENT: u8 = 80;

    /// Cooldown before a failed download may be attempted again.
    pub const DEFAULT_FAILED_DOWNLOAD_COOLDOWN: Duration = Duration::from_secs(10);

    /// Producer copy chunk; also the unit at which a hung transfer is
    /// detected.
    pub const DEFAULT_DOWNLOAD_CHUNK: usize = 1024 * 1024;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_root: Utf8PathBuf,

    /// Hard bound on Σ size of READY and EVICTING files. Zero means derive
    /// it from the cache volume's capacity and `cache_mem_limit_percent`.
    pub cache_size_hard_limit: u64,

    pub cache_mem_limit_percent: u8,

    #[serde(with = "humantime_serde")]
    pub cache_eviction_timeslice: Duration,

    #[serde(with = "humantime_serde")]
    pub failed_download_cooldown: Duration,

    pub download_chunk_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_root: Utf8PathBuf::new(),
            cache_size_hard_limit: 0,
            cache_mem_limit_percent: defaults::DEFAULT_MEM_LIMIT_PERCENT,
            cache_eviction_timeslice: defaults::DEFAULT_EVICTION_TIMESLICE,
            failed_download_cooldown: defaults::DEFAULT_FAILED_DOWNLOAD_COOLDOWN,
            download_chunk_bytes: defaults::DEFAULT_DOWNLOAD_CHUNK,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.cache_root.as_str().is_empty(),
            "cache_root is not configured"
        );
        anyhow::ensure!(
            self.cache_mem_limit_percent > 0 && self.cache_mem_limit_percent <= 100,
            "cache_mem_limit_percent must be within (0, 100], got {}",
            self.cache_mem_limit_percent
        );
        anyhow::ensure!(
            !self.cache_eviction_timeslice.is_zero(),
            "cache_eviction_timeslice must be positive"
        );
        Ok(())
    }
}

/// Splits one TOML document into the cache and mediator configurations.
/// Unknown keys are left for the embedding engine's own sections.
pub fn parse_toml(document: &str) -> anyhow::Result<(CacheConfig, RemoteFsConfig)> {
    let cache: CacheConfig =
        toml_edit::de::from_str(document).map_err(|e| anyhow::anyhow!("bad cache config: {e}"))?;
    cache.validate()?;
    let remote: RemoteFsConfig = toml_edit::de::from_str(document)
        .map_err(|e| anyhow::anyhow!("bad filesystem config: {e}"))?;
    Ok((cache, remote))
}
