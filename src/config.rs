use crate::coords::REGION_VOLUME;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_BLOCK_BITS: u32 = 6;
pub const MAX_BLOCK_BITS: u32 = 20;
pub const MAX_ENTRIES: u32 = 1 << 20;

/// Geometry and idle policy of a single region file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionFileConfig {
    /// Block size is `1 << block_bits` bytes.
    pub block_bits: u32,
    pub entries: u32,
    pub idle_timeout_ms: u64,
    /// `sync_data` after every committed entry write.
    pub sync_on_commit: bool,
    /// Released blocks waiting for a header checkpoint before a commit writes one itself. The
    /// effective limit is the larger of this and the blocks held by live entries.
    pub checkpoint_pending_blocks: u32,
}

impl Default for RegionFileConfig {
    fn default() -> Self {
        Self {
            block_bits: 9,
            entries: REGION_VOLUME as u32,
            idle_timeout_ms: 120_000,
            sync_on_commit: false,
            checkpoint_pending_blocks: 64,
        }
    }
}

impl RegionFileConfig {
    pub fn new(block_bits: u32, entries: u32) -> Self {
        Self {
            block_bits,
            entries,
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.block_bits
    }

    pub fn entry_count(&self) -> usize {
        self.entries as usize
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if !(MIN_BLOCK_BITS..=MAX_BLOCK_BITS).contains(&self.block_bits) {
            return Err(StoreError::InvalidConfig(format!(
                "block_bits {} outside {MIN_BLOCK_BITS}..={MAX_BLOCK_BITS}",
                self.block_bits
            )));
        }
        if self.entries == 0 || self.entries > MAX_ENTRIES {
            return Err(StoreError::InvalidConfig(format!(
                "entries {} outside 1..={MAX_ENTRIES}",
                self.entries
            )));
        }
        Ok(())
    }
}

/// Settings for a directory of region files managed by [`RegionFileCache`](crate::cache::RegionFileCache).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionStoreConfig {
    pub root: PathBuf,
    pub file_extension: String,
    pub region: RegionFileConfig,
    pub sweep_interval_ms: u64,
}

impl Default for RegionStoreConfig {
    fn default() -> Self {
        Self::with_defaults(PathBuf::from("saves/regions"))
    }
}

impl RegionStoreConfig {
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_extension: "srf".to_string(),
            region: RegionFileConfig::default(),
            sweep_interval_ms: 1_000,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.file_extension.is_empty() || self.file_extension.contains(['.', '/', '\\']) {
            return Err(StoreError::InvalidConfig(format!(
                "file extension {:?} must be a single non-empty name component",
                self.file_extension
            )));
        }
        if self.region.entries != REGION_VOLUME as u32 {
            return Err(StoreError::InvalidConfig(format!(
                "region entries {} must be {REGION_VOLUME}, one per chunk of a region",
                self.region.entries
            )));
        }
        self.region.validate()
    }

    pub fn load_json(path: &Path) -> Result<Self, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

    fn test_path(name: &str) -> PathBuf {
        let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "region-store-config-{name}-{}-{}.json",
            std::process::id(),
            serial
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn defaults_are_valid() {
        let config = RegionStoreConfig::default();
        config.validate().expect("default config valid");
        assert_eq!(config.region.block_size(), 512);
        assert_eq!(config.region.entry_count(), 4096);
        assert_eq!(config.region.idle_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_out_of_range_geometry() {
        assert!(RegionFileConfig::new(5, 16).validate().is_err());
        assert!(RegionFileConfig::new(21, 16).validate().is_err());
        assert!(RegionFileConfig::new(9, 0).validate().is_err());
        assert!(RegionFileConfig::new(9, MAX_ENTRIES + 1).validate().is_err());
        assert!(RegionFileConfig::new(9, 128).validate().is_ok());

        let mut config = RegionStoreConfig::with_defaults("regions");
        config.file_extension = "a.b".to_string();
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn store_requires_one_entry_per_chunk() {
        let mut config = RegionStoreConfig::with_defaults("regions");
        config.region = RegionFileConfig::new(9, 128);
        assert!(config.region.validate().is_ok());
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(message)) if message.contains("4096")
        ));

        config.region.entries = REGION_VOLUME as u32 + 1;
        assert!(config.validate().is_err());
        config.region.entries = REGION_VOLUME as u32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_round_trip_and_partial_documents() {
        let path = test_path("roundtrip");
        let mut config = RegionStoreConfig::with_defaults("world/regions");
        config.region = RegionFileConfig::new(10, 4096).with_idle_timeout(Duration::from_millis(250));
        config.save_json(&path).expect("save config");
        let loaded = RegionStoreConfig::load_json(&path).expect("load config");
        assert_eq!(loaded, config);

        std::fs::write(&path, r#"{ "region": { "block_bits": 12 } }"#).expect("write partial");
        let partial = RegionStoreConfig::load_json(&path).expect("load partial");
        assert_eq!(partial.region.block_bits, 12);
        assert_eq!(partial.region.entries, 4096);
        assert_eq!(partial.region.checkpoint_pending_blocks, 64);
        assert_eq!(partial.file_extension, "srf");
        let _ = std::fs::remove_file(&path);
    }
}
