//! Receive datapath configuration
//!
//! All sizes and feature selections are read once at startup. Feature
//! selections map onto the strategy objects in
//! [`datapath::policy`](crate::datapath::policy).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datapath::desc_pool::{MAX_POOL_DESCS, MAX_POOLS};
use crate::stats::MAX_RINGS;

/// Largest refill or completion ring
pub const MAX_RING_ENTRIES: usize = 1 << 16;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How intra-BSS forwarding eligibility is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeMode {
    /// Forward only on vdevs with the AP-bridge flag set
    #[default]
    ApBridgeFlag,
    /// Forward on every vdev that is not a station
    NonStation,
}

/// Optional receive features, resolved into strategy objects at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Enforce the WDS 3/4-address acceptance policy
    pub wds_vendor_extension: bool,
    /// Mesh exclusion filter and mesh receive info
    pub mesh: bool,
    pub bridge_mode: BridgeMode,
    /// DA and source-port learning hooks
    pub wds_learning: bool,
    /// DA learning for hardware without AST override
    pub da_war: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            wds_vendor_extension: true,
            mesh: true,
            bridge_mode: BridgeMode::ApBridgeFlag,
            wds_learning: true,
            da_war: false,
        }
    }
}

/// Receive datapath configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxConfig {
    /// Radios; each owns one descriptor pool and one refill ring
    pub pdevs: usize,
    /// Completion rings, each serviced by its own worker
    pub reo_rings: usize,
    pub refill_ring_entries: usize,
    pub reo_ring_entries: usize,
    /// Descriptor pool capacity as a multiple of the refill ring size
    pub desc_multiplier: usize,
    /// Sub-units drained per service call
    pub quota: usize,
    /// Total allocation/mapping attempts per buffer
    pub alloc_map_retry: u32,
    /// Attach checksum-offload hints
    pub process_rx_status: bool,
    /// Attach receive-offload (GRO/LRO) hints to TCP frames
    pub gro_enabled: bool,
    /// Timestamp buffers in the second pass
    pub delay_stats: bool,
    /// Highest valid AST index
    pub max_ast_index: u16,
    pub features: FeatureConfig,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            pdevs: 1,
            reo_rings: 4,
            refill_ring_entries: 4096,
            reo_ring_entries: 1024,
            desc_multiplier: 1,
            quota: 64,
            alloc_map_retry: 20,
            process_rx_status: true,
            gro_enabled: true,
            delay_stats: false,
            max_ast_index: 2048,
            features: FeatureConfig::default(),
        }
    }
}

impl RxConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: RxConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Descriptor pool capacity per radio
    pub fn pool_capacity(&self) -> Result<usize, ConfigError> {
        self.desc_multiplier
            .checked_mul(self.refill_ring_entries)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "pool capacity {} x {} overflows",
                    self.desc_multiplier, self.refill_ring_entries
                ))
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pdevs == 0 || self.pdevs > MAX_POOLS {
            return Err(ConfigError::Invalid(format!(
                "pdevs must be 1..={MAX_POOLS}, got {}",
                self.pdevs
            )));
        }
        if self.reo_rings == 0 || self.reo_rings > MAX_RINGS {
            return Err(ConfigError::Invalid(format!(
                "reo_rings must be 1..={MAX_RINGS}, got {}",
                self.reo_rings
            )));
        }
        for (name, entries) in [
            ("refill_ring_entries", self.refill_ring_entries),
            ("reo_ring_entries", self.reo_ring_entries),
        ] {
            if !(2..=MAX_RING_ENTRIES).contains(&entries) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be 2..={MAX_RING_ENTRIES}, got {entries}"
                )));
            }
        }
        if self.desc_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "desc_multiplier must be non-zero".to_string(),
            ));
        }
        let capacity = self.pool_capacity()?;
        if capacity > MAX_POOL_DESCS {
            return Err(ConfigError::Invalid(format!(
                "pool capacity {capacity} exceeds {MAX_POOL_DESCS} descriptors"
            )));
        }
        if self.quota == 0 {
            return Err(ConfigError::Invalid("quota must be non-zero".to_string()));
        }
        if self.alloc_map_retry == 0 {
            return Err(ConfigError::Invalid(
                "alloc_map_retry must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = RxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity().unwrap(), 4096);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RxConfig = serde_json::from_str(
            r#"{"quota": 16, "features": {"mesh": false, "bridge_mode": "non-station"}}"#,
        )
        .unwrap();
        assert_eq!(config.quota, 16);
        assert_eq!(config.reo_rings, 4);
        assert!(!config.features.mesh);
        assert!(config.features.wds_vendor_extension);
        assert_eq!(config.features.bridge_mode, BridgeMode::NonStation);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_quota = RxConfig {
            quota: 0,
            ..Default::default()
        };
        assert!(matches!(zero_quota.validate(), Err(ConfigError::Invalid(_))));

        let huge_pool = RxConfig {
            desc_multiplier: 1024,
            ..Default::default()
        };
        assert!(huge_pool.validate().is_err());

        let too_many_rings = RxConfig {
            reo_rings: MAX_RINGS + 1,
            ..Default::default()
        };
        assert!(too_many_rings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_rings() {
        let huge_reo = RxConfig {
            reo_ring_entries: MAX_RING_ENTRIES + 1,
            ..Default::default()
        };
        assert!(matches!(huge_reo.validate(), Err(ConfigError::Invalid(_))));

        let largest = RxConfig {
            reo_ring_entries: MAX_RING_ENTRIES,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn test_pool_capacity_overflow_rejected() {
        let config: RxConfig = serde_json::from_str(&format!(
            r#"{{"desc_multiplier": {}, "refill_ring_entries": 4096}}"#,
            usize::MAX / 2
        ))
        .unwrap();
        assert!(matches!(config.pool_capacity(), Err(ConfigError::Invalid(_))));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pdevs": 2, "refill_ring_entries": 256}}"#).unwrap();

        let config = RxConfig::load(file.path()).unwrap();
        assert_eq!(config.pdevs, 2);
        assert_eq!(config.refill_ring_entries, 256);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"alloc_map_retry": 0}}"#).unwrap();
        assert!(matches!(
            RxConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(
            RxConfig::load(garbage.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
