//! Dispatch configuration.
//!
//! All values are fixed at context construction; nothing here is
//! renegotiated per call.

use serde::{Deserialize, Serialize};

/// Launch-geometry strategy for the batched reshape kernels.
///
/// Whether a 3-D grid actually beats the flat 1-D grid depends on how the
/// device scheduler exploits spatial locality; this stays a context-level
/// switch rather than a per-call decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptLevel {
    /// Flat 1-D grid sized to the total element count.
    Flat1d,
    /// 3-D grid shaped (width-rounded-up, height, batch·channels).
    Spatial3d,
}

/// Configuration for the memory and dispatch layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Launch-geometry strategy for batched reshape kernels.
    pub opt_level: OptLevel,
    /// Local work-group size; global sizes are rounded up to a multiple
    /// of this, with in-kernel bounds checks covering the remainder.
    pub local_size: usize,
    /// Local work-group size for the masked gather kernel.
    pub mask_local_size: usize,
    /// Platform index (0-based) for device enumeration.
    pub platform_index: usize,
    /// Device index within the platform (0-based).
    pub device_index: usize,
    /// Number of in-order command queues per device.
    pub queue_count: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Spatial3d,
            local_size: 64,
            mask_local_size: 256,
            platform_index: 0,
            device_index: 0,
            queue_count: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opt_level_is_3d() {
        assert_eq!(DispatchConfig::default().opt_level, OptLevel::Spatial3d);
    }

    #[test]
    fn default_local_size() {
        assert_eq!(DispatchConfig::default().local_size, 64);
    }

    #[test]
    fn default_mask_local_size() {
        assert_eq!(DispatchConfig::default().mask_local_size, 256);
    }

    #[test]
    fn default_single_queue() {
        assert_eq!(DispatchConfig::default().queue_count, 1);
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = DispatchConfig { opt_level: OptLevel::Flat1d, ..Default::default() };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DispatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.opt_level, OptLevel::Flat1d);
        assert_eq!(back.local_size, cfg.local_size);
    }

    #[test]
    fn config_override_indices() {
        let cfg = DispatchConfig { platform_index: 1, device_index: 2, ..Default::default() };
        assert_eq!(cfg.platform_index, 1);
        assert_eq!(cfg.device_index, 2);
    }
}
