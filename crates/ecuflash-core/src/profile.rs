//! Device profile: every constant that differs between device variants.
//!
//! New variants are described by data, not by new types.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::transport::IsoTpConfig;

/// How a completed download is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeMode {
    /// Send RequestTransferExit after the last block.
    TransferExit,
    /// Skip transfer-exit; reset the device and clear diagnostic codes instead.
    ResetAndClear,
}

/// Bus identifiers and segmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusProfile {
    pub request_id: u16,
    pub response_id: u16,
    pub broadcast_id: u16,
    pub padding: u8,
    /// Block size we advertise when receiving.
    pub block_size: u8,
    /// STmin we advertise when receiving.
    pub st_min: u8,
}

impl Default for BusProfile {
    fn default() -> Self {
        Self {
            request_id: 0x7E0,
            response_id: 0x7E8,
            broadcast_id: 0x7DF,
            padding: 0x00,
            block_size: 0,
            st_min: 0,
        }
    }
}

/// Timeouts and delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingProfile {
    pub fc_timeout_ms: u64,
    pub cf_timeout_ms: u64,
    pub drain_window_ms: u64,
    pub p2_ms: u64,
    pub p2_star_ms: u64,
    pub ping_interval_ms: u64,
    pub stabilization_delay_ms: u64,
    pub verify_pass_delay_ms: u64,
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            fc_timeout_ms: 2000,
            cf_timeout_ms: 1000,
            drain_window_ms: 50,
            p2_ms: 1000,
            p2_star_ms: 5000,
            ping_interval_ms: 50,
            stabilization_delay_ms: 5000,
            verify_pass_delay_ms: 1000,
        }
    }
}

/// Security access constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    /// Session required before security access.
    pub session: u8,
    /// Request-seed sub-function; send-key uses the next one.
    pub level: u8,
    /// Constant XORed with the seed to form the key.
    pub key_xor: u16,
    /// Download address the credential blob is replayed to.
    pub credential_address: u32,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            session: crate::uds::session_type::EXTENDED,
            level: 0x01,
            key_xor: 0x9AE8,
            credential_address: 0x0040_0000,
        }
    }
}

/// Address spaces of the calibration (read) and staging (write) regions.
///
/// The staging region appears inside the calibration region at
/// `staging_offset`. The offset is a known constant, never derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    pub read_address: u32,
    pub read_size: u32,
    /// Format byte sent with every RequestUpload.
    pub upload_format: u8,
    pub staging_address: u32,
    pub staging_offset: u32,
    pub staging_size: u32,
    /// TransferData payload size; the last block is zero-padded.
    pub write_block_size: usize,
    /// Re-authenticate after this many uploads.
    pub reauth_interval: u32,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            read_address: 0x0080_0000,
            read_size: 0x0004_0000,
            upload_format: 0x20,
            staging_address: 0x0010_0000,
            staging_offset: 0x0002_0000,
            staging_size: 0x0001_0000,
            write_block_size: 256,
            reauth_interval: 32,
        }
    }
}

impl MemoryLayout {
    /// Where the staging region is read back through the read address space.
    pub fn readback_address(&self) -> u32 {
        self.read_address.wrapping_add(self.staging_offset)
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub auth_attempts: u32,
    pub auth_retry_delay_ms: u64,
    pub read_attempts: u32,
    pub write_attempts: u32,
    /// Base backoff; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auth_attempts: 5,
            auth_retry_delay_ms: 500,
            read_attempts: 3,
            write_attempts: 3,
            backoff_ms: 200,
        }
    }
}

/// Gates that must pass before any write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyProfile {
    pub quality_pings: u32,
    /// Keep-alive success ratio that must be exceeded.
    pub quality_threshold: f64,
    /// Number of verified backup copies wanted; one is the hard minimum.
    pub backup_target: usize,
}

impl Default for SafetyProfile {
    fn default() -> Self {
        Self {
            quality_pings: 20,
            quality_threshold: 0.95,
            backup_target: 2,
        }
    }
}

/// Complete description of one device variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub name: String,
    pub finalize: FinalizeMode,
    pub bus: BusProfile,
    pub timing: TimingProfile,
    pub security: SecurityProfile,
    pub memory: MemoryLayout,
    pub retry: RetryPolicy,
    pub safety: SafetyProfile,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            finalize: FinalizeMode::TransferExit,
            bus: BusProfile::default(),
            timing: TimingProfile::default(),
            security: SecurityProfile::default(),
            memory: MemoryLayout::default(),
            retry: RetryPolicy::default(),
            safety: SafetyProfile::default(),
        }
    }
}

impl DeviceProfile {
    /// Load a profile from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let profile: DeviceProfile = toml::from_str(&content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Save the profile to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject layouts the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        if m.write_block_size == 0 {
            bail!("write_block_size must be non-zero");
        }
        if m.staging_size == 0 || m.read_size == 0 {
            bail!("memory regions must be non-empty");
        }
        if m.staging_offset as u64 + m.staging_size as u64 > m.read_size as u64 {
            bail!(
                "staging region (offset 0x{:X}, size 0x{:X}) exceeds read region size 0x{:X}",
                m.staging_offset,
                m.staging_size,
                m.read_size
            );
        }
        if !(0.0..1.0).contains(&self.safety.quality_threshold) {
            bail!(
                "quality_threshold {} outside 0..1",
                self.safety.quality_threshold
            );
        }
        if self.retry.auth_attempts == 0
            || self.retry.read_attempts == 0
            || self.retry.write_attempts == 0
        {
            bail!("retry attempts must be at least 1");
        }
        if self.security.level % 2 == 0 {
            bail!("security level 0x{:02X} must be odd", self.security.level);
        }
        Ok(())
    }

    /// Zero every wait that only exists for real hardware.
    pub fn without_delays(mut self) -> Self {
        self.timing.drain_window_ms = 0;
        self.timing.ping_interval_ms = 0;
        self.timing.stabilization_delay_ms = 0;
        self.timing.verify_pass_delay_ms = 0;
        self.retry.auth_retry_delay_ms = 0;
        self.retry.backoff_ms = 0;
        self
    }

    pub fn isotp_config(&self) -> IsoTpConfig {
        IsoTpConfig {
            tx_id: self.bus.request_id,
            rx_id: self.bus.response_id,
            padding: self.bus.padding,
            block_size: self.bus.block_size,
            st_min: self.bus.st_min,
            fc_timeout: ms(self.timing.fc_timeout_ms),
            cf_timeout: ms(self.timing.cf_timeout_ms),
            drain_window: ms(self.timing.drain_window_ms),
            ..IsoTpConfig::default()
        }
    }

    pub fn p2(&self) -> Duration {
        ms(self.timing.p2_ms)
    }

    pub fn p2_star(&self) -> Duration {
        ms(self.timing.p2_star_ms)
    }
}

pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        DeviceProfile::default().validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        let mut profile = DeviceProfile::default();
        profile.finalize = FinalizeMode::ResetAndClear;
        profile.memory.write_block_size = 128;
        profile.save_to_file(&path).unwrap();

        let loaded = DeviceProfile::load_from_file(&path).unwrap();
        assert_eq!(loaded, profile);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("finalize = \"reset_and_clear\""));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let profile: DeviceProfile = toml::from_str(
            r#"
            name = "variant-b"
            [memory]
            staging_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(profile.name, "variant-b");
        assert_eq!(profile.memory.staging_size, 4096);
        assert_eq!(profile.memory.write_block_size, 256);
        assert_eq!(profile.security.key_xor, 0x9AE8);
    }

    #[test]
    fn test_staging_outside_read_region_rejected() {
        let mut profile = DeviceProfile::default();
        profile.memory.staging_offset = profile.memory.read_size;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_unreachable_quality_threshold_rejected() {
        let mut profile = DeviceProfile::default();
        profile.safety.quality_threshold = 1.0;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_readback_address() {
        let layout = MemoryLayout::default();
        assert_eq!(layout.readback_address(), 0x0082_0000);
    }
}
