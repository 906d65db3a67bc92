//! Device capability configuration.
//!
//! These values are fixed per build or device and are consulted by the key
//! policy checks. They are never mutated by session operations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// HDCP capability levels, encoded the way key control blocks encode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdcpCapability {
    None,
    V1,
    V2,
    V2_1,
    V2_2,
    V2_3,
    /// No digital output is possible on this device.
    NoDigitalOutput,
}

impl HdcpCapability {
    /// Numeric level used in key control blocks.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            HdcpCapability::None => 0,
            HdcpCapability::V1 => 1,
            HdcpCapability::V2 => 2,
            HdcpCapability::V2_1 => 3,
            HdcpCapability::V2_2 => 4,
            HdcpCapability::V2_3 => 5,
            HdcpCapability::NoDigitalOutput => 0xff,
        }
    }
}

/// How the device root of trust is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMethod {
    /// Factory keybox.
    Keybox,
    /// DRM certificate private key baked into the device.
    DrmCertificate,
    /// OEM certificate; device keys are provisioned with the v30 rewrap flow.
    OemCertificate,
}

/// Security level reported to license servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    L1,
    L2,
    L3,
}

impl SecurityLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::L1 => "L1",
            SecurityLevel::L2 => "L2",
            SecurityLevel::L3 => "L3",
        }
    }
}

/// Engine configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub security_level: SecurityLevel,
    pub current_hdcp: HdcpCapability,
    pub max_hdcp: HdcpCapability,
    /// Only a built-in display is attached; digital output policy is moot.
    pub local_display_only: bool,
    /// Closed platforms may decrypt secure-path content into clear buffers.
    pub closed_platform: bool,
    pub anti_rollback_hardware: bool,
    pub security_patch_level: u8,
    pub max_sessions: usize,
    /// Largest accepted decrypt input, in bytes.
    pub max_buffer_size: usize,
    /// Largest accepted destination, in bytes. Zero means unlimited.
    pub max_output_size: usize,
    /// Usage table capacity. Zero means unlimited.
    pub max_usage_entries: usize,
    pub resource_rating_tier: u32,
    /// Nonces allowed per one-second window across all sessions.
    pub nonce_flood_count: u32,
    /// Current SRM version, `None` when SRM is not supported.
    pub srm_version: Option<u16>,
    pub srm_update_supported: bool,
    pub revoked_device_attached: bool,
    pub provisioning_method: ProvisioningMethod,
    pub supports_usage_table: bool,
    pub api_version: u32,
    /// Where an installed production keybox is written, and reloaded from on
    /// initialize.
    pub keybox_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::L3,
            current_hdcp: HdcpCapability::V1,
            max_hdcp: HdcpCapability::NoDigitalOutput,
            local_display_only: false,
            closed_platform: false,
            anti_rollback_hardware: false,
            security_patch_level: 0,
            max_sessions: 64,
            max_buffer_size: 100 * 1024,
            max_output_size: 0,
            max_usage_entries: 0,
            resource_rating_tier: 1,
            nonce_flood_count: 20,
            srm_version: None,
            srm_update_supported: false,
            revoked_device_attached: false,
            provisioning_method: ProvisioningMethod::Keybox,
            supports_usage_table: true,
            api_version: 15,
            keybox_path: None,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML text. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a configuration from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    /// HDCP level currently negotiated on the output.
    #[must_use]
    pub fn current_hdcp_capability(&self) -> HdcpCapability {
        if self.local_display_only {
            HdcpCapability::NoDigitalOutput
        } else {
            self.current_hdcp
        }
    }

    /// Whether an analog output path may be driven.
    #[must_use]
    pub fn analog_display_active(&self) -> bool {
        !self.local_display_only
    }

    /// CGMS-A is not supported on any output.
    #[must_use]
    pub fn cgms_a_active(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            "security_level: L1\ncurrent_hdcp: v2_2\nsecurity_patch_level: 3\nsrm_version: 4\n",
        )
        .expect("valid yaml");

        assert_eq!(config.security_level, SecurityLevel::L1);
        assert_eq!(config.current_hdcp, HdcpCapability::V2_2);
        assert_eq!(config.security_patch_level, 3);
        assert_eq!(config.srm_version, Some(4));
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.nonce_flood_count, 20);
    }

    #[test]
    fn local_display_reports_no_digital_output() {
        let config = EngineConfig {
            local_display_only: true,
            ..EngineConfig::default()
        };
        assert_eq!(config.current_hdcp_capability().level(), 0xff);
        assert!(!config.analog_display_active());
    }
}
