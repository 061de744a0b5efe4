//! Engine configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::DEFAULT_HOST_TOKEN;

/// Client-facing switches for a [`ProtocolEngine`](crate::engine::ProtocolEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ask the device to reset into the new image as soon as it is written.
    pub force_immediate_reset: bool,
    /// Ask the device to skip its version check.
    pub force_ignore_version: bool,
    /// Continue an interrupted transfer from its saved checkpoint.
    pub support_resume_on_connect: bool,
    /// The firmware source may release its buffers before the transaction
    /// ends; the engine keeps private copies.
    pub firmware_buffers_not_persistent: bool,
    /// Namespaces persisted keys when several devices share a store.
    pub instance_id: Option<String>,
    /// Frame the offer list with offer information records.
    pub send_offer_information: bool,
    /// Query and persist the running firmware versions before offering.
    pub query_firmware_version: bool,
    /// Reset the persisted status of a component after a successful update.
    pub clear_status_on_success: bool,
    /// Offer the remaining components after one fails.
    pub continue_on_component_failure: bool,
    /// Sender identity stamped into every offer.
    pub host_token: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_immediate_reset: false,
            force_ignore_version: false,
            support_resume_on_connect: false,
            firmware_buffers_not_persistent: false,
            instance_id: None,
            send_offer_information: true,
            query_firmware_version: false,
            clear_status_on_success: true,
            continue_on_component_failure: false,
            host_token: DEFAULT_HOST_TOKEN,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: EngineConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
