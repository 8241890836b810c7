//! JSON configuration model.
//!
//! Plain `Serialize, Deserialize` structs, `Option<T>` for fields the
//! upstream format omits when absent. The core only *consumes* this shape —
//! loading, validating, and re-saving (e.g. appending newly observed button
//! addresses) stays a host responsibility, exposed here only as the
//! [`ConfigSink`] trait the engine calls into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ButtonAddress, ModuleAddress, ModuleType};

fn default_long_press_threshold_ms() -> u64 {
    500
}

fn default_release_window_ms() -> u64 {
    400
}

fn default_refresh_interval_s() -> u64 {
    120
}

fn default_operation_time_s() -> u32 {
    40
}

/// Top-level configuration consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
    #[serde(default)]
    pub scenes: Vec<SceneConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Engine-wide tunables that must stay configurable rather than hard-coded,
/// since the right debounce/hold/refresh timing varies by installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_long_press_threshold_ms")]
    pub long_press_threshold_ms: u64,
    #[serde(default = "default_release_window_ms")]
    pub release_window_ms: u64,
    /// Periodic state-refresh interval used only when no Feedback Module is
    /// present on the bus.
    #[serde(default = "default_refresh_interval_s")]
    pub refresh_interval_s: u64,
    /// Whether a Feedback Module is present; when true, periodic refresh is
    /// disabled.
    #[serde(default)]
    pub feedback_module_present: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            long_press_threshold_ms: default_long_press_threshold_ms(),
            release_window_ms: default_release_window_ms(),
            refresh_interval_s: default_refresh_interval_s(),
            feedback_module_present: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    pub address: ModuleAddress,
    pub channels: Vec<ChannelConfig>,
}

impl ModuleConfig {
    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_off: Option<String>,
    /// Seconds to traverse 0→100%, rollers only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ChannelConfig {
    pub fn operation_time_s(&self) -> u32 {
        self.operation_time.unwrap_or_else(default_operation_time_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub address: ButtonAddress,
    #[serde(default)]
    pub impacted_module: Vec<ImpactedModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactedModule {
    pub address: ModuleAddress,
    pub group: ImpactedGroup,
}

/// Config wire form for group ("1"/"2") — the internal type is
/// [`crate::types::Group`]; this wrapper matches the string-literal shape
/// config files use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactedGroup {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

impl From<ImpactedGroup> for crate::types::Group {
    fn from(g: ImpactedGroup) -> Self {
        match g {
            ImpactedGroup::One => crate::types::Group::One,
            ImpactedGroup::Two => crate::types::Group::Two,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: String,
    pub channels: Vec<SceneChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneChannel {
    pub module_id: ModuleAddress,
    pub channel: u8,
    pub state: u8,
}

impl Config {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Build a lookup by module address for O(1) access during command
    /// enqueueing and feedback dispatch.
    pub fn module_map(&self) -> HashMap<ModuleAddress, &ModuleConfig> {
        self.modules.iter().map(|m| (m.address, m)).collect()
    }

    pub fn button_map(&self) -> HashMap<ButtonAddress, &ButtonConfig> {
        self.buttons.iter().map(|b| (b.address, b)).collect()
    }
}

/// Host-provided sink for config mutations the core may request.
///
/// The one persisted-state exception the core allows: newly observed
/// button addresses get appended to the button config file. The core never
/// touches the filesystem directly — it calls this trait, which the host
/// implements (e.g. by rewriting the JSON file on disk).
pub trait ConfigSink: Send + Sync {
    fn record_observed_button(&self, address: ButtonAddress);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "modules": [
                {"type": "switch", "address": "4707", "channels": [
                    {"description": "Kitchen lights"}
                ]}
            ]
        }"#;
        let cfg = Config::parse(json).expect("should parse");
        assert_eq!(cfg.modules.len(), 1);
        assert_eq!(cfg.modules[0].address, ModuleAddress::parse("4707").unwrap());
        assert_eq!(cfg.engine.long_press_threshold_ms, 500);
    }

    #[test]
    fn parses_button_with_impacted_modules() {
        let json = r#"{
            "modules": [],
            "buttons": [
                {
                    "address": "4ECB1A",
                    "impacted_module": [{"address": "9105", "group": "1"}],
                    "operation_time": 12
                }
            ]
        }"#;
        let cfg = Config::parse(json).expect("should parse");
        assert_eq!(cfg.buttons.len(), 1);
        assert_eq!(cfg.buttons[0].impacted_module[0].group, ImpactedGroup::One);
        assert_eq!(cfg.buttons[0].operation_time, Some(12));
    }

    #[test]
    fn engine_config_defaults_apply_when_omitted() {
        let json = r#"{"modules": []}"#;
        let cfg = Config::parse(json).unwrap();
        assert_eq!(cfg.engine.release_window_ms, 400);
        assert_eq!(cfg.engine.refresh_interval_s, 120);
        assert!(!cfg.engine.feedback_module_present);
    }
}
