use std::path::Path;

use anyhow::Context;
use canio::{BitratePair, DeviceConfig};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct Config {
    pub backend: Backend,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Seconds between statistics log lines, 0 disables them.
    #[serde(default)]
    pub stats_interval: u64,
}

#[derive(Deserialize)]
#[serde(tag = "kind")]
pub enum Backend {
    #[serde(rename = "virtual")]
    Virtual {
        /// Rate the simulated bus runs at, for bit rate detection.
        #[serde(default)]
        bitrate: Option<BitratePair>,
    },
    #[cfg(all(feature = "socketcan", target_os = "linux"))]
    #[serde(rename = "socketcan")]
    SocketCAN {
        interface: String,
        /// Command used to restart the link, empty to leave it alone.
        #[serde(default = "default_link_command")]
        link_command: Vec<String>,
    },
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
fn default_link_command() -> Vec<String> {
    vec!["ip".to_owned()]
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
