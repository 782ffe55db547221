//! Device setup.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::can::bitrate::{BitratePair, BITRATE_125K};
use crate::can::mode::OperatingMode;
use crate::detect::BitrateDetector;
use crate::distributor::{Distributor, DEFAULT_STOP_GRACE};
use crate::driver::Driver;
use crate::error::{Error, Result};

const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub number: u8,
    /// Let the driver ask the user which device to open.
    pub interactive: bool,
    pub mode: OperatingMode,
    pub bitrate: BitrateSelection,
    #[serde(rename = "stop_grace_ms", deserialize_with = "millis")]
    pub stop_grace: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            number: 0,
            interactive: false,
            mode: OperatingMode::default(),
            bitrate: BitrateSelection::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BitrateSelection {
    Fixed(BitratePair),
    Detect {
        candidates: Vec<BitratePair>,
        #[serde(default)]
        wanted: Option<Vec<BitratePair>>,
        #[serde(default, rename = "timeout_ms", deserialize_with = "optional_millis")]
        timeout: Option<Duration>,
    },
    /// Detect among the whole catalog.
    Auto {
        #[serde(default, rename = "timeout_ms", deserialize_with = "optional_millis")]
        timeout: Option<Duration>,
    },
}

impl Default for BitrateSelection {
    fn default() -> Self {
        BitrateSelection::Fixed(BITRATE_125K)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

/// Open and configure a device and wrap it in a [`Distributor`].
///
/// The returned distributor is not started yet. If anything fails after the
/// device was opened, it is closed again before the error is returned.
pub fn open(driver: Arc<dyn Driver>, config: &DeviceConfig) -> Result<Distributor> {
    let device = config.number;
    driver
        .open(device, config.interactive)
        .map_err(|status| Error::driver(status, driver.error_text(status)))?;

    match bring_up(driver.as_ref(), config) {
        Ok(bitrate) => {
            log::info!("device {} open at {} ({:?})", device, bitrate, config.mode);
            Ok(Distributor::new(driver, device, bitrate, config.stop_grace))
        }
        Err(e) => {
            log::error!("device {}: {}", device, e);
            if let Err(status) = driver.close(device) {
                log::debug!(
                    "closing device {} after failed setup: {}",
                    device,
                    driver.error_text(status)
                );
            }
            Err(e)
        }
    }
}

fn bring_up(driver: &dyn Driver, config: &DeviceConfig) -> Result<BitratePair> {
    let device = config.number;
    let fail = |status| Error::driver(status, driver.error_text(status));

    driver.configure(device, config.mode).map_err(fail)?;

    let mut detector = match &config.bitrate {
        BitrateSelection::Fixed(bitrate) => {
            driver.open_channel(device, *bitrate).map_err(fail)?;
            return Ok(*bitrate);
        }
        BitrateSelection::Detect {
            candidates,
            wanted,
            timeout,
        } => {
            let detector = BitrateDetector::new(
                candidates.clone(),
                timeout.unwrap_or(DEFAULT_DETECT_TIMEOUT),
            );
            match wanted {
                Some(wanted) => detector.wanted(wanted.clone()),
                None => detector,
            }
        }
        BitrateSelection::Auto { timeout } => {
            BitrateDetector::catalog(timeout.unwrap_or(DEFAULT_DETECT_TIMEOUT))
        }
    };
    Ok(detector.detect(driver, device)?.pair)
}
