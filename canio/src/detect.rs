//! Bit rate detection.

use std::time::Duration;

use crate::can::bitrate::{BitratePair, CATALOG};
use crate::driver::Driver;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectState {
    Idle,
    Detecting,
    /// Index into the candidate list.
    Matched(usize),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    pub index: usize,
    pub pair: BitratePair,
}

/// Probes a device against a list of candidate bit rates.
///
/// A detector runs once. On success the driver has opened the channel at the
/// detected rate.
#[derive(Debug, Clone)]
pub struct BitrateDetector {
    candidates: Vec<BitratePair>,
    wanted: Option<Vec<BitratePair>>,
    timeout: Duration,
    state: DetectState,
}

impl BitrateDetector {
    pub fn new(candidates: Vec<BitratePair>, timeout: Duration) -> Self {
        BitrateDetector {
            candidates,
            wanted: None,
            timeout,
            state: DetectState::Idle,
        }
    }

    /// Probe every rate in the catalog.
    pub fn catalog(timeout: Duration) -> Self {
        Self::new(CATALOG.to_vec(), timeout)
    }

    /// Only accept a detected rate that is also in `wanted`.
    pub fn wanted(mut self, wanted: Vec<BitratePair>) -> Self {
        self.wanted = Some(wanted);
        self
    }

    pub fn state(&self) -> DetectState {
        self.state
    }

    pub fn candidates(&self) -> &[BitratePair] {
        &self.candidates
    }

    pub fn detect(&mut self, driver: &dyn Driver, device: u8) -> Result<Detected> {
        match self.state {
            DetectState::Idle => {}
            DetectState::Detecting | DetectState::Matched(_) | DetectState::Failed => {
                return Err(Error::AlreadyDetected)
            }
        }
        if self.candidates.is_empty() {
            self.state = DetectState::Failed;
            return Err(Error::NoCandidates);
        }

        self.state = DetectState::Detecting;
        let result = self.probe(driver, device);
        self.state = match &result {
            Ok(detected) => DetectState::Matched(detected.index),
            Err(_) => DetectState::Failed,
        };
        result
    }

    fn probe(&self, driver: &dyn Driver, device: u8) -> Result<Detected> {
        // The hardware takes a 16 bit millisecond count.
        let timeout = self.timeout.min(Duration::from_millis(u16::MAX.into()));
        log::debug!(
            "device {}: detecting bit rate among {} candidate(s), timeout {:?}",
            device,
            self.candidates.len(),
            timeout
        );

        let raw = driver
            .detect_bitrate(device, timeout, &self.candidates)
            .map_err(|status| Error::driver(status, driver.error_text(status)))?;

        let index = usize::try_from(raw)
            .ok()
            .filter(|index| *index < self.candidates.len())
            .ok_or(Error::WrongIndex(raw))?;
        let pair = self.candidates[index];

        if let Some(wanted) = &self.wanted {
            if !wanted.contains(&pair) {
                log::warn!("device {}: detected {}, which is not wanted", device, pair);
                return Err(Error::NotDesired(pair));
            }
        }

        log::info!("device {}: detected {}", device, pair);
        Ok(Detected { index, pair })
    }
}
