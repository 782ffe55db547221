//! In-process CAN bus.
//!
//! Every device opened on a [`VirtualDriver`] is attached to the same
//! simulated wire. A frame transmitted by one device is delivered to all other
//! devices whose channel is open at the same bit rate and whose operating mode
//! accepts the frame's addressing. Tests and the daemon's `virtual` backend use
//! it in place of real hardware.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::can::bitrate::BitratePair;
use crate::can::mode::OperatingMode;
use crate::can::{Frame, EXTENDED_ID_MAX, EXTENDED_MARKER, MAX_PAYLOAD};

use super::{BusStatus, Driver, DriverResult, Status};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type Incoming = DriverResult<Frame>;

struct Endpoint {
    mode: OperatingMode,
    bitrate: Option<BitratePair>,
    queue: mpsc::Sender<Incoming>,
    inbox: Arc<Mutex<mpsc::Receiver<Incoming>>>,
    transmitted: Vec<Frame>,
}

impl Endpoint {
    fn accepts(&self, frame: &Frame) -> bool {
        if frame.is_extended() {
            self.mode.contains(OperatingMode::EXTENDED)
        } else {
            self.mode.contains(OperatingMode::STANDARD)
        }
    }
}

#[derive(Default)]
struct Registry {
    devices: HashMap<u8, Endpoint>,
    bus_bitrate: Option<BitratePair>,
    bus_load: u8,
    forced_detection: Option<i32>,
}

pub struct VirtualDriver {
    registry: Mutex<Registry>,
    poll_interval: Duration,
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDriver {
    pub fn new() -> Self {
        VirtualDriver {
            registry: Mutex::new(Registry::default()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long [`receive`](Driver::receive) blocks before reporting
    /// [`Status::TIMEOUT`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bit rate the simulated bus traffic runs at. Bit rate detection finds
    /// this pair if it is among the candidates.
    pub fn set_bus_bitrate(&self, bitrate: Option<BitratePair>) {
        self.registry().bus_bitrate = bitrate;
    }

    pub fn set_bus_load(&self, percent: u8) {
        self.registry().bus_load = percent.min(100);
    }

    /// Make the next bit rate detection report `index` verbatim, whatever the
    /// candidates are.
    pub fn force_detection_index(&self, index: i32) {
        self.registry().forced_detection = Some(index);
    }

    /// Queue a frame for `device` as if another node had sent it.
    pub fn inject(&self, device: u8, frame: Frame) -> DriverResult<()> {
        self.push(device, Ok(frame))
    }

    /// Make the next receive on `device` fail with `status`.
    pub fn inject_receive_error(&self, device: u8, status: Status) -> DriverResult<()> {
        self.push(device, Err(status))
    }

    /// Frames `device` has put on the wire, oldest first.
    pub fn transmitted(&self, device: u8) -> Vec<Frame> {
        self.registry()
            .devices
            .get(&device)
            .map(|ep| ep.transmitted.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, device: u8) -> bool {
        self.registry().devices.contains_key(&device)
    }

    fn push(&self, device: u8, item: Incoming) -> DriverResult<()> {
        let registry = self.registry();
        let endpoint = registry
            .devices
            .get(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        endpoint.queue.send(item).map_err(|_| Status::DISCONNECTED)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking test thread must not take the whole bus down with it.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Driver for VirtualDriver {
    fn open(&self, device: u8, interactive: bool) -> DriverResult<()> {
        if interactive {
            return Err(Status::NOT_IMPLEMENTED);
        }
        let mut registry = self.registry();
        if registry.devices.contains_key(&device) {
            return Err(Status::ALREADY_INITIALIZED);
        }
        let (queue, inbox) = mpsc::channel();
        registry.devices.insert(
            device,
            Endpoint {
                mode: OperatingMode::default(),
                bitrate: None,
                queue,
                inbox: Arc::new(Mutex::new(inbox)),
                transmitted: Vec::new(),
            },
        );
        log::debug!("virtual device {} opened", device);
        Ok(())
    }

    fn configure(&self, device: u8, mode: OperatingMode) -> DriverResult<()> {
        let mut registry = self.registry();
        let endpoint = registry
            .devices
            .get_mut(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        if endpoint.bitrate.is_some() {
            return Err(Status::INVALID_STATE);
        }
        endpoint.mode = mode;
        Ok(())
    }

    fn open_channel(&self, device: u8, bitrate: BitratePair) -> DriverResult<()> {
        let mut registry = self.registry();
        let endpoint = registry
            .devices
            .get_mut(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        endpoint.bitrate = Some(bitrate);
        log::debug!("virtual device {} channel open at {}", device, bitrate);
        Ok(())
    }

    fn detect_bitrate(
        &self,
        device: u8,
        timeout: Duration,
        candidates: &[BitratePair],
    ) -> DriverResult<i32> {
        if candidates.is_empty() {
            return Err(Status::INVALID_ARG);
        }

        let found = {
            let mut registry = self.registry();
            if !registry.devices.contains_key(&device) {
                return Err(Status::NOT_INITIALIZED);
            }
            if let Some(index) = registry.forced_detection.take() {
                return Ok(index);
            }
            let bus = registry.bus_bitrate;
            let found = bus.and_then(|bus| candidates.iter().position(|c| *c == bus));
            if let (Some(index), Some(endpoint)) = (found, registry.devices.get_mut(&device)) {
                endpoint.bitrate = Some(candidates[index]);
            }
            found
        };

        match found {
            Some(index) => Ok(index as i32),
            None => {
                // Nothing on the wire matched; a real probe listens for the full timeout.
                std::thread::sleep(timeout);
                Err(Status::TIMEOUT)
            }
        }
    }

    fn transmit(&self, device: u8, id: u32, rtr: bool, payload: &[u8]) -> DriverResult<()> {
        let forced_extended = id & EXTENDED_MARKER != 0;
        let id = id & !EXTENDED_MARKER;
        if id > EXTENDED_ID_MAX || payload.len() > MAX_PAYLOAD {
            return Err(Status::INVALID_ARG);
        }
        let frame = if rtr {
            Frame::remote(id, payload.len() as u8)
        } else {
            Frame::new(id, payload)
        }
        .ok_or(Status::INVALID_ARG)?;
        let frame = if forced_extended { frame.extended() } else { frame };

        let mut registry = self.registry();
        let sender = registry
            .devices
            .get_mut(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        let bitrate = sender.bitrate.ok_or(Status::NOT_INITIALIZED)?;
        if sender.mode.contains(OperatingMode::LISTEN_ONLY) {
            return Err(Status::ACCESS_DENIED);
        }
        sender.transmitted.push(frame);

        for (number, endpoint) in registry.devices.iter() {
            if *number == device || endpoint.bitrate != Some(bitrate) || !endpoint.accepts(&frame)
            {
                continue;
            }
            // The receiving side may be mid-close; its inbox is gone then.
            let _ = endpoint.queue.send(Ok(frame));
        }
        Ok(())
    }

    fn receive(&self, device: u8) -> DriverResult<Frame> {
        let inbox = {
            let registry = self.registry();
            let endpoint = registry
                .devices
                .get(&device)
                .ok_or(Status::NOT_INITIALIZED)?;
            endpoint.bitrate.ok_or(Status::NOT_INITIALIZED)?;
            endpoint.inbox.clone()
        };

        let inbox = inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match inbox.recv_timeout(self.poll_interval) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => Err(Status::TIMEOUT),
            Err(RecvTimeoutError::Disconnected) => Err(Status::DISCONNECTED),
        }
    }

    fn status(&self, device: u8) -> DriverResult<BusStatus> {
        let registry = self.registry();
        let endpoint = registry
            .devices
            .get(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        let bitrate = endpoint.bitrate.unwrap_or(BitratePair::new(0, 0));
        Ok(BusStatus {
            mode: endpoint.mode.bits(),
            btr0: bitrate.btr0,
            btr1: bitrate.btr1,
            bus_load: registry.bus_load,
            activated: endpoint.bitrate.is_some(),
            ..BusStatus::default()
        })
    }

    fn close(&self, device: u8) -> DriverResult<()> {
        self.registry()
            .devices
            .remove(&device)
            .map(|_| log::debug!("virtual device {} closed", device))
            .ok_or(Status::NOT_INITIALIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::bitrate::{BITRATE_125K, BITRATE_500K};

    fn driver() -> VirtualDriver {
        VirtualDriver::new().with_poll_interval(Duration::from_millis(10))
    }

    fn open(driver: &VirtualDriver, device: u8, mode: OperatingMode, bitrate: BitratePair) {
        driver.open(device, false).unwrap();
        driver.configure(device, mode).unwrap();
        driver.open_channel(device, bitrate).unwrap();
    }

    #[test]
    fn registry_errors() {
        let driver = driver();
        assert_eq!(driver.open(0, true), Err(Status::NOT_IMPLEMENTED));
        driver.open(0, false).unwrap();
        assert_eq!(driver.open(0, false), Err(Status::ALREADY_INITIALIZED));
        assert_eq!(driver.receive(0), Err(Status::NOT_INITIALIZED));
        assert_eq!(driver.close(1), Err(Status::NOT_INITIALIZED));
        driver.close(0).unwrap();
        assert!(!driver.is_open(0));
    }

    #[test]
    fn transmit_reaches_peers_at_same_rate() {
        let driver = driver();
        open(&driver, 0, OperatingMode::STANDARD, BITRATE_125K);
        open(&driver, 1, OperatingMode::STANDARD, BITRATE_125K);
        open(&driver, 2, OperatingMode::STANDARD, BITRATE_500K);

        driver.transmit(0, 0x100, false, &[1, 2, 3]).unwrap();

        assert_eq!(driver.receive(1), Ok(Frame::new(0x100, &[1, 2, 3]).unwrap()));
        assert_eq!(driver.receive(2), Err(Status::TIMEOUT));
        assert_eq!(driver.receive(0), Err(Status::TIMEOUT));
        assert_eq!(driver.transmitted(0).len(), 1);
    }

    #[test]
    fn extended_marker_is_stripped() {
        let driver = driver();
        open(&driver, 0, OperatingMode::EXTENDED, BITRATE_125K);
        open(&driver, 1, OperatingMode::STANDARD, BITRATE_125K);
        open(&driver, 2, OperatingMode::EXTENDED, BITRATE_125K);

        driver.transmit(0, 0x10 | EXTENDED_MARKER, false, &[]).unwrap();

        let frame = driver.receive(2).unwrap();
        assert_eq!(frame.id(), 0x10);
        assert!(frame.is_extended());
        // Standard-only controllers ignore 29-bit traffic.
        assert_eq!(driver.receive(1), Err(Status::TIMEOUT));
    }

    #[test]
    fn transmit_validation() {
        let driver = driver();
        driver.open(0, false).unwrap();
        assert_eq!(driver.transmit(0, 0x1, false, &[]), Err(Status::NOT_INITIALIZED));
        driver.open_channel(0, BITRATE_125K).unwrap();
        assert_eq!(driver.transmit(0, 0x1, false, &[0; 9]), Err(Status::INVALID_ARG));
        assert_eq!(driver.configure(0, OperatingMode::EXTENDED), Err(Status::INVALID_STATE));

        open(&driver, 1, OperatingMode::STANDARD | OperatingMode::LISTEN_ONLY, BITRATE_125K);
        assert_eq!(driver.transmit(1, 0x1, false, &[]), Err(Status::ACCESS_DENIED));
    }

    #[test]
    fn detection() {
        let driver = driver();
        driver.open(0, false).unwrap();
        driver.set_bus_bitrate(Some(BITRATE_500K));
        assert_eq!(
            driver.detect_bitrate(0, Duration::from_millis(5), &[BITRATE_125K, BITRATE_500K]),
            Ok(1)
        );
        assert_eq!(driver.status(0).unwrap().btr1, BITRATE_500K.btr1);
        assert!(driver.status(0).unwrap().activated);

        driver.set_bus_bitrate(None);
        assert_eq!(
            driver.detect_bitrate(0, Duration::from_millis(5), &[BITRATE_125K]),
            Err(Status::TIMEOUT)
        );

        driver.force_detection_index(7);
        assert_eq!(
            driver.detect_bitrate(0, Duration::from_millis(5), &[BITRATE_125K]),
            Ok(7)
        );
    }

    #[test]
    fn injected_errors_are_received_in_order() {
        let driver = driver();
        open(&driver, 0, OperatingMode::STANDARD, BITRATE_125K);
        driver.inject_receive_error(0, Status::FAIL).unwrap();
        driver.inject(0, Frame::new(0x7, &[]).unwrap()).unwrap();
        assert_eq!(driver.receive(0), Err(Status::FAIL));
        assert_eq!(driver.receive(0).unwrap().id(), 7);
    }
}
