//! Linux SocketCAN driver.
//!
//! Device number `n` maps to interface `can{n}` unless an explicit interface
//! name was registered with [`SocketCanDriver::with_interface`]. Opening the
//! channel restarts the link at the requested catalog rate with `ip link`
//! and closing takes it down again. With an empty link command
//! ([`SocketCanDriver::with_link_command`]) the link is left alone and must be
//! configured outside this process.

use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

use crate::can::bitrate::BitratePair;
use crate::can::mode::OperatingMode;
use crate::can::{Frame, EXTENDED_ID_MAX, EXTENDED_MARKER, MAX_PAYLOAD, STANDARD_ID_MAX};

use super::{BusStatus, Driver, DriverResult, Status};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct Link {
    interface: String,
    mode: OperatingMode,
    bitrate: Option<BitratePair>,
    socket: Option<Arc<CanSocket>>,
}

pub struct SocketCanDriver {
    interfaces: HashMap<u8, String>,
    link_command: Vec<String>,
    links: Mutex<HashMap<u8, Link>>,
}

impl Default for SocketCanDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketCanDriver {
    pub fn new() -> Self {
        SocketCanDriver {
            interfaces: HashMap::new(),
            link_command: vec!["ip".to_owned()],
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interface(mut self, device: u8, interface: impl Into<String>) -> Self {
        self.interfaces.insert(device, interface.into());
        self
    }

    /// Program (and leading arguments) used to run `link set ...`, e.g.
    /// `["sudo", "ip"]`. Empty disables link reconfiguration.
    pub fn with_link_command(mut self, command: Vec<String>) -> Self {
        self.link_command = command;
        self
    }

    fn manages_link(&self) -> bool {
        !self.link_command.is_empty()
    }

    fn ip_link(&self, args: &[String]) -> DriverResult<()> {
        let (program, prefix) = self.link_command.split_first().ok_or(Status::INVALID_STATE)?;
        let output = Command::new(program)
            .args(prefix)
            .args(args)
            .output()
            .map_err(|e| {
                log::error!("Failed to run {}: {}", program, e);
                Status::FAIL
            })?;
        if output.status.success() {
            Ok(())
        } else {
            log::error!(
                "{} {} failed ({}): {}",
                self.link_command.join(" "),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Err(Status::FAIL)
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<u8, Link>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn socket(&self, device: u8) -> DriverResult<Arc<CanSocket>> {
        self.links()
            .get(&device)
            .and_then(|link| link.socket.clone())
            .ok_or(Status::NOT_INITIALIZED)
    }
}

fn link_down_args(interface: &str) -> Vec<String> {
    ["link", "set", interface, "down"].map(String::from).to_vec()
}

fn link_up_args(interface: &str, bits_per_second: u32) -> Vec<String> {
    let rate = bits_per_second.to_string();
    ["link", "set", interface, "up", "type", "can", "bitrate", rate.as_str()]
        .map(String::from)
        .to_vec()
}

fn io_status(e: &io::Error) -> Status {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Status::TIMEOUT,
        io::ErrorKind::PermissionDenied => Status::ACCESS_DENIED,
        io::ErrorKind::NotFound => Status::NOT_INITIALIZED,
        io::ErrorKind::InvalidInput => Status::INVALID_ARG,
        _ => Status::FAIL,
    }
}

fn to_wire(id: u32, rtr: bool, payload: &[u8]) -> Option<CanFrame> {
    let forced_extended = id & EXTENDED_MARKER != 0;
    let id = id & !EXTENDED_MARKER;
    let id: Id = if forced_extended || id > STANDARD_ID_MAX {
        ExtendedId::new(id)?.into()
    } else {
        StandardId::new(id as u16)?.into()
    };
    if rtr {
        CanFrame::new_remote(id, payload.len())
    } else {
        CanFrame::new(id, payload)
    }
}

fn from_wire(frame: &CanFrame) -> DriverResult<Frame> {
    if let CanFrame::Error(_) = frame {
        return Err(Status::FAIL);
    }
    let (id, extended) = match EmbeddedFrame::id(frame) {
        Id::Standard(id) => (id.as_raw() as u32, false),
        Id::Extended(id) => (id.as_raw(), true),
    };
    let frame = if EmbeddedFrame::is_remote_frame(frame) {
        Frame::remote(id, EmbeddedFrame::dlc(frame) as u8)
    } else {
        Frame::new(id, EmbeddedFrame::data(frame))
    }
    .ok_or(Status::INVALID_ARG)?;
    Ok(if extended { frame.extended() } else { frame })
}

impl Driver for SocketCanDriver {
    fn open(&self, device: u8, interactive: bool) -> DriverResult<()> {
        if interactive {
            return Err(Status::NOT_IMPLEMENTED);
        }
        let mut links = self.links();
        if links.contains_key(&device) {
            return Err(Status::ALREADY_INITIALIZED);
        }
        let interface = self
            .interfaces
            .get(&device)
            .cloned()
            .unwrap_or_else(|| format!("can{}", device));
        links.insert(
            device,
            Link {
                interface,
                mode: OperatingMode::default(),
                bitrate: None,
                socket: None,
            },
        );
        Ok(())
    }

    fn configure(&self, device: u8, mode: OperatingMode) -> DriverResult<()> {
        let mut links = self.links();
        let link = links.get_mut(&device).ok_or(Status::NOT_INITIALIZED)?;
        if link.socket.is_some() {
            return Err(Status::INVALID_STATE);
        }
        link.mode = mode;
        Ok(())
    }

    fn open_channel(&self, device: u8, bitrate: BitratePair) -> DriverResult<()> {
        let interface = {
            let links = self.links();
            let link = links.get(&device).ok_or(Status::NOT_INITIALIZED)?;
            if link.socket.is_some() {
                return Err(Status::INVALID_STATE);
            }
            link.interface.clone()
        };

        if self.manages_link() {
            let rate = bitrate.bits_per_second().ok_or_else(|| {
                log::error!("{}: no nominal rate for custom timing {}", interface, bitrate);
                Status::INVALID_ARG
            })?;
            self.ip_link(&link_down_args(&interface))?;
            log::info!("link {} restart at {} bit/s", interface, rate);
            self.ip_link(&link_up_args(&interface, rate))?;
        } else {
            log::info!("{}: link managed externally, expecting {}", interface, bitrate);
        }

        let socket = CanSocket::open(&interface).map_err(|e| {
            log::error!("Failed to open CAN socket on {}: {}", interface, e);
            io_status(&e)
        })?;
        socket
            .set_read_timeout(READ_TIMEOUT)
            .map_err(|e| io_status(&e))?;

        let mut links = self.links();
        let link = links.get_mut(&device).ok_or(Status::NOT_INITIALIZED)?;
        link.bitrate = Some(bitrate);
        link.socket = Some(Arc::new(socket));
        Ok(())
    }

    fn detect_bitrate(
        &self,
        _device: u8,
        _timeout: Duration,
        _candidates: &[BitratePair],
    ) -> DriverResult<i32> {
        Err(Status::NOT_IMPLEMENTED)
    }

    fn transmit(&self, device: u8, id: u32, rtr: bool, payload: &[u8]) -> DriverResult<()> {
        if (id & !EXTENDED_MARKER) > EXTENDED_ID_MAX || payload.len() > MAX_PAYLOAD {
            return Err(Status::INVALID_ARG);
        }
        let frame = to_wire(id, rtr, payload).ok_or(Status::INVALID_ARG)?;
        self.socket(device)?
            .write_frame(&frame)
            .map_err(|e| io_status(&e))
    }

    fn receive(&self, device: u8) -> DriverResult<Frame> {
        let socket = self.socket(device)?;
        let frame = socket.read_frame().map_err(|e| io_status(&e))?;
        from_wire(&frame)
    }

    fn status(&self, device: u8) -> DriverResult<BusStatus> {
        let links = self.links();
        let link = links.get(&device).ok_or(Status::NOT_INITIALIZED)?;
        let bitrate = link.bitrate.unwrap_or(BitratePair::new(0, 0));
        Ok(BusStatus {
            mode: link.mode.bits(),
            btr0: bitrate.btr0,
            btr1: bitrate.btr1,
            activated: link.socket.is_some(),
            ..BusStatus::default()
        })
    }

    fn close(&self, device: u8) -> DriverResult<()> {
        let link = self
            .links()
            .remove(&device)
            .ok_or(Status::NOT_INITIALIZED)?;
        let was_open = link.socket.is_some();
        drop(link.socket);
        log::info!("{} closed", link.interface);

        if was_open && self.manages_link() {
            if let Err(status) = self.ip_link(&link_down_args(&link.interface)) {
                log::warn!("taking {} down failed: {}", link.interface, status);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_conversion() {
        let wire = to_wire(0x123, false, &[1, 2]).unwrap();
        assert!(!EmbeddedFrame::is_extended(&wire));
        let frame = from_wire(&wire).unwrap();
        assert_eq!(frame, Frame::new(0x123, &[1, 2]).unwrap());

        let wire = to_wire(0x10 | EXTENDED_MARKER, true, &[0; 3]).unwrap();
        assert!(EmbeddedFrame::is_extended(&wire));
        assert!(EmbeddedFrame::is_remote_frame(&wire));
        let frame = from_wire(&wire).unwrap();
        assert!(frame.is_extended());
        assert!(frame.is_rtr());
        assert_eq!(frame.len(), 3);
    }

    #[test]
    fn link_commands() {
        assert_eq!(link_down_args("can1"), ["link", "set", "can1", "down"]);
        assert_eq!(
            link_up_args("can1", 125_000),
            ["link", "set", "can1", "up", "type", "can", "bitrate", "125000"]
        );
    }

    #[test]
    fn custom_timing_needs_external_link_setup() {
        let driver = SocketCanDriver::new().with_interface(0, "canio-test0");
        driver.open(0, false).unwrap();
        assert_eq!(
            driver.open_channel(0, BitratePair::new(0x12, 0x34)),
            Err(Status::INVALID_ARG)
        );
        assert!(!driver.status(0).unwrap().activated);
        driver.close(0).unwrap();
    }

    #[test]
    fn failed_link_command_is_fail() {
        let driver = SocketCanDriver::new()
            .with_interface(0, "canio-test0")
            .with_link_command(vec!["false".to_owned()]);
        driver.open(0, false).unwrap();
        assert_eq!(
            driver.open_channel(0, crate::can::bitrate::BITRATE_125K),
            Err(Status::FAIL)
        );
        driver.close(0).unwrap();
    }
}
