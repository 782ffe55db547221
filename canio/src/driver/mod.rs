//! Interface to the CAN adapter driver.
//!
//! Everything above this module talks to hardware exclusively through the
//! [`Driver`] trait. A driver instance owns the registry of the devices it has
//! opened, addressed by a small device number chosen by the caller.

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;
pub mod virtual_bus;

use std::fmt;
use std::time::Duration;

use crate::can::bitrate::BitratePair;
use crate::can::mode::OperatingMode;
use crate::can::Frame;

pub use virtual_bus::VirtualDriver;

pub type DriverResult<T> = std::result::Result<T, Status>;

/// Raw driver status code. Zero means success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

const SEV_VCI_ERROR: u32 = 0xc000_0000 | 0x2000_0000 | 0x0001_0000;

impl Status {
    pub const OK: Status = Status(0);
    pub const UNEXPECTED: Status = Status(SEV_VCI_ERROR | 0x0001);
    pub const NOT_IMPLEMENTED: Status = Status(SEV_VCI_ERROR | 0x0002);
    pub const OUT_OF_MEMORY: Status = Status(SEV_VCI_ERROR | 0x0003);
    pub const INVALID_ARG: Status = Status(SEV_VCI_ERROR | 0x0004);
    pub const FAIL: Status = Status(SEV_VCI_ERROR | 0x0009);
    pub const ACCESS_DENIED: Status = Status(SEV_VCI_ERROR | 0x000a);
    pub const TIMEOUT: Status = Status(SEV_VCI_ERROR | 0x000b);
    pub const BUSY: Status = Status(SEV_VCI_ERROR | 0x000c);
    pub const NO_DATA: Status = Status(SEV_VCI_ERROR | 0x000e);
    pub const NOT_INITIALIZED: Status = Status(SEV_VCI_ERROR | 0x0010);
    pub const ALREADY_INITIALIZED: Status = Status(SEV_VCI_ERROR | 0x0011);
    pub const RXQUEUE_EMPTY: Status = Status(SEV_VCI_ERROR | 0x0012);
    pub const TXQUEUE_FULL: Status = Status(SEV_VCI_ERROR | 0x0013);
    pub const INVALID_STATE: Status = Status(SEV_VCI_ERROR | 0x0015);
    pub const DISCONNECTED: Status = Status(SEV_VCI_ERROR | 0x0019);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// A receive that returned without data. Not an error condition.
    pub fn is_idle(&self) -> bool {
        matches!(
            *self,
            Status::TIMEOUT | Status::NO_DATA | Status::RXQUEUE_EMPTY
        )
    }

    pub fn description(&self) -> String {
        let text = match *self {
            Status::OK => "The operation completed successfully.",
            Status::UNEXPECTED => "Unexpected failure",
            Status::NOT_IMPLEMENTED => "Not implemented",
            Status::OUT_OF_MEMORY => "Not enough storage is available to complete this operation.",
            Status::INVALID_ARG => "One or more parameters are invalid.",
            Status::FAIL => "Unspecified error",
            Status::ACCESS_DENIED => "Access is denied.",
            Status::TIMEOUT => "This operation returned because the timeout period expired.",
            Status::BUSY => "The requested resource is in use.",
            Status::NO_DATA => "No more data available.",
            Status::NOT_INITIALIZED => "The component is not initialized.",
            Status::ALREADY_INITIALIZED => {
                "An attempt was made to reinitialize an already initialized component."
            }
            Status::RXQUEUE_EMPTY => "Receive queue empty.",
            Status::TXQUEUE_FULL => "Transmit queue full.",
            Status::INVALID_STATE => "The component is not in a valid state to perform this request.",
            Status::DISCONNECTED => "The device is disconnected.",
            Status(code) => return format!("err: {:#010x}", code),
        };
        text.to_owned()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#010x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Snapshot of the controller and channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStatus {
    pub mode: u8,
    pub btr0: u8,
    pub btr1: u8,
    /// Average bus load in percent (0..100)
    pub bus_load: u8,
    /// Controller status word
    pub controller: u32,
    pub activated: bool,
    pub rx_overrun: bool,
    /// Receive FIFO load in percent (0..100)
    pub rx_fifo_load: u8,
    /// Transmit FIFO load in percent (0..100)
    pub tx_fifo_load: u8,
}

/// Blocking interface to a CAN adapter.
///
/// All methods may be called from several threads at once: the reader loop
/// sits in [`receive`](Driver::receive) while other threads transmit.
pub trait Driver: Send + Sync {
    /// Open a device and assign it `device`. With `interactive` set the driver
    /// may ask the user which adapter to use.
    fn open(&self, device: u8, interactive: bool) -> DriverResult<()>;

    /// Set the operating mode. Must happen before the channel is opened.
    fn configure(&self, device: u8, mode: OperatingMode) -> DriverResult<()>;

    fn open_channel(&self, device: u8, bitrate: BitratePair) -> DriverResult<()>;

    /// Open the channel while probing the bus for `timeout` against every
    /// candidate. Returns the raw index of the candidate that matched; the
    /// caller validates it.
    fn detect_bitrate(
        &self,
        device: u8,
        timeout: Duration,
        candidates: &[BitratePair],
    ) -> DriverResult<i32>;

    /// Transmit one frame. `id` carries [`EXTENDED_MARKER`](crate::can::EXTENDED_MARKER)
    /// when 29-bit addressing is forced.
    fn transmit(&self, device: u8, id: u32, rtr: bool, payload: &[u8]) -> DriverResult<()>;

    /// Block until a frame arrives. Drivers may return an idle status
    /// (see [`Status::is_idle`]) to let the caller check for shutdown.
    fn receive(&self, device: u8) -> DriverResult<Frame>;

    fn status(&self, device: u8) -> DriverResult<BusStatus>;

    fn close(&self, device: u8) -> DriverResult<()>;

    fn error_text(&self, status: Status) -> String {
        status.description()
    }
}
