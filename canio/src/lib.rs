//! CAN bus message I/O.
//!
//! Open a device with [`open`], [`start`](Distributor::start) it, and consume
//! frames through [`Subscription`]s or the filtered reads
//! ([`Distributor::read_by_id`] and friends).

pub mod broadcast;
pub mod can;
pub mod config;
pub mod detect;
pub mod distributor;
pub mod driver;
pub mod error;
pub mod read;
mod util;

pub use broadcast::Broadcast;
pub use can::bitrate::BitratePair;
pub use can::mode::OperatingMode;
pub use can::{Frame, FrameFilter};
pub use config::{open, BitrateSelection, DeviceConfig};
pub use detect::{BitrateDetector, DetectState, Detected};
pub use distributor::{Distributor, Stats, SubscriberId, Subscription};
pub use driver::{BusStatus, Driver, Status, VirtualDriver};
pub use error::{Error, Result};
pub use read::FilteredRead;
