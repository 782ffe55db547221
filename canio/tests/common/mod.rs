#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use canio::{DeviceConfig, Distributor, Frame, OperatingMode, VirtualDriver};

pub const PATIENCE: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bus() -> Arc<VirtualDriver> {
    Arc::new(VirtualDriver::new().with_poll_interval(Duration::from_millis(10)))
}

pub fn device(driver: &Arc<VirtualDriver>, number: u8) -> Distributor {
    device_with_mode(driver, number, OperatingMode::default())
}

pub fn device_with_mode(driver: &Arc<VirtualDriver>, number: u8, mode: OperatingMode) -> Distributor {
    device_with_config(
        driver,
        DeviceConfig {
            number,
            mode,
            ..DeviceConfig::default()
        },
    )
}

pub fn device_with_config(driver: &Arc<VirtualDriver>, config: DeviceConfig) -> Distributor {
    canio::open(driver.clone(), &config).unwrap()
}

pub fn frame(id: u32, data: &[u8]) -> Frame {
    Frame::new(id, data).unwrap()
}

/// Inject `frames` into `device` after `delay`, from a blocking thread.
pub fn inject_later(driver: &Arc<VirtualDriver>, device: u8, delay: Duration, frames: Vec<Frame>) {
    let driver = driver.clone();
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        for frame in frames {
            driver.inject(device, frame).unwrap();
        }
    });
}
