mod detection;
mod device;
mod error;
mod parse;

pub use detection::{AdbDetection, locate_adb};
pub use device::AdbDevice;
pub use error::AdbError;
