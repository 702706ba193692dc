//! Digitizer board handles.
//!
//! The RADIANT (24-channel waveform digitizer, SPI bulk + UART control) and
//! the FLOWER (low-threshold trigger board) expose a fixed command set to
//! the rest of the daemon. The transport sits behind these handles; the data
//! production in this crate is a behavioral model of each board, which is
//! also what the end-to-end tests drive.

pub mod flower;
pub mod radiant;

pub use flower::Flower;
pub use radiant::Radiant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("could not open device {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("device not responding: {0}")]
    NotResponding(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
}

/// Board firmware revision, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub rev: u16,
}

impl FirmwareVersion {
    pub fn new(major: u16, minor: u16, rev: u16) -> FirmwareVersion {
        FirmwareVersion { major, minor, rev }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.rev)
    }
}
