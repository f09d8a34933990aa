//! USB transport abstraction.
//!
//! Everything the device layer needs from USB, reduced to six blocking
//! calls. The libusb implementation lives in [`crate::usb`]; tests use a
//! recording mock.

use std::fmt;
use thiserror::Error;
use uvckit_core::ControlRequest;

/// Bus location of a USB device; unique while the device stays plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// A device exposing at least one video class interface.
#[derive(Debug, Clone)]
pub struct DeviceCandidate<D> {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    /// iProduct string, when readable.
    pub name: Option<String>,
    pub device: D,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device did not answer in time. Treated as a NAK and retried once.
    #[error("transfer not acknowledged")]
    Nak,
    /// The device stalled the control pipe (request rejected).
    #[error("control pipe stalled")]
    Stall,
    #[error("interface busy")]
    Busy,
    #[error("entity not found")]
    NotFound,
    #[error("device disconnected")]
    NoDevice,
    #[error("permission denied")]
    Access,
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Nak)
    }
}

/// Blocking USB operations used by the registry and sessions.
pub trait UsbTransport: Send + Sync {
    /// Opaque device reference produced by [`UsbTransport::enumerate`].
    type Device: Clone + Send + Sync;
    /// An interface claimed for exclusive use.
    type Claimed: Send;

    /// List attached devices that expose a video class interface.
    fn enumerate(&self) -> Result<Vec<DeviceCandidate<Self::Device>>, TransportError>;

    /// Fetch the raw active configuration descriptor.
    fn read_config_descriptor(&self, device: &Self::Device) -> Result<Vec<u8>, TransportError>;

    fn claim_interface(
        &self,
        device: &Self::Device,
        interface: u8,
    ) -> Result<Self::Claimed, TransportError>;

    /// Issue a control transfer on endpoint 0.
    ///
    /// For reads `buf` receives the response; for writes it holds the
    /// payload. Returns the number of bytes transferred.
    fn control_transfer(
        &self,
        claimed: &mut Self::Claimed,
        request: &ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransportError>;

    fn set_alternate_setting(
        &self,
        claimed: &mut Self::Claimed,
        interface: u8,
        alt: u8,
    ) -> Result<(), TransportError>;

    fn release_interface(&self, claimed: Self::Claimed) -> Result<(), TransportError>;
}
