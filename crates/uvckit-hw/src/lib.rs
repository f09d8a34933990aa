//! uvckit-hw — USB access for UVC cameras.
//!
//! Provides the USB transport (libusb via `rusb`), the device registry,
//! control sessions with probe/commit streaming setup, and TOML control
//! presets.

#[cfg(test)]
mod mock;
pub mod preset;
pub mod registry;
pub mod session;
pub mod transport;
pub mod usb;

pub use preset::{Preset, PresetError};
pub use registry::DeviceRegistry;
pub use session::{CancelToken, DeviceSession, SessionError, SessionState};
pub use transport::{DeviceCandidate, DeviceId, TransportError, UsbTransport};
pub use usb::RusbTransport;
