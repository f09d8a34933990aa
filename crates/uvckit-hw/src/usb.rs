//! libusb transport via the `rusb` crate.

use crate::transport::{DeviceCandidate, DeviceId, TransportError, UsbTransport};
use byteorder::{ByteOrder, LittleEndian};
use rusb::{
    Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType, UsbContext,
};
use std::time::Duration;
use uvckit_core::descriptor::CLASS_VIDEO;
use uvckit_core::ControlRequest;

const GET_DESCRIPTOR: u8 = 0x06;
const DT_CONFIGURATION: u16 = 0x02;
const CONFIG_HEADER_LEN: usize = 9;

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => TransportError::Nak,
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::NoDevice => TransportError::NoDevice,
            rusb::Error::Access => TransportError::Access,
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// An interface claimed on its own libusb handle.
pub struct RusbClaim {
    handle: DeviceHandle<Context>,
    interface: u8,
}

/// [`UsbTransport`] over a private libusb context.
pub struct RusbTransport {
    context: Context,
    timeout: Duration,
}

impl RusbTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let context = Context::new()?;
        Ok(Self { context, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn has_video_interface(device: &Device<Context>) -> bool {
    let Ok(config) = device.config_descriptor(0) else {
        return false;
    };
    config.interfaces().any(|interface| {
        interface
            .descriptors()
            .any(|d| d.class_code() == CLASS_VIDEO)
    })
}

/// iProduct string, if the device can be opened and reports one.
fn product_name(device: &Device<Context>, descriptor: &DeviceDescriptor) -> Option<String> {
    let handle = match device.open() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!(bus = device.bus_number(), address = device.address(), error = %e, "cannot open device for its name");
            return None;
        }
    };
    handle
        .read_product_string_ascii(descriptor)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// A SET that moved fewer bytes than its payload is a failed write.
fn check_written(expected: usize, actual: usize) -> Result<usize, TransportError> {
    if actual < expected {
        return Err(TransportError::ShortTransfer { expected, actual });
    }
    Ok(actual)
}

impl UsbTransport for RusbTransport {
    type Device = Device<Context>;
    type Claimed = RusbClaim;

    fn enumerate(&self) -> Result<Vec<DeviceCandidate<Self::Device>>, TransportError> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if !has_video_interface(&device) {
                continue;
            }
            found.push(DeviceCandidate {
                id: DeviceId {
                    bus: device.bus_number(),
                    address: device.address(),
                },
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                name: product_name(&device, &descriptor),
                device,
            });
        }
        tracing::debug!(count = found.len(), "enumerated video devices");
        Ok(found)
    }

    fn read_config_descriptor(&self, device: &Self::Device) -> Result<Vec<u8>, TransportError> {
        let handle = device.open()?;
        let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let value = DT_CONFIGURATION << 8;

        let mut header = [0u8; CONFIG_HEADER_LEN];
        let n = handle.read_control(request_type, GET_DESCRIPTOR, value, 0, &mut header, self.timeout)?;
        if n < CONFIG_HEADER_LEN {
            return Err(TransportError::ShortTransfer {
                expected: CONFIG_HEADER_LEN,
                actual: n,
            });
        }

        let total = LittleEndian::read_u16(&header[2..4]) as usize;
        let mut buf = vec![0u8; total.max(CONFIG_HEADER_LEN)];
        let n = handle.read_control(request_type, GET_DESCRIPTOR, value, 0, &mut buf, self.timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn claim_interface(
        &self,
        device: &Self::Device,
        interface: u8,
    ) -> Result<Self::Claimed, TransportError> {
        let handle = device.open()?;
        // Not supported on every platform; the claim below reports real failures.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            tracing::debug!(error = %e, "kernel driver auto-detach unavailable");
        }
        handle.claim_interface(interface)?;
        tracing::debug!(interface, "claimed interface");
        Ok(RusbClaim { handle, interface })
    }

    fn control_transfer(
        &self,
        claimed: &mut Self::Claimed,
        request: &ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        if request.is_read() {
            let n = claimed.handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                buf,
                self.timeout,
            )?;
            return Ok(n);
        }

        let n = claimed.handle.write_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            buf,
            self.timeout,
        )?;
        check_written(buf.len(), n)
    }

    fn set_alternate_setting(
        &self,
        claimed: &mut Self::Claimed,
        interface: u8,
        alt: u8,
    ) -> Result<(), TransportError> {
        claimed.handle.set_alternate_setting(interface, alt)?;
        Ok(())
    }

    fn release_interface(&self, claimed: Self::Claimed) -> Result<(), TransportError> {
        claimed.handle.release_interface(claimed.interface)?;
        tracing::debug!(interface = claimed.interface, "released interface");
        Ok(())
    }
}
