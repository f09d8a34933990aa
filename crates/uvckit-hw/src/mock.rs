//! Recording in-memory transport for tests.

use crate::transport::{DeviceCandidate, DeviceId, TransportError, UsbTransport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uvckit_core::controls::ControlDescriptor;
use uvckit_core::descriptor::{AltSetting, ParsedDescriptors, StreamingInterface, Unit, UnitKind};
use uvckit_core::format::{
    FormatDescriptor, FormatKind, FrameIntervals, PixelEncoding, StreamingControl, VS_PROBE_CONTROL,
};
use uvckit_core::request::SET_CUR;
use uvckit_core::{CameraControl, Control, ControlRequest, ProcessingControl, Query};

/// One observable transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Claim { interface: u8 },
    /// Start of a control transfer.
    Begin { request: u8, value: u16, index: u16 },
    /// End of a control transfer, with the SET payload if any.
    End { request: u8, value: u16, index: u16, data: Vec<u8> },
    SetAlt { interface: u8, alt: u8 },
    Release { interface: u8 },
}

pub struct MockClaim {
    pub device: DeviceId,
    pub interface: u8,
}

struct MockDevice {
    candidate: DeviceCandidate<DeviceId>,
    descriptor: Vec<u8>,
}

#[derive(Default)]
struct State {
    log: Vec<Call>,
    /// GET responses by (request code, wValue, wIndex).
    responses: HashMap<(u8, u16, u16), Vec<u8>>,
    /// Last SET_CUR payload by (wValue, wIndex).
    current: HashMap<(u16, u16), Vec<u8>>,
    failures: VecDeque<TransportError>,
    busy: HashSet<u8>,
    claimed: HashSet<(DeviceId, u8)>,
    probe_payload_size: u32,
    /// Bytes the device rewrites in the probe payload, by offset.
    probe_patches: Vec<(usize, Vec<u8>)>,
}

#[derive(Default)]
pub struct MockTransport {
    devices: Vec<MockDevice>,
    state: Mutex<State>,
    transfer_delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, vendor_id: u16, product_id: u16, descriptor: Vec<u8>) -> Self {
        let id = DeviceId {
            bus: 1,
            address: self.devices.len() as u8 + 2,
        };
        self.devices.push(MockDevice {
            candidate: DeviceCandidate {
                id,
                vendor_id,
                product_id,
                name: Some("Mock Webcam".to_string()),
                device: id,
            },
            descriptor,
        });
        self
    }

    /// Sleep inside every transfer so overlapping calls would show up in the log.
    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Canned answer for a GET request.
    pub fn respond(&self, request: u8, value: u16, index: u16, data: &[u8]) {
        self.state().responses.insert((request, value, index), data.to_vec());
    }

    /// Fail the next transfers with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state().failures.extend(errors);
    }

    pub fn set_busy(&self, interface: u8) {
        self.state().busy.insert(interface);
    }

    /// dwMaxPayloadTransferSize the device reports after a probe.
    pub fn set_probe_payload_size(&self, size: u32) {
        self.state().probe_payload_size = size;
    }

    /// Overwrite probe payload bytes at `offset`, as a device settling fields would.
    pub fn patch_probe(&self, offset: usize, bytes: &[u8]) {
        self.state().probe_patches.push((offset, bytes.to_vec()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().log.clone()
    }

    pub fn clear_calls(&self) {
        self.state().log.clear();
    }

    pub fn claimed(&self) -> Vec<u8> {
        let mut claimed: Vec<u8> = self.state().claimed.iter().map(|(_, i)| *i).collect();
        claimed.sort_unstable();
        claimed
    }

    /// Only completed transfers, as (request, wValue, wIndex).
    pub fn transfers(&self) -> Vec<(u8, u16, u16)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::End {
                    request,
                    value,
                    index,
                    ..
                } => Some((request, value, index)),
                _ => None,
            })
            .collect()
    }
}

impl UsbTransport for MockTransport {
    type Device = DeviceId;
    type Claimed = MockClaim;

    fn enumerate(&self) -> Result<Vec<DeviceCandidate<DeviceId>>, TransportError> {
        Ok(self.devices.iter().map(|d| d.candidate.clone()).collect())
    }

    fn read_config_descriptor(&self, device: &DeviceId) -> Result<Vec<u8>, TransportError> {
        self.devices
            .iter()
            .find(|d| d.candidate.id == *device)
            .map(|d| d.descriptor.clone())
            .ok_or(TransportError::NoDevice)
    }

    fn claim_interface(&self, device: &DeviceId, interface: u8) -> Result<MockClaim, TransportError> {
        let mut state = self.state();
        if state.busy.contains(&interface) || !state.claimed.insert((*device, interface)) {
            return Err(TransportError::Busy);
        }
        state.log.push(Call::Claim { interface });
        Ok(MockClaim {
            device: *device,
            interface,
        })
    }

    fn control_transfer(
        &self,
        _claimed: &mut MockClaim,
        request: &ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        {
            let mut state = self.state();
            state.log.push(Call::Begin {
                request: request.request,
                value: request.value,
                index: request.index,
            });
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
        }

        if let Some(delay) = self.transfer_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        let key = (request.value, request.index);
        let n = if request.request == SET_CUR {
            let mut data = buf.to_vec();
            let is_probe = request.value >> 8 == VS_PROBE_CONTROL as u16 && request.index >> 8 == 0;
            if is_probe && state.probe_payload_size > 0 {
                if let Ok(mut ctrl) = StreamingControl::decode(&data) {
                    ctrl.max_payload_transfer_size = state.probe_payload_size;
                    data = ctrl.encode(data.len());
                }
            }
            if is_probe {
                for (at, bytes) in &state.probe_patches {
                    if let Some(dst) = data.get_mut(*at..*at + bytes.len()) {
                        dst.copy_from_slice(bytes);
                    }
                }
            }
            state.current.insert(key, data);
            buf.len()
        } else {
            let stored = if request.request == Query::Cur.code() {
                state.current.get(&key).cloned()
            } else {
                None
            };
            let data = stored
                .or_else(|| state.responses.get(&(request.request, request.value, request.index)).cloned())
                .ok_or(TransportError::Stall)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            n
        };

        let data = if request.is_read() {
            Vec::new()
        } else {
            buf.to_vec()
        };
        state.log.push(Call::End {
            request: request.request,
            value: request.value,
            index: request.index,
            data,
        });
        Ok(n)
    }

    fn set_alternate_setting(
        &self,
        _claimed: &mut MockClaim,
        interface: u8,
        alt: u8,
    ) -> Result<(), TransportError> {
        self.state().log.push(Call::SetAlt { interface, alt });
        Ok(())
    }

    fn release_interface(&self, claimed: MockClaim) -> Result<(), TransportError> {
        let mut state = self.state();
        state.claimed.remove(&(claimed.device, claimed.interface));
        state.log.push(Call::Release {
            interface: claimed.interface,
        });
        Ok(())
    }
}

pub const VENDOR_ID: u16 = 0x046d;
pub const PRODUCT_ID: u16 = 0x085e;

/// Camera terminal 1, processing unit 2, extension unit 4, output terminal 3;
/// VideoControl on interface 0, isochronous streaming on interface 1.
pub fn webcam() -> ParsedDescriptors {
    let camera = [
        CameraControl::AutoExposureMode,
        CameraControl::ExposureTimeAbsolute,
        CameraControl::FocusAbsolute,
        CameraControl::ZoomAbsolute,
        CameraControl::PanTiltAbsolute,
        CameraControl::FocusAuto,
    ];
    let processing = [
        ProcessingControl::Brightness,
        ProcessingControl::Contrast,
        ProcessingControl::Saturation,
        ProcessingControl::Sharpness,
        ProcessingControl::WhiteBalanceTemperature,
        ProcessingControl::Gain,
        ProcessingControl::PowerLineFrequency,
        ProcessingControl::WhiteBalanceTemperatureAuto,
    ];
    let frame = |format_index: u8,
                 frame_index: u8,
                 kind: FormatKind,
                 encoding: PixelEncoding,
                 width: u16,
                 height: u16,
                 intervals: Vec<u32>| {
        FormatDescriptor {
            interface: 1,
            format_index,
            frame_index,
            kind,
            encoding,
            bits_per_pixel: if kind == FormatKind::Mjpeg { 0 } else { 16 },
            width,
            height,
            default_interval: intervals[0],
            intervals: FrameIntervals::Discrete(intervals),
        }
    };

    ParsedDescriptors {
        configuration_value: 1,
        control_interface: Some(0),
        uvc_version: 0x0110,
        clock_frequency: 48_000_000,
        units: vec![
            Unit {
                id: 1,
                kind: UnitKind::CameraTerminal,
                control_size: 3,
                controls: camera
                    .into_iter()
                    .map(|c| ControlDescriptor::new(Control::Camera(c), 1))
                    .collect(),
            },
            Unit {
                id: 2,
                kind: UnitKind::ProcessingUnit {
                    source: 1,
                    max_multiplier: 0,
                },
                control_size: 2,
                controls: processing
                    .into_iter()
                    .map(|p| ControlDescriptor::new(Control::Processing(p), 2))
                    .collect(),
            },
            Unit {
                id: 4,
                kind: UnitKind::ExtensionUnit {
                    guid: uuid_for_tests(),
                    sources: vec![2],
                },
                control_size: 1,
                controls: vec![
                    ControlDescriptor::new(Control::Extension { unit: 4, selector: 1 }, 4),
                    ControlDescriptor::new(Control::Extension { unit: 4, selector: 3 }, 4),
                ],
            },
            Unit {
                id: 3,
                kind: UnitKind::OutputTerminal {
                    terminal_type: 0x0101,
                    source: 4,
                },
                control_size: 0,
                controls: Vec::new(),
            },
        ],
        streaming: vec![StreamingInterface {
            number: 1,
            endpoint: 0x81,
            terminal_link: 3,
            alt_settings: vec![
                AltSetting {
                    alt: 1,
                    endpoint: 0x81,
                    isochronous: true,
                    max_packet_size: 0x0200,
                },
                AltSetting {
                    alt: 2,
                    endpoint: 0x81,
                    isochronous: true,
                    max_packet_size: 0x1400,
                },
            ],
        }],
        formats: vec![
            frame(1, 1, FormatKind::Uncompressed, PixelEncoding::Yuyv, 640, 480, vec![333_333, 666_666]),
            frame(2, 1, FormatKind::Mjpeg, PixelEncoding::Mjpeg, 1280, 720, vec![333_333]),
        ],
    }
}

fn uuid_for_tests() -> uuid::Uuid {
    uuid::Uuid::from_u128(0x1229a78c_47b4_4094_b0ce_db07386fb938)
}

fn le(value: i64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width].to_vec()
}

impl MockTransport {
    /// GET_MIN/MAX/RES/DEF answers for a scalar control on interface 0.
    pub fn respond_range(&self, unit: u8, selector: u8, width: usize, min: i64, max: i64, res: i64, def: i64) {
        let value = (selector as u16) << 8;
        let index = (unit as u16) << 8;
        for (query, v) in [(Query::Min, min), (Query::Max, max), (Query::Res, res), (Query::Def, def)] {
            self.respond(query.code(), value, index, &le(v, width));
        }
    }

    /// GET_CUR answer for a scalar control on interface 0.
    pub fn respond_cur(&self, unit: u8, selector: u8, width: usize, value: i64) {
        self.respond(
            Query::Cur.code(),
            (selector as u16) << 8,
            (unit as u16) << 8,
            &le(value, width),
        );
    }
}

/// A mock with the webcam attached and realistic control ranges.
pub fn webcam_transport() -> MockTransport {
    let mock = MockTransport::new().with_device(VENDOR_ID, PRODUCT_ID, webcam().to_bytes());
    // exposure-time-absolute: 100..1000 step 50
    mock.respond_range(1, 0x04, 4, 100, 1000, 50, 300);
    // auto-exposure-mode: manual | aperture priority. Bitmap controls
    // answer only GET_RES and GET_DEF; MIN and MAX stall.
    mock.respond(Query::Res.code(), 0x0200, 0x0100, &[0x09]);
    mock.respond(Query::Def.code(), 0x0200, 0x0100, &[0x08]);
    mock.respond_cur(1, 0x02, 1, 0x08);
    mock.respond_range(1, 0x06, 2, 0, 250, 5, 0);
    mock.respond_range(1, 0x0B, 2, 100, 500, 1, 100);
    // pan/tilt: ±180° / ±90° in 1° steps (arc-seconds)
    let pan_tilt = |pan: i64, tilt: i64| {
        let mut v = le(pan, 4);
        v.extend(le(tilt, 4));
        v
    };
    for (query, pan, tilt) in [
        (Query::Min, -648_000, -324_000),
        (Query::Max, 648_000, 324_000),
        (Query::Res, 3600, 3600),
        (Query::Def, 0, 0),
    ] {
        mock.respond(query.code(), 0x0D00, 0x0100, &pan_tilt(pan, tilt));
    }
    mock.respond_range(2, 0x02, 2, -64, 64, 1, 0);
    mock.respond_range(2, 0x03, 2, 0, 95, 1, 32);
    mock.respond_range(2, 0x07, 2, 0, 100, 1, 64);
    mock.respond_range(2, 0x08, 2, 1, 7, 1, 2);
    mock.respond_range(2, 0x04, 2, 0, 100, 1, 0);
    mock.respond_range(2, 0x0A, 2, 2800, 6500, 10, 4600);
    mock.respond_range(2, 0x05, 1, 0, 2, 1, 1);
    mock
}
