//! Device session: one open UVC device with its VideoControl interface
//! claimed.
//!
//! Every control and streaming operation takes the session mutex for its
//! whole duration, so control transfers issued from different threads
//! never interleave on the wire.

use crate::registry::DeviceRegistry;
use crate::transport::{DeviceCandidate, DeviceId, TransportError, UsbTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uvckit_core::descriptor::{self, DescriptorError, StreamingInterface};
use uvckit_core::format::{VS_COMMIT_CONTROL, VS_PROBE_CONTROL};
use uvckit_core::request::{self, RequestError};
use uvckit_core::value::{self, ValueError};
use uvckit_core::{
    AutoExposureMode, CameraControl, Control, ControlCaps, ControlDescriptor, ControlRange,
    ControlRequest, ControlValue, FormatDescriptor, FormatRequest, Negotiated, NegotiationError,
    Negotiator, ParsedDescriptors, PowerLineFrequency, ProcessingControl, Query, StreamingControl,
    ValueLayout,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device busy")]
    DeviceBusy,
    #[error("video control interface not found")]
    InterfaceNotFound,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("control {0} not supported by this device")]
    UnsupportedControl(Control),
    #[error("operation not valid while session is {0:?}")]
    InvalidState(SessionState),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            SessionError::Value(ValueError::OutOfRange { .. })
                | SessionError::Request(RequestError::Value(ValueError::OutOfRange { .. }))
        )
    }
}

fn claim_error(e: TransportError) -> SessionError {
    match e {
        TransportError::Busy => SessionError::DeviceBusy,
        TransportError::NotFound => SessionError::InterfaceNotFound,
        other => SessionError::Transport(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Streaming,
}

/// Cooperative cancellation, checked between a failed transfer and its retry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ActiveStream<C> {
    claimed: C,
    interface: u8,
    alt: u8,
    committed: StreamingControl,
}

struct Inner<C> {
    state: SessionState,
    control: Option<C>,
    stream: Option<ActiveStream<C>>,
    /// Lengths learned with GET_LEN.
    lengths: HashMap<Control, u16>,
    /// Bounds fetched on first use.
    ranges: HashMap<Control, ControlRange>,
}

/// An open UVC device.
pub struct DeviceSession<'r, T: UsbTransport> {
    registry: &'r DeviceRegistry<T>,
    candidate: DeviceCandidate<T::Device>,
    descriptors: ParsedDescriptors,
    control_interface: u8,
    inner: Mutex<Inner<T::Claimed>>,
    cancel: CancelToken,
}

impl<'r, T: UsbTransport> DeviceSession<'r, T> {
    pub(crate) fn open(
        registry: &'r DeviceRegistry<T>,
        candidate: DeviceCandidate<T::Device>,
    ) -> Result<Self, SessionError> {
        let transport = registry.transport();
        let raw = transport.read_config_descriptor(&candidate.device)?;
        let descriptors = descriptor::parse(&raw)?;
        let control_interface = descriptors
            .control_interface
            .ok_or(SessionError::InterfaceNotFound)?;

        let claimed = transport
            .claim_interface(&candidate.device, control_interface)
            .map_err(claim_error)?;

        tracing::info!(
            device = %candidate.id,
            vendor_id = format_args!("{:04x}", candidate.vendor_id),
            product_id = format_args!("{:04x}", candidate.product_id),
            uvc_version = format_args!("{:x}.{:02x}", descriptors.uvc_version >> 8, descriptors.uvc_version & 0xff),
            controls = descriptors.controls().count(),
            formats = descriptors.formats.len(),
            "opened session"
        );

        Ok(Self {
            registry,
            candidate,
            descriptors,
            control_interface,
            inner: Mutex::new(Inner {
                state: SessionState::Opened,
                control: Some(claimed),
                stream: None,
                lengths: HashMap::new(),
                ranges: HashMap::new(),
            }),
            cancel: CancelToken::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.candidate.id
    }

    pub fn vendor_id(&self) -> u16 {
        self.candidate.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.candidate.product_id
    }

    pub fn descriptors(&self) -> &ParsedDescriptors {
        &self.descriptors
    }

    pub fn formats(&self) -> &[FormatDescriptor] {
        &self.descriptors.formats
    }

    pub fn controls(&self) -> impl Iterator<Item = &ControlDescriptor> {
        self.descriptors.controls()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Token that aborts a pending retry when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The probe/commit result of the running stream.
    pub fn committed_stream(&self) -> Option<StreamingControl> {
        self.lock().stream.as_ref().map(|s| s.committed.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T::Claimed>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a transfer, retrying once on a transient NAK.
    fn transfer(
        &self,
        claimed: &mut T::Claimed,
        request: &ControlRequest,
    ) -> Result<Vec<u8>, SessionError> {
        let transport = self.registry.transport();
        let mut retried = false;
        loop {
            let mut buf = if request.is_read() {
                vec![0u8; request.length as usize]
            } else {
                request.data.clone()
            };
            match transport.control_transfer(claimed, request, &mut buf) {
                Ok(n) => {
                    tracing::debug!(
                        request = format_args!("{:#04x}", request.request),
                        value = format_args!("{:#06x}", request.value),
                        index = format_args!("{:#06x}", request.index),
                        len = n,
                        "control transfer"
                    );
                    if request.is_read() {
                        buf.truncate(n);
                    }
                    return Ok(buf);
                }
                Err(e) if e.is_transient() && !retried => {
                    if self.cancel.is_cancelled() {
                        return Err(SessionError::Cancelled);
                    }
                    tracing::debug!(
                        request = format_args!("{:#04x}", request.request),
                        error = %e,
                        "retrying control transfer"
                    );
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn control_transfer(
        &self,
        inner: &mut Inner<T::Claimed>,
        request: &ControlRequest,
    ) -> Result<Vec<u8>, SessionError> {
        let claimed = inner
            .control
            .as_mut()
            .ok_or(SessionError::InvalidState(inner.state))?;
        self.transfer(claimed, request)
    }

    /// Descriptor for `control`, with its length learned if needed.
    fn resolve(
        &self,
        inner: &mut Inner<T::Claimed>,
        control: Control,
    ) -> Result<ControlDescriptor, SessionError> {
        let desc = match (self.descriptors.find_control(&control), control) {
            (Some(desc), _) => desc.clone(),
            (None, Control::Unknown { unit, .. }) if self.descriptors.unit(unit).is_some() => {
                ControlDescriptor::new(control, unit)
            }
            _ => return Err(SessionError::UnsupportedControl(control)),
        };
        if desc.length.is_some() {
            return Ok(desc);
        }
        if let Some(len) = inner.lengths.get(&control) {
            return Ok(desc.with_length(*len));
        }

        let req = request::encode_get(&desc, Query::Len, self.control_interface)?;
        let len = request::decode_len(&self.control_transfer(inner, &req)?)?;
        tracing::debug!(control = %control, len, "learned control length");
        inner.lengths.insert(control, len);
        Ok(desc.with_length(len))
    }

    fn query_locked(
        &self,
        inner: &mut Inner<T::Claimed>,
        desc: &ControlDescriptor,
        query: Query,
    ) -> Result<ControlValue, SessionError> {
        let req = request::encode_get(desc, query, self.control_interface)?;
        let data = self.control_transfer(inner, &req)?;
        Ok(request::decode(desc, query, &data)?)
    }

    fn range_locked(
        &self,
        inner: &mut Inner<T::Claimed>,
        desc: &ControlDescriptor,
    ) -> Result<ControlRange, SessionError> {
        let range = if let ValueLayout::Bitmap(_) = desc.layout {
            // Mode bitmaps only support GET_RES and GET_DEF.
            let res = self.query_locked(inner, desc, Query::Res)?;
            ControlRange {
                min: ControlValue::Int(0),
                max: res.clone(),
                res,
                def: self.query_locked(inner, desc, Query::Def)?,
            }
        } else {
            ControlRange {
                min: self.query_locked(inner, desc, Query::Min)?,
                max: self.query_locked(inner, desc, Query::Max)?,
                res: self.query_locked(inner, desc, Query::Res)?,
                def: self.query_locked(inner, desc, Query::Def)?,
            }
        };
        inner.ranges.insert(desc.control, range.clone());
        Ok(range)
    }

    /// Current value (GET_CUR).
    pub fn get(&self, control: Control) -> Result<ControlValue, SessionError> {
        self.query(control, Query::Cur)
    }

    /// Any GET request on `control`.
    pub fn query(&self, control: Control, query: Query) -> Result<ControlValue, SessionError> {
        let mut inner = self.lock();
        let desc = self.resolve(&mut inner, control)?;
        self.query_locked(&mut inner, &desc, query)
    }

    /// Fetch min/max/resolution/default and refresh the cached bounds.
    pub fn range(&self, control: Control) -> Result<ControlRange, SessionError> {
        let mut inner = self.lock();
        let desc = self.resolve(&mut inner, control)?;
        self.range_locked(&mut inner, &desc)
    }

    /// Capabilities reported by GET_INFO.
    pub fn info(&self, control: Control) -> Result<ControlCaps, SessionError> {
        let mut inner = self.lock();
        let desc = self.resolve(&mut inner, control)?;
        let req = request::encode_get(&desc, Query::Info, self.control_interface)?;
        Ok(request::decode_info(&self.control_transfer(&mut inner, &req)?)?)
    }

    /// Validate `value` against the control's bounds, then SET_CUR.
    ///
    /// Bounds are fetched on first use and cached for the session; a value
    /// outside them is rejected before the SET transfer.
    pub fn set(&self, control: Control, value: &ControlValue) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let desc = self.resolve(&mut inner, control)?;
        self.set_locked(&mut inner, &desc, value)
    }

    /// Write the device default (GET_DEF) back through a validated SET.
    pub fn reset_to_default(&self, control: Control) -> Result<ControlValue, SessionError> {
        let mut inner = self.lock();
        let desc = self.resolve(&mut inner, control)?;
        let default = self.query_locked(&mut inner, &desc, Query::Def)?;
        self.set_locked(&mut inner, &desc, &default)?;
        tracing::info!(control = %control, value = %default, "reset control to default");
        Ok(default)
    }

    fn set_locked(
        &self,
        inner: &mut Inner<T::Claimed>,
        desc: &ControlDescriptor,
        value: &ControlValue,
    ) -> Result<(), SessionError> {
        let control = desc.control;
        if !desc.caps.contains(ControlCaps::SET) {
            return Err(SessionError::UnsupportedControl(control));
        }
        value::validate(desc.layout, None, value)?;

        if desc.layout.has_range() {
            let cached = inner.ranges.get(&control).cloned();
            let range = match cached {
                Some(range) => range,
                None => self.range_locked(inner, desc)?,
            };
            value::validate(desc.layout, Some(&range), value)?;
        }

        let req = request::encode_set(desc, value, self.control_interface)?;
        self.control_transfer(inner, &req)?;
        tracing::debug!(control = %control, value = %value, "set control");
        Ok(())
    }

    fn get_int(&self, control: impl Into<Control>) -> Result<i64, SessionError> {
        let control = control.into();
        let value = self.get(control)?;
        value.as_int().ok_or_else(|| {
            SessionError::Value(ValueError::LayoutMismatch {
                value: value.to_string(),
                layout: control.layout(),
            })
        })
    }

    fn set_int(&self, control: impl Into<Control>, value: i64) -> Result<(), SessionError> {
        self.set(control.into(), &ControlValue::Int(value))
    }

    /// Exposure time in 100 µs units.
    pub fn exposure_time_absolute(&self) -> Result<u32, SessionError> {
        Ok(self.get_int(CameraControl::ExposureTimeAbsolute)? as u32)
    }

    pub fn set_exposure_time_absolute(&self, value: u32) -> Result<(), SessionError> {
        self.set_int(CameraControl::ExposureTimeAbsolute, value as i64)
    }

    pub fn auto_exposure_mode(&self) -> Result<AutoExposureMode, SessionError> {
        let bits = self.get_int(CameraControl::AutoExposureMode)?;
        AutoExposureMode::from_bits(bits as u8).ok_or_else(|| {
            SessionError::Value(ValueError::OutOfRange {
                value: bits,
                constraint: "auto-exposure mode".to_string(),
            })
        })
    }

    pub fn set_auto_exposure_mode(&self, mode: AutoExposureMode) -> Result<(), SessionError> {
        self.set_int(CameraControl::AutoExposureMode, mode.bits() as i64)
    }

    pub fn focus_absolute(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(CameraControl::FocusAbsolute)? as u16)
    }

    pub fn set_focus_absolute(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(CameraControl::FocusAbsolute, value as i64)
    }

    pub fn focus_auto(&self) -> Result<bool, SessionError> {
        Ok(self.get_int(CameraControl::FocusAuto)? != 0)
    }

    pub fn set_focus_auto(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_int(CameraControl::FocusAuto, enabled as i64)
    }

    pub fn zoom_absolute(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(CameraControl::ZoomAbsolute)? as u16)
    }

    pub fn set_zoom_absolute(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(CameraControl::ZoomAbsolute, value as i64)
    }

    /// Pan and tilt in arc-seconds.
    pub fn pan_tilt_absolute(&self) -> Result<(i32, i32), SessionError> {
        let control = Control::Camera(CameraControl::PanTiltAbsolute);
        let value = self.get(control)?;
        let (pan, tilt) = value.as_pair().ok_or_else(|| {
            SessionError::Value(ValueError::LayoutMismatch {
                value: value.to_string(),
                layout: control.layout(),
            })
        })?;
        Ok((pan as i32, tilt as i32))
    }

    pub fn set_pan_tilt_absolute(&self, pan: i32, tilt: i32) -> Result<(), SessionError> {
        self.set(
            Control::Camera(CameraControl::PanTiltAbsolute),
            &ControlValue::Pair(pan as i64, tilt as i64),
        )
    }

    /// White balance temperature in kelvin.
    pub fn white_balance_temperature(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(ProcessingControl::WhiteBalanceTemperature)? as u16)
    }

    pub fn set_white_balance_temperature(&self, kelvin: u16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::WhiteBalanceTemperature, kelvin as i64)
    }

    pub fn white_balance_temperature_auto(&self) -> Result<bool, SessionError> {
        Ok(self.get_int(ProcessingControl::WhiteBalanceTemperatureAuto)? != 0)
    }

    pub fn set_white_balance_temperature_auto(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::WhiteBalanceTemperatureAuto, enabled as i64)
    }

    pub fn gain(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(ProcessingControl::Gain)? as u16)
    }

    pub fn set_gain(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::Gain, value as i64)
    }

    pub fn brightness(&self) -> Result<i16, SessionError> {
        Ok(self.get_int(ProcessingControl::Brightness)? as i16)
    }

    pub fn set_brightness(&self, value: i16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::Brightness, value as i64)
    }

    pub fn contrast(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(ProcessingControl::Contrast)? as u16)
    }

    pub fn set_contrast(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::Contrast, value as i64)
    }

    pub fn saturation(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(ProcessingControl::Saturation)? as u16)
    }

    pub fn set_saturation(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::Saturation, value as i64)
    }

    pub fn sharpness(&self) -> Result<u16, SessionError> {
        Ok(self.get_int(ProcessingControl::Sharpness)? as u16)
    }

    pub fn set_sharpness(&self, value: u16) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::Sharpness, value as i64)
    }

    pub fn power_line_frequency(&self) -> Result<PowerLineFrequency, SessionError> {
        let value = self.get_int(ProcessingControl::PowerLineFrequency)?;
        PowerLineFrequency::from_value(value as u8).ok_or_else(|| {
            SessionError::Value(ValueError::OutOfRange {
                value,
                constraint: "power-line frequency".to_string(),
            })
        })
    }

    pub fn set_power_line_frequency(&self, mode: PowerLineFrequency) -> Result<(), SessionError> {
        self.set_int(ProcessingControl::PowerLineFrequency, mode.value() as i64)
    }

    /// Pick a format from the device's enumerated set.
    pub fn negotiate(
        &self,
        negotiator: &dyn Negotiator,
        request: &FormatRequest,
    ) -> Result<Negotiated, SessionError> {
        Ok(negotiator.select(&self.descriptors.formats, request)?)
    }

    /// Claim the streaming interface and run probe/commit for `format`.
    ///
    /// Returns the committed streaming parameters. Isochronous interfaces
    /// are switched to the smallest alternate setting that carries
    /// dwMaxPayloadTransferSize.
    pub fn start_stream(
        &self,
        format: &FormatDescriptor,
        interval: u32,
    ) -> Result<StreamingControl, SessionError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Opened {
            return Err(SessionError::InvalidState(inner.state));
        }
        if !self.descriptors.formats.contains(format) {
            return Err(SessionError::UnsupportedFormat(format!(
                "{format} is not offered by the device"
            )));
        }
        if !format.intervals.contains(interval) {
            return Err(SessionError::UnsupportedFormat(format!(
                "frame interval {interval} not supported by {format}"
            )));
        }
        let interface = self
            .descriptors
            .streaming_interface(format.interface)
            .ok_or(SessionError::InterfaceNotFound)?;

        let transport = self.registry.transport();
        let mut claimed = transport
            .claim_interface(&self.candidate.device, interface.number)
            .map_err(claim_error)?;

        match self.probe_and_commit(&mut claimed, interface, format, interval) {
            Ok((committed, alt)) => {
                tracing::info!(
                    device = %self.candidate.id,
                    format = %format,
                    interval,
                    interface = interface.number,
                    alt,
                    payload = committed.max_payload_transfer_size,
                    "stream started"
                );
                inner.stream = Some(ActiveStream {
                    claimed,
                    interface: interface.number,
                    alt,
                    committed: committed.clone(),
                });
                inner.state = SessionState::Streaming;
                Ok(committed)
            }
            Err(e) => {
                if let Err(release) = transport.release_interface(claimed) {
                    tracing::warn!(error = %release, "failed to release streaming interface");
                }
                Err(e)
            }
        }
    }

    fn probe_and_commit(
        &self,
        claimed: &mut T::Claimed,
        interface: &StreamingInterface,
        format: &FormatDescriptor,
        interval: u32,
    ) -> Result<(StreamingControl, u8), SessionError> {
        let len = StreamingControl::wire_len(self.descriptors.uvc_version);
        let probe = StreamingControl::for_format(&Negotiated {
            format: format.clone(),
            interval,
        });
        let number = interface.number;

        self.transfer(
            claimed,
            &ControlRequest::set(VS_PROBE_CONTROL, 0, number, probe.encode(len)),
        )?;
        let data = self.transfer(
            claimed,
            &ControlRequest::get(Query::Cur.code(), VS_PROBE_CONTROL, 0, number, len as u16),
        )?;
        let negotiated = StreamingControl::decode(&data)?;
        self.transfer(
            claimed,
            &ControlRequest::set(VS_COMMIT_CONTROL, 0, number, data),
        )?;

        let payload = negotiated.max_payload_transfer_size;
        let alt = select_alt_setting(interface, payload).ok_or_else(|| {
            SessionError::UnsupportedFormat(format!(
                "no alternate setting carries {payload} bytes per interval"
            ))
        })?;
        if alt != 0 {
            self.registry
                .transport()
                .set_alternate_setting(claimed, number, alt)?;
        }
        Ok((negotiated, alt))
    }

    /// Return the streaming interface to alt 0 and release it.
    pub fn stop_stream(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        stop_stream_locked(self.registry.transport(), &mut inner)
    }

    /// Stop any stream and release the device. Never fails; errors are logged.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let registry = self.registry;
        let transport = registry.transport();
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state == SessionState::Closed {
            return;
        }

        if inner.stream.is_some() {
            if let Err(e) = stop_stream_locked(transport, inner) {
                tracing::warn!(device = %self.candidate.id, error = %e, "failed to stop stream on close");
            }
        }
        if let Some(claimed) = inner.control.take() {
            if let Err(e) = transport.release_interface(claimed) {
                tracing::warn!(device = %self.candidate.id, error = %e, "failed to release control interface");
            }
        }
        inner.state = SessionState::Closed;
        registry.release(self.candidate.id);
        tracing::info!(device = %self.candidate.id, "closed session");
    }
}

impl<T: UsbTransport> Drop for DeviceSession<'_, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_stream_locked<T: UsbTransport>(
    transport: &T,
    inner: &mut Inner<T::Claimed>,
) -> Result<(), SessionError> {
    let mut stream = inner
        .stream
        .take()
        .ok_or(SessionError::InvalidState(inner.state))?;
    inner.state = SessionState::Opened;

    let alt = transport.set_alternate_setting(&mut stream.claimed, stream.interface, 0);
    let release = transport.release_interface(stream.claimed);
    tracing::info!(interface = stream.interface, from_alt = stream.alt, "stream stopped");
    alt?;
    release?;
    Ok(())
}

/// Alternate setting able to carry `payload` bytes per service interval.
///
/// Bulk interfaces stream on alt 0. For isochronous ones, the smallest
/// sufficient endpoint wins.
pub fn select_alt_setting(interface: &StreamingInterface, payload: u32) -> Option<u8> {
    if interface.is_bulk() {
        return Some(0);
    }
    interface
        .alt_settings
        .iter()
        .filter(|a| a.alt != 0 && a.isochronous && a.payload_capacity() >= payload)
        .min_by_key(|a| (a.payload_capacity(), a.alt))
        .map(|a| a.alt)
}
