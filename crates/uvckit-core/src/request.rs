//! UVC class-specific control request encoding and decoding.
//!
//! Setup packet layout (UVC 1.5 §4.1):
//!   bmRequestType = 0x21 (SET) / 0xA1 (GET)   class, interface recipient
//!   bRequest      = request code
//!   wValue        = selector << 8
//!   wIndex        = entity_id << 8 | interface_number
//!   wLength       = payload length

use crate::controls::{ControlCaps, ControlDescriptor, ValueLayout};
use crate::value::{ControlValue, ValueError};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Host-to-device, class request, interface recipient.
pub const REQUEST_TYPE_SET: u8 = 0x21;
/// Device-to-host, class request, interface recipient.
pub const REQUEST_TYPE_GET: u8 = 0xA1;

pub const SET_CUR: u8 = 0x01;

/// GET request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    Cur,
    Min,
    Max,
    Res,
    Len,
    Info,
    Def,
}

impl Query {
    pub fn code(&self) -> u8 {
        match self {
            Query::Cur => 0x81,
            Query::Min => 0x82,
            Query::Max => 0x83,
            Query::Res => 0x84,
            Query::Len => 0x85,
            Query::Info => 0x86,
            Query::Def => 0x87,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("response length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("control length unknown; query GET_LEN first")]
    UnknownLength,
    #[error("control does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// A fully-formed control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Payload for SET requests; empty for GET.
    pub data: Vec<u8>,
}

impl ControlRequest {
    pub fn is_read(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Class GET on an entity (or the interface itself when `entity` is 0).
    pub fn get(code: u8, selector: u8, entity: u8, interface: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_GET,
            request: code,
            value: (selector as u16) << 8,
            index: (entity as u16) << 8 | interface as u16,
            length,
            data: Vec::new(),
        }
    }

    /// Class SET_CUR on an entity (or the interface itself when `entity` is 0).
    pub fn set(selector: u8, entity: u8, interface: u8, data: Vec<u8>) -> Self {
        Self {
            request_type: REQUEST_TYPE_SET,
            request: SET_CUR,
            value: (selector as u16) << 8,
            index: (entity as u16) << 8 | interface as u16,
            length: data.len() as u16,
            data,
        }
    }
}

fn expected_len(desc: &ControlDescriptor, query: Query) -> Result<u16, RequestError> {
    match query {
        Query::Info => Ok(1),
        Query::Len => Ok(2),
        _ => desc.length.ok_or(RequestError::UnknownLength),
    }
}

/// Build a GET request for `desc` on the video control interface.
pub fn encode_get(
    desc: &ControlDescriptor,
    query: Query,
    interface: u8,
) -> Result<ControlRequest, RequestError> {
    // GET_INFO and GET_LEN are mandatory for every control; the rest need GET.
    if !matches!(query, Query::Info | Query::Len) && !desc.caps.contains(ControlCaps::GET) {
        return Err(RequestError::Unsupported("GET"));
    }
    let length = expected_len(desc, query)?;
    Ok(ControlRequest::get(
        query.code(),
        desc.control.selector(),
        desc.unit_id,
        interface,
        length,
    ))
}

/// Build a SET_CUR request carrying `value`.
///
/// Only checks that the value fits the layout; bounds are the caller's job.
pub fn encode_set(
    desc: &ControlDescriptor,
    value: &ControlValue,
    interface: u8,
) -> Result<ControlRequest, RequestError> {
    if !desc.caps.contains(ControlCaps::SET) {
        return Err(RequestError::Unsupported("SET"));
    }
    let length = desc.length.ok_or(RequestError::UnknownLength)?;
    crate::value::validate(desc.layout, None, value)?;
    let data = encode_value(desc.layout, length, value)?;
    Ok(ControlRequest::set(
        desc.control.selector(),
        desc.unit_id,
        interface,
        data,
    ))
}

/// Decode a GET response for `desc`.
pub fn decode(
    desc: &ControlDescriptor,
    query: Query,
    data: &[u8],
) -> Result<ControlValue, RequestError> {
    let expected = expected_len(desc, query)? as usize;
    if data.len() != expected {
        return Err(RequestError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }
    match query {
        Query::Info => Ok(ControlValue::Int(data[0] as i64)),
        Query::Len => Ok(ControlValue::Int(LittleEndian::read_u16(data) as i64)),
        _ => Ok(decode_value(desc.layout, data)),
    }
}

/// Decode a GET_INFO response into capability flags.
pub fn decode_info(data: &[u8]) -> Result<ControlCaps, RequestError> {
    match data {
        [info] => Ok(ControlCaps::from_bits_truncate(*info)),
        _ => Err(RequestError::LengthMismatch {
            expected: 1,
            actual: data.len(),
        }),
    }
}

/// Decode a GET_LEN response.
pub fn decode_len(data: &[u8]) -> Result<u16, RequestError> {
    if data.len() != 2 {
        return Err(RequestError::LengthMismatch {
            expected: 2,
            actual: data.len(),
        });
    }
    Ok(LittleEndian::read_u16(data))
}

/// Encode a value little-endian in the layout's fixed width.
pub fn encode_value(
    layout: ValueLayout,
    length: u16,
    value: &ControlValue,
) -> Result<Vec<u8>, RequestError> {
    let length = length as usize;
    if let Some(fixed) = layout.len() {
        if fixed as usize != length {
            return Err(RequestError::LengthMismatch {
                expected: length,
                actual: fixed as usize,
            });
        }
    }

    let mut buf = vec![0u8; length];
    match (layout, value) {
        (ValueLayout::Raw, ControlValue::Raw(bytes)) => {
            if bytes.len() != length {
                return Err(RequestError::LengthMismatch {
                    expected: length,
                    actual: bytes.len(),
                });
            }
            buf.copy_from_slice(bytes);
        }
        (ValueLayout::SignedPair(w), ControlValue::Pair(a, b))
        | (ValueLayout::UnsignedPair(w), ControlValue::Pair(a, b)) => {
            let w = w as usize;
            write_field(&mut buf[..w], *a, layout.is_signed());
            write_field(&mut buf[w..], *b, layout.is_signed());
        }
        (_, ControlValue::Int(v)) if !matches!(layout, ValueLayout::Raw) => {
            write_field(&mut buf, *v, layout.is_signed());
        }
        _ => {
            return Err(ValueError::LayoutMismatch {
                value: value.to_string(),
                layout,
            }
            .into())
        }
    }
    Ok(buf)
}

/// Decode a little-endian payload according to its layout.
pub fn decode_value(layout: ValueLayout, data: &[u8]) -> ControlValue {
    match layout {
        ValueLayout::Raw => ControlValue::Raw(data.to_vec()),
        ValueLayout::SignedPair(w) | ValueLayout::UnsignedPair(w) => {
            let w = (w as usize).min(data.len() / 2);
            let signed = layout.is_signed();
            ControlValue::Pair(
                read_field(&data[..w], signed),
                read_field(&data[w..w * 2], signed),
            )
        }
        _ => ControlValue::Int(read_field(data, layout.is_signed())),
    }
}

fn write_field(buf: &mut [u8], value: i64, signed: bool) {
    let n = buf.len().min(8);
    if n == 0 {
        return;
    }
    if signed {
        LittleEndian::write_int(&mut buf[..n], value, n);
    } else {
        let mask = if n == 8 { u64::MAX } else { (1u64 << (n * 8)) - 1 };
        LittleEndian::write_uint(&mut buf[..n], value as u64 & mask, n);
    }
}

fn read_field(data: &[u8], signed: bool) -> i64 {
    let n = data.len().min(8);
    if n == 0 {
        return 0;
    }
    if signed {
        LittleEndian::read_int(&data[..n], n)
    } else {
        LittleEndian::read_uint(&data[..n], n) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{CameraControl, Control, ProcessingControl};

    fn exposure() -> ControlDescriptor {
        ControlDescriptor::new(Control::Camera(CameraControl::ExposureTimeAbsolute), 1)
    }

    #[test]
    fn test_get_cur_setup_packet() {
        let req = encode_get(&exposure(), Query::Cur, 0).unwrap();
        assert_eq!(req.request_type, 0xA1);
        assert_eq!(req.request, 0x81);
        assert_eq!(req.value, 0x0400);
        assert_eq!(req.index, 0x0100);
        assert_eq!(req.length, 4);
        assert!(req.is_read());
        assert!(req.data.is_empty());
    }

    #[test]
    fn test_set_cur_payload() {
        let req = encode_set(&exposure(), &ControlValue::Int(500), 0).unwrap();
        assert_eq!(req.request_type, 0x21);
        assert_eq!(req.request, SET_CUR);
        assert_eq!(req.length, 4);
        assert_eq!(req.data, vec![0xF4, 0x01, 0x00, 0x00]);
        assert!(!req.is_read());
    }

    #[test]
    fn test_index_carries_interface() {
        let brightness =
            ControlDescriptor::new(Control::Processing(ProcessingControl::Brightness), 2);
        let req = encode_get(&brightness, Query::Min, 3).unwrap();
        assert_eq!(req.index, 0x0203);
        assert_eq!(req.value, 0x0200);
    }

    #[test]
    fn test_signed_decode() {
        let brightness =
            ControlDescriptor::new(Control::Processing(ProcessingControl::Brightness), 2);
        let v = decode(&brightness, Query::Min, &[0xC0, 0xFF]).unwrap();
        assert_eq!(v, ControlValue::Int(-64));
    }

    #[test]
    fn test_pan_tilt_pair() {
        let pt = ControlDescriptor::new(Control::Camera(CameraControl::PanTiltAbsolute), 1);
        let req = encode_set(&pt, &ControlValue::Pair(-3600, 7200), 0).unwrap();
        assert_eq!(req.data.len(), 8);
        let back = decode(&pt, Query::Cur, &req.data).unwrap();
        assert_eq!(back, ControlValue::Pair(-3600, 7200));
    }

    #[test]
    fn test_length_mismatch() {
        let err = decode(&exposure(), Query::Cur, &[0x01, 0x02]).unwrap_err();
        assert_eq!(
            err,
            RequestError::LengthMismatch {
                expected: 4,
                actual: 2
            }
        );
        assert!(decode(&exposure(), Query::Info, &[0x03, 0x00]).is_err());
    }

    #[test]
    fn test_info_and_len() {
        let d = exposure();
        assert_eq!(encode_get(&d, Query::Info, 0).unwrap().length, 1);
        assert_eq!(encode_get(&d, Query::Len, 0).unwrap().length, 2);
        let caps = decode_info(&[0x03]).unwrap();
        assert_eq!(caps, ControlCaps::GET | ControlCaps::SET);
        assert_eq!(decode_len(&[0x10, 0x00]).unwrap(), 16);
    }

    #[test]
    fn test_extension_unit_needs_length() {
        let xu = ControlDescriptor::new(Control::Extension { unit: 4, selector: 2 }, 4);
        assert_eq!(
            encode_get(&xu, Query::Cur, 0).unwrap_err(),
            RequestError::UnknownLength
        );
        // GET_LEN works regardless.
        assert!(encode_get(&xu, Query::Len, 0).is_ok());

        let xu = xu.with_length(3);
        let req = encode_set(&xu, &ControlValue::Raw(vec![1, 2, 3]), 0).unwrap();
        assert_eq!(req.data, vec![1, 2, 3]);
        assert!(encode_set(&xu, &ControlValue::Raw(vec![1, 2]), 0).is_err());
    }

    #[test]
    fn test_read_only_control_rejects_set() {
        let lock = ControlDescriptor::new(Control::Processing(ProcessingControl::AnalogLockStatus), 2);
        assert_eq!(
            encode_set(&lock, &ControlValue::Int(0), 0).unwrap_err(),
            RequestError::Unsupported("SET")
        );
    }

    #[test]
    fn test_set_rejects_overflow() {
        let zoom = ControlDescriptor::new(Control::Camera(CameraControl::ZoomAbsolute), 1);
        assert!(matches!(
            encode_set(&zoom, &ControlValue::Int(70_000), 0),
            Err(RequestError::Value(ValueError::OutOfRange { .. }))
        ));
    }
}
