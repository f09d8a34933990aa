//! USB configuration descriptor parsing for UVC devices.
//!
//! Walks a raw configuration descriptor (as returned by
//! GET_DESCRIPTOR(CONFIGURATION)) and extracts the VideoControl topology,
//! the per-unit control bitmaps and the VideoStreaming formats. Every
//! length field is checked before it is trusted.

use crate::controls::{CameraControl, Control, ControlDescriptor, ProcessingControl};
use crate::format::{FormatDescriptor, FormatKind, FrameIntervals, PixelEncoding};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;

pub const CLASS_VIDEO: u8 = 0x0E;
pub const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
pub const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

const DT_CONFIGURATION: u8 = 0x02;
const DT_INTERFACE: u8 = 0x04;
const DT_ENDPOINT: u8 = 0x05;
const DT_CS_INTERFACE: u8 = 0x24;

// VideoControl interface descriptor subtypes
const VC_HEADER: u8 = 0x01;
const VC_INPUT_TERMINAL: u8 = 0x02;
const VC_OUTPUT_TERMINAL: u8 = 0x03;
const VC_SELECTOR_UNIT: u8 = 0x04;
const VC_PROCESSING_UNIT: u8 = 0x05;
const VC_EXTENSION_UNIT: u8 = 0x06;

// VideoStreaming interface descriptor subtypes
const VS_INPUT_HEADER: u8 = 0x01;
const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
const VS_FORMAT_MJPEG: u8 = 0x06;
const VS_FRAME_MJPEG: u8 = 0x07;
const VS_FORMAT_FRAME_BASED: u8 = 0x10;
const VS_FRAME_FRAME_BASED: u8 = 0x11;

/// wTerminalType of a camera sensor input terminal.
pub const ITT_CAMERA: u16 = 0x0201;

/// Widest extension unit bitmap whose bits all map to a u8 selector.
const MAX_XU_CONTROL_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor at offset {offset}: {reason}")]
    MalformedDescriptor { offset: usize, reason: String },
}

fn malformed(offset: usize, reason: impl Into<String>) -> DescriptorError {
    DescriptorError::MalformedDescriptor {
        offset,
        reason: reason.into(),
    }
}

/// Functional block in the VideoControl topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    CameraTerminal,
    InputTerminal { terminal_type: u16 },
    OutputTerminal { terminal_type: u16, source: u8 },
    SelectorUnit { sources: Vec<u8> },
    ProcessingUnit { source: u8, max_multiplier: u16 },
    ExtensionUnit { guid: Uuid, sources: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: u8,
    pub kind: UnitKind,
    /// `bControlSize` of the controls bitmap (0 for units without one).
    pub control_size: u8,
    pub controls: Vec<ControlDescriptor>,
}

/// One endpoint-bearing alternate setting of a streaming interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub alt: u8,
    pub endpoint: u8,
    pub isochronous: bool,
    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits.
    pub max_packet_size: u16,
}

impl AltSetting {
    /// Bytes per service interval (packet size × transactions per microframe).
    pub fn payload_capacity(&self) -> u32 {
        let base = (self.max_packet_size & 0x07FF) as u32;
        let mult = ((self.max_packet_size >> 11) & 0x03) as u32 + 1;
        base * mult
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingInterface {
    pub number: u8,
    pub endpoint: u8,
    pub terminal_link: u8,
    pub alt_settings: Vec<AltSetting>,
}

impl StreamingInterface {
    /// Bulk interfaces stream on alternate setting 0.
    pub fn is_bulk(&self) -> bool {
        self.alt_settings
            .iter()
            .any(|a| a.alt == 0 && !a.isochronous)
    }
}

/// Everything UvcKit needs from a configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDescriptors {
    pub configuration_value: u8,
    /// VideoControl interface number, if the device is a UVC device.
    pub control_interface: Option<u8>,
    /// bcdUVC from the VC header.
    pub uvc_version: u16,
    pub clock_frequency: u32,
    pub units: Vec<Unit>,
    pub streaming: Vec<StreamingInterface>,
    pub formats: Vec<FormatDescriptor>,
}

impl ParsedDescriptors {
    pub fn is_uvc(&self) -> bool {
        self.control_interface.is_some()
    }

    pub fn controls(&self) -> impl Iterator<Item = &ControlDescriptor> {
        self.units.iter().flat_map(|u| u.controls.iter())
    }

    pub fn find_control(&self, control: &Control) -> Option<&ControlDescriptor> {
        self.controls().find(|d| d.control == *control)
    }

    pub fn unit(&self, id: u8) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn streaming_interface(&self, number: u8) -> Option<&StreamingInterface> {
        self.streaming.iter().find(|s| s.number == number)
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Other,
    Control,
    Streaming(u8),
}

struct CurrentFormat {
    kind: FormatKind,
    index: u8,
    encoding: PixelEncoding,
    bits_per_pixel: u8,
}

/// Parse a raw configuration descriptor.
pub fn parse(bytes: &[u8]) -> Result<ParsedDescriptors, DescriptorError> {
    let mut parsed = ParsedDescriptors::default();
    let mut scope = Scope::Other;
    let mut current_alt = 0u8;
    let mut current_format: Option<CurrentFormat> = None;
    let mut end = bytes.len();
    let mut offset = 0usize;

    while offset < end {
        if end - offset < 2 {
            return Err(malformed(offset, "truncated descriptor header"));
        }
        let len = bytes[offset] as usize;
        let kind = bytes[offset + 1];
        if len < 2 {
            return Err(malformed(offset, format!("bLength {len} too small")));
        }
        if offset + len > end {
            return Err(malformed(
                offset,
                format!("descriptor of {len} bytes overruns buffer of {end}"),
            ));
        }
        let body = &bytes[offset..offset + len];

        match kind {
            DT_CONFIGURATION => {
                require(body, 9, offset, "configuration")?;
                let total = LittleEndian::read_u16(&body[2..4]) as usize;
                if total > bytes.len() {
                    return Err(malformed(
                        offset,
                        format!("wTotalLength {total} exceeds buffer of {}", bytes.len()),
                    ));
                }
                if total < 9 {
                    return Err(malformed(offset, format!("wTotalLength {total} too small")));
                }
                end = offset + total.min(bytes.len() - offset);
                parsed.configuration_value = body[5];
            }
            DT_INTERFACE => {
                require(body, 9, offset, "interface")?;
                let number = body[2];
                current_alt = body[3];
                if current_alt == 0 {
                    current_format = None;
                }
                scope = match (body[5], body[6]) {
                    (CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL) => {
                        parsed.control_interface.get_or_insert(number);
                        Scope::Control
                    }
                    (CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING) => {
                        if parsed.streaming_interface(number).is_none() {
                            parsed.streaming.push(StreamingInterface {
                                number,
                                endpoint: 0,
                                terminal_link: 0,
                                alt_settings: Vec::new(),
                            });
                        }
                        Scope::Streaming(number)
                    }
                    _ => Scope::Other,
                };
            }
            DT_ENDPOINT => {
                require(body, 7, offset, "endpoint")?;
                if let Scope::Streaming(number) = scope {
                    let alt = AltSetting {
                        alt: current_alt,
                        endpoint: body[2],
                        isochronous: body[3] & 0x03 == 0x01,
                        max_packet_size: LittleEndian::read_u16(&body[4..6]),
                    };
                    if let Some(s) = parsed.streaming.iter_mut().find(|s| s.number == number) {
                        s.alt_settings.push(alt);
                    }
                }
            }
            DT_CS_INTERFACE => {
                require(body, 3, offset, "class-specific interface")?;
                match scope {
                    Scope::Control => parse_vc(&mut parsed, body, offset)?,
                    Scope::Streaming(number) => {
                        parse_vs(&mut parsed, &mut current_format, number, body, offset)?
                    }
                    Scope::Other => {}
                }
            }
            _ => {}
        }

        offset += len;
    }

    tracing::debug!(
        control_interface = ?parsed.control_interface,
        units = parsed.units.len(),
        streaming = parsed.streaming.len(),
        formats = parsed.formats.len(),
        "parsed configuration descriptor"
    );

    Ok(parsed)
}

fn require(body: &[u8], min: usize, offset: usize, what: &str) -> Result<(), DescriptorError> {
    if body.len() < min {
        return Err(malformed(
            offset,
            format!("{what} descriptor needs {min} bytes, bLength is {}", body.len()),
        ));
    }
    Ok(())
}

fn parse_vc(
    parsed: &mut ParsedDescriptors,
    body: &[u8],
    offset: usize,
) -> Result<(), DescriptorError> {
    match body[2] {
        VC_HEADER => {
            require(body, 12, offset, "VC header")?;
            let in_collection = body[11] as usize;
            require(body, 12 + in_collection, offset, "VC header")?;
            parsed.uvc_version = LittleEndian::read_u16(&body[3..5]);
            parsed.clock_frequency = LittleEndian::read_u32(&body[7..11]);
        }
        VC_INPUT_TERMINAL => {
            require(body, 8, offset, "input terminal")?;
            let id = body[3];
            let terminal_type = LittleEndian::read_u16(&body[4..6]);
            if terminal_type == ITT_CAMERA {
                require(body, 15, offset, "camera terminal")?;
                let size = body[14];
                require(body, 15 + size as usize, offset, "camera terminal")?;
                let bitmap = &body[15..15 + size as usize];
                let controls = bits(bitmap)
                    .filter_map(|bit| {
                        let control = CameraControl::from_bit(bit);
                        if control.is_none() {
                            tracing::debug!(unit = id, bit, "skipping reserved camera control bit");
                        }
                        control
                    })
                    .map(|c| ControlDescriptor::new(Control::Camera(c), id))
                    .collect();
                parsed.units.push(Unit {
                    id,
                    kind: UnitKind::CameraTerminal,
                    control_size: size,
                    controls,
                });
            } else {
                parsed.units.push(Unit {
                    id,
                    kind: UnitKind::InputTerminal { terminal_type },
                    control_size: 0,
                    controls: Vec::new(),
                });
            }
        }
        VC_OUTPUT_TERMINAL => {
            require(body, 9, offset, "output terminal")?;
            parsed.units.push(Unit {
                id: body[3],
                kind: UnitKind::OutputTerminal {
                    terminal_type: LittleEndian::read_u16(&body[4..6]),
                    source: body[7],
                },
                control_size: 0,
                controls: Vec::new(),
            });
        }
        VC_SELECTOR_UNIT => {
            require(body, 5, offset, "selector unit")?;
            let pins = body[4] as usize;
            require(body, 6 + pins, offset, "selector unit")?;
            parsed.units.push(Unit {
                id: body[3],
                kind: UnitKind::SelectorUnit {
                    sources: body[5..5 + pins].to_vec(),
                },
                control_size: 0,
                controls: Vec::new(),
            });
        }
        VC_PROCESSING_UNIT => {
            require(body, 8, offset, "processing unit")?;
            let id = body[3];
            let size = body[7] as usize;
            require(body, 9 + size, offset, "processing unit")?;
            let controls = bits(&body[8..8 + size])
                .filter_map(ProcessingControl::from_bit)
                .map(|p| ControlDescriptor::new(Control::Processing(p), id))
                .collect();
            parsed.units.push(Unit {
                id,
                kind: UnitKind::ProcessingUnit {
                    source: body[4],
                    max_multiplier: LittleEndian::read_u16(&body[5..7]),
                },
                control_size: size as u8,
                controls,
            });
        }
        VC_EXTENSION_UNIT => {
            require(body, 22, offset, "extension unit")?;
            let id = body[3];
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&body[4..20]);
            let pins = body[21] as usize;
            require(body, 23 + pins, offset, "extension unit")?;
            let size = body[22 + pins] as usize;
            if size > MAX_XU_CONTROL_SIZE {
                return Err(malformed(
                    offset,
                    format!("extension unit {id} bControlSize {size} exceeds {MAX_XU_CONTROL_SIZE}"),
                ));
            }
            require(body, 24 + pins + size, offset, "extension unit")?;
            let bitmap = &body[23 + pins..23 + pins + size];
            // Extension unit selectors are numbered from 1 by bit position.
            let controls = bits(bitmap)
                .filter_map(|bit| {
                    let selector = bit.checked_add(1);
                    if selector.is_none() {
                        tracing::debug!(unit = id, bit, "skipping extension control without a selector");
                    }
                    selector
                })
                .map(|selector| ControlDescriptor::new(Control::Extension { unit: id, selector }, id))
                .collect();
            parsed.units.push(Unit {
                id,
                kind: UnitKind::ExtensionUnit {
                    guid: Uuid::from_bytes_le(guid),
                    sources: body[22..22 + pins].to_vec(),
                },
                control_size: size as u8,
                controls,
            });
        }
        other => {
            tracing::trace!(subtype = other, "skipping VC descriptor");
        }
    }
    Ok(())
}

fn parse_vs(
    parsed: &mut ParsedDescriptors,
    current: &mut Option<CurrentFormat>,
    interface: u8,
    body: &[u8],
    offset: usize,
) -> Result<(), DescriptorError> {
    match body[2] {
        VS_INPUT_HEADER => {
            require(body, 13, offset, "VS input header")?;
            let formats = body[3] as usize;
            let size = body[12] as usize;
            require(body, 13 + formats * size, offset, "VS input header")?;
            if let Some(s) = parsed.streaming.iter_mut().find(|s| s.number == interface) {
                s.endpoint = body[6];
                s.terminal_link = body[8];
            }
        }
        VS_FORMAT_UNCOMPRESSED | VS_FORMAT_FRAME_BASED => {
            let frame_based = body[2] == VS_FORMAT_FRAME_BASED;
            require(body, if frame_based { 28 } else { 27 }, offset, "VS format")?;
            *current = Some(CurrentFormat {
                kind: if frame_based {
                    FormatKind::FrameBased
                } else {
                    FormatKind::Uncompressed
                },
                index: body[3],
                encoding: PixelEncoding::from_guid(&body[5..21]),
                bits_per_pixel: body[21],
            });
        }
        VS_FORMAT_MJPEG => {
            require(body, 11, offset, "MJPEG format")?;
            *current = Some(CurrentFormat {
                kind: FormatKind::Mjpeg,
                index: body[3],
                encoding: PixelEncoding::Mjpeg,
                bits_per_pixel: 0,
            });
        }
        subtype @ (VS_FRAME_UNCOMPRESSED | VS_FRAME_MJPEG | VS_FRAME_FRAME_BASED) => {
            require(body, 26, offset, "VS frame")?;
            let format = current
                .as_ref()
                .ok_or_else(|| malformed(offset, "frame descriptor without a format"))?;
            let expected = match format.kind {
                FormatKind::Uncompressed => VS_FRAME_UNCOMPRESSED,
                FormatKind::Mjpeg => VS_FRAME_MJPEG,
                FormatKind::FrameBased => VS_FRAME_FRAME_BASED,
            };
            if subtype != expected {
                return Err(malformed(
                    offset,
                    format!("frame subtype {subtype:#04x} under format of kind {:?}", format.kind),
                ));
            }

            // Frame-based frames drop dwMaxVideoFrameBufferSize and append
            // dwBytesPerLine after bFrameIntervalType.
            let (default_interval, interval_type) = if subtype == VS_FRAME_FRAME_BASED {
                (LittleEndian::read_u32(&body[17..21]), body[21])
            } else {
                (LittleEndian::read_u32(&body[21..25]), body[25])
            };
            let intervals_at = 26;
            let intervals = if interval_type == 0 {
                require(body, intervals_at + 12, offset, "continuous frame intervals")?;
                let at = &body[intervals_at..];
                let min = LittleEndian::read_u32(&at[0..4]);
                let max = LittleEndian::read_u32(&at[4..8]);
                if min > max {
                    return Err(malformed(
                        offset,
                        format!("frame interval range {min}..{max} is inverted"),
                    ));
                }
                FrameIntervals::Continuous {
                    min,
                    max,
                    step: LittleEndian::read_u32(&at[8..12]),
                }
            } else {
                let n = interval_type as usize;
                require(body, intervals_at + n * 4, offset, "discrete frame intervals")?;
                FrameIntervals::Discrete(
                    body[intervals_at..intervals_at + n * 4]
                        .chunks_exact(4)
                        .map(LittleEndian::read_u32)
                        .collect(),
                )
            };

            parsed.formats.push(FormatDescriptor {
                interface,
                format_index: format.index,
                frame_index: body[3],
                kind: format.kind,
                encoding: format.encoding,
                bits_per_pixel: format.bits_per_pixel,
                width: LittleEndian::read_u16(&body[5..7]),
                height: LittleEndian::read_u16(&body[7..9]),
                default_interval,
                intervals,
            });
        }
        other => {
            tracing::trace!(subtype = other, "skipping VS descriptor");
        }
    }
    Ok(())
}

/// Indices of set bits in a little-endian bitmap.
fn bits(bitmap: &[u8]) -> impl Iterator<Item = u8> + '_ {
    bitmap.iter().enumerate().flat_map(|(byte, &value)| {
        (0..8usize)
            .filter(move |b| (value >> b) & 1 == 1)
            .filter_map(move |b| u8::try_from(byte * 8 + b).ok())
    })
}

fn bitmap(size: u8, set: impl Iterator<Item = u8>) -> Vec<u8> {
    let mut out = vec![0u8; size as usize];
    for bit in set {
        if let Some(byte) = out.get_mut(bit as usize / 8) {
            *byte |= 1 << (bit % 8);
        }
    }
    out
}

fn control_bit(control: &Control) -> Option<u8> {
    match control {
        Control::Camera(c) => Some(c.bit()),
        Control::Processing(p) => Some(p.bit()),
        Control::Extension { selector, .. } => selector.checked_sub(1),
        Control::Unknown { .. } => None,
    }
}

impl ParsedDescriptors {
    /// Serialize back into a configuration descriptor.
    ///
    /// Fields the model does not keep (string indices, bit rates, focal
    /// lengths) are written as zero, so `parse(d.to_bytes()) == d`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let interfaces = self.streaming.len() as u8 + u8::from(self.control_interface.is_some());
        out.extend_from_slice(&[9, DT_CONFIGURATION, 0, 0, interfaces, self.configuration_value, 0, 0x80, 250]);

        if let Some(vc) = self.control_interface {
            out.extend_from_slice(&[9, DT_INTERFACE, vc, 0, 0, CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL, 0, 0]);

            let mut units = Vec::new();
            for unit in &self.units {
                write_unit(&mut units, unit, self.uvc_version);
            }
            let header_len = 12 + self.streaming.len();
            let mut header = vec![header_len as u8, DT_CS_INTERFACE, VC_HEADER];
            push_u16(&mut header, self.uvc_version);
            push_u16(&mut header, (header_len + units.len()) as u16);
            push_u32(&mut header, self.clock_frequency);
            header.push(self.streaming.len() as u8);
            header.extend(self.streaming.iter().map(|s| s.number));
            out.extend(header);
            out.extend(units);
        }

        for stream in &self.streaming {
            out.extend_from_slice(&[9, DT_INTERFACE, stream.number, 0, 0, CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING, 0, 0]);
            let num_endpoints_at = out.len() - 5;

            let formats: Vec<&FormatDescriptor> = self
                .formats
                .iter()
                .filter(|f| f.interface == stream.number)
                .collect();
            let mut format_indices: Vec<u8> = formats.iter().map(|f| f.format_index).collect();
            format_indices.dedup();

            let mut body = Vec::new();
            for index in &format_indices {
                let frames: Vec<&&FormatDescriptor> =
                    formats.iter().filter(|f| f.format_index == *index).collect();
                write_format(&mut body, frames[0], frames.len() as u8);
                for frame in frames {
                    write_frame(&mut body, frame);
                }
            }

            let header_len = 13 + format_indices.len();
            out.extend_from_slice(&[header_len as u8, DT_CS_INTERFACE, VS_INPUT_HEADER, format_indices.len() as u8]);
            push_u16(&mut out, (header_len + body.len()) as u16);
            out.extend_from_slice(&[stream.endpoint, 0, stream.terminal_link, 0, 0, 0, 1]);
            out.extend(std::iter::repeat(0u8).take(format_indices.len()));
            out.extend(body);

            for alt in &stream.alt_settings {
                if alt.alt == 0 {
                    out[num_endpoints_at] += 1;
                } else {
                    out.extend_from_slice(&[9, DT_INTERFACE, stream.number, alt.alt, 1, CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING, 0, 0]);
                }
                let attributes = if alt.isochronous { 0x05 } else { 0x02 };
                out.extend_from_slice(&[7, DT_ENDPOINT, alt.endpoint, attributes]);
                push_u16(&mut out, alt.max_packet_size);
                out.push(1);
            }
        }

        let total = out.len() as u16;
        LittleEndian::write_u16(&mut out[2..4], total);
        out
    }
}

fn write_unit(out: &mut Vec<u8>, unit: &Unit, uvc_version: u16) {
    let controls = bitmap(
        unit.control_size,
        unit.controls.iter().filter_map(|d| control_bit(&d.control)),
    );
    match &unit.kind {
        UnitKind::CameraTerminal => {
            out.extend_from_slice(&[15 + unit.control_size, DT_CS_INTERFACE, VC_INPUT_TERMINAL, unit.id]);
            push_u16(out, ITT_CAMERA);
            // bAssocTerminal, iTerminal, focal lengths
            out.extend_from_slice(&[0; 8]);
            out.push(unit.control_size);
            out.extend(controls);
        }
        UnitKind::InputTerminal { terminal_type } => {
            out.extend_from_slice(&[8, DT_CS_INTERFACE, VC_INPUT_TERMINAL, unit.id]);
            push_u16(out, *terminal_type);
            out.extend_from_slice(&[0, 0]);
        }
        UnitKind::OutputTerminal {
            terminal_type,
            source,
        } => {
            out.extend_from_slice(&[9, DT_CS_INTERFACE, VC_OUTPUT_TERMINAL, unit.id]);
            push_u16(out, *terminal_type);
            out.extend_from_slice(&[0, *source, 0]);
        }
        UnitKind::SelectorUnit { sources } => {
            out.extend_from_slice(&[6 + sources.len() as u8, DT_CS_INTERFACE, VC_SELECTOR_UNIT, unit.id, sources.len() as u8]);
            out.extend_from_slice(sources);
            out.push(0);
        }
        UnitKind::ProcessingUnit {
            source,
            max_multiplier,
        } => {
            let standards = uvc_version >= 0x0110;
            let len = 9 + unit.control_size + u8::from(standards);
            out.extend_from_slice(&[len, DT_CS_INTERFACE, VC_PROCESSING_UNIT, unit.id, *source]);
            push_u16(out, *max_multiplier);
            out.push(unit.control_size);
            out.extend(controls);
            out.push(0);
            if standards {
                out.push(0);
            }
        }
        UnitKind::ExtensionUnit { guid, sources } => {
            let len = 24 + sources.len() as u8 + unit.control_size;
            out.extend_from_slice(&[len, DT_CS_INTERFACE, VC_EXTENSION_UNIT, unit.id]);
            out.extend_from_slice(&guid.to_bytes_le());
            out.push(unit.controls.len() as u8);
            out.push(sources.len() as u8);
            out.extend_from_slice(sources);
            out.push(unit.control_size);
            out.extend(controls);
            out.push(0);
        }
    }
}

fn write_format(out: &mut Vec<u8>, format: &FormatDescriptor, frames: u8) {
    match format.kind {
        FormatKind::Mjpeg => {
            out.extend_from_slice(&[11, DT_CS_INTERFACE, VS_FORMAT_MJPEG, format.format_index, frames, 0, 1, 0, 0, 0, 0]);
        }
        FormatKind::Uncompressed | FormatKind::FrameBased => {
            let frame_based = format.kind == FormatKind::FrameBased;
            let (len, subtype) = if frame_based {
                (28, VS_FORMAT_FRAME_BASED)
            } else {
                (27, VS_FORMAT_UNCOMPRESSED)
            };
            out.extend_from_slice(&[len, DT_CS_INTERFACE, subtype, format.format_index, frames]);
            out.extend_from_slice(&format.encoding.guid());
            out.extend_from_slice(&[format.bits_per_pixel, 1, 0, 0, 0, 0]);
            if frame_based {
                out.push(0);
            }
        }
    }
}

fn write_frame(out: &mut Vec<u8>, frame: &FormatDescriptor) {
    let (interval_type, tail) = match &frame.intervals {
        FrameIntervals::Discrete(list) => (list.len() as u8, list.clone()),
        FrameIntervals::Continuous { min, max, step } => (0, vec![*min, *max, *step]),
    };
    let subtype = match frame.kind {
        FormatKind::Uncompressed => VS_FRAME_UNCOMPRESSED,
        FormatKind::Mjpeg => VS_FRAME_MJPEG,
        FormatKind::FrameBased => VS_FRAME_FRAME_BASED,
    };
    let len = 26 + tail.len() * 4;

    out.extend_from_slice(&[len as u8, DT_CS_INTERFACE, subtype, frame.frame_index, 0]);
    push_u16(out, frame.width);
    push_u16(out, frame.height);
    push_u32(out, 0); // dwMinBitRate
    push_u32(out, 0); // dwMaxBitRate
    if frame.kind == FormatKind::FrameBased {
        push_u32(out, frame.default_interval);
        out.push(interval_type);
        push_u32(out, 0); // dwBytesPerLine
    } else {
        push_u32(out, 0); // dwMaxVideoFrameBufferSize
        push_u32(out, frame.default_interval);
        out.push(interval_type);
    }
    for interval in tail {
        push_u32(out, interval);
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}
