//! Streaming formats, frame-interval sets and format negotiation.

use crate::request::RequestError;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;

/// VideoStreaming interface control selectors.
pub const VS_PROBE_CONTROL: u8 = 0x01;
pub const VS_COMMIT_CONTROL: u8 = 0x02;

/// Frame intervals are expressed in 100 ns units.
pub const INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

/// Convert a frame rate to a frame interval (100 ns units).
pub fn fps_to_interval(fps: u32) -> u32 {
    INTERVAL_UNITS_PER_SEC / fps.max(1)
}

/// Convert a frame interval (100 ns units) to frames per second.
pub fn interval_to_fps(interval: u32) -> f64 {
    if interval == 0 {
        return 0.0;
    }
    INTERVAL_UNITS_PER_SEC as f64 / interval as f64
}

/// Four-character code taken from the first bytes of a format GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "{:02x}{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2], self.0[3])
        }
    }
}

/// GUID suffix shared by all UVC format GUIDs (`XXXXXXXX-0000-0010-8000-00AA00389B71`).
const GUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Pixel encoding of a streaming format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// NV12 4:2:0 semi-planar.
    Nv12,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    Mjpeg,
    H264,
    Other(FourCc),
}

impl PixelEncoding {
    pub fn from_fourcc(code: FourCc) -> Self {
        match &code.0 {
            b"YUY2" | b"YUYV" => PixelEncoding::Yuyv,
            b"NV12" => PixelEncoding::Nv12,
            b"Y800" | b"GREY" => PixelEncoding::Grey,
            b"Y16 " => PixelEncoding::Y16,
            b"MJPG" => PixelEncoding::Mjpeg,
            b"H264" => PixelEncoding::H264,
            _ => PixelEncoding::Other(code),
        }
    }

    pub fn fourcc(&self) -> FourCc {
        match self {
            PixelEncoding::Yuyv => FourCc::new(b"YUY2"),
            PixelEncoding::Nv12 => FourCc::new(b"NV12"),
            PixelEncoding::Grey => FourCc::new(b"Y800"),
            PixelEncoding::Y16 => FourCc::new(b"Y16 "),
            PixelEncoding::Mjpeg => FourCc::new(b"MJPG"),
            PixelEncoding::H264 => FourCc::new(b"H264"),
            PixelEncoding::Other(code) => *code,
        }
    }

    /// Decode from a 16-byte format GUID as it appears on the wire.
    pub fn from_guid(guid: &[u8]) -> Self {
        let mut code = [0u8; 4];
        code.copy_from_slice(&guid[..4]);
        Self::from_fourcc(FourCc(code))
    }

    /// Wire GUID for uncompressed and frame-based format descriptors.
    pub fn guid(&self) -> [u8; 16] {
        let mut guid = [0u8; 16];
        guid[..4].copy_from_slice(&self.fourcc().0);
        guid[4..].copy_from_slice(&GUID_SUFFIX);
        guid
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelEncoding::Yuyv => f.write_str("YUYV"),
            PixelEncoding::Nv12 => f.write_str("NV12"),
            PixelEncoding::Grey => f.write_str("GREY"),
            PixelEncoding::Y16 => f.write_str("Y16"),
            PixelEncoding::Mjpeg => f.write_str("MJPEG"),
            PixelEncoding::H264 => f.write_str("H264"),
            PixelEncoding::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Which VS format descriptor family a format came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Uncompressed,
    Mjpeg,
    FrameBased,
}

/// Supported frame intervals of one frame descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32, step: u32 },
}

impl FrameIntervals {
    pub fn contains(&self, interval: u32) -> bool {
        match self {
            FrameIntervals::Discrete(list) => list.contains(&interval),
            FrameIntervals::Continuous { min, max, step } => {
                interval >= *min
                    && interval <= *max
                    && (*step == 0 || (interval - min) % step == 0)
            }
        }
    }

    /// Shortest interval (highest frame rate).
    pub fn lowest(&self) -> Option<u32> {
        match self {
            FrameIntervals::Discrete(list) => list.iter().copied().min(),
            FrameIntervals::Continuous { min, max, .. } if min > max => None,
            FrameIntervals::Continuous { min, .. } => Some(*min),
        }
    }

    /// Supported interval nearest to `target`; the shorter one wins a tie.
    pub fn closest(&self, target: u32) -> Option<u32> {
        match self {
            FrameIntervals::Discrete(list) => list
                .iter()
                .copied()
                .min_by_key(|i| (i.abs_diff(target), *i)),
            FrameIntervals::Continuous { min, max, .. } if min > max => None,
            FrameIntervals::Continuous { min, max, step } => {
                let clamped = target.clamp(*min, *max);
                if *step == 0 {
                    return Some(clamped);
                }
                let below = min + (clamped - min) / step * step;
                let above = below.saturating_add(*step);
                if above <= *max && above - clamped < clamped - below {
                    Some(above)
                } else {
                    Some(below)
                }
            }
        }
    }
}

/// One supported (format, frame) combination on a streaming interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    /// VideoStreaming interface number.
    pub interface: u8,
    pub format_index: u8,
    pub frame_index: u8,
    pub kind: FormatKind,
    pub encoding: PixelEncoding,
    /// Bits per pixel; 0 for MJPEG.
    pub bits_per_pixel: u8,
    pub width: u16,
    pub height: u16,
    pub default_interval: u32,
    pub intervals: FrameIntervals,
}

impl FormatDescriptor {
    pub fn area(&self) -> u32 {
        self.width as u32 * self.height as u32
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (format {}, frame {})",
            self.encoding, self.width, self.height, self.format_index, self.frame_index
        )
    }
}

/// What the caller would like to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u16,
    pub height: u16,
    /// Desired frame interval (100 ns units).
    pub interval: Option<u32>,
    pub encoding: Option<PixelEncoding>,
}

impl FormatRequest {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            interval: None,
            encoding: None,
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.interval = Some(fps_to_interval(fps));
        self
    }

    pub fn with_encoding(mut self, encoding: PixelEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }
}

/// The selected format and frame interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub format: FormatDescriptor,
    pub interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("no compatible format at or above {min_width}x{min_height}")]
    NoCompatibleFormat { min_width: u16, min_height: u16 },
}

/// Strategy for picking a streaming format from the enumerated set.
pub trait Negotiator {
    fn select(
        &self,
        formats: &[FormatDescriptor],
        request: &FormatRequest,
    ) -> Result<Negotiated, NegotiationError>;
}

/// Closest-resolution negotiation with a minimum resolution floor.
///
/// Exact resolution wins; otherwise the smallest resolution covering the
/// request; otherwise the largest available. Within one resolution, the
/// format with the lowest supported interval (highest frame rate) wins.
/// Its interval is the requested one if supported, else the closest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosestFormat {
    pub min_width: u16,
    pub min_height: u16,
}

impl Default for ClosestFormat {
    fn default() -> Self {
        Self {
            min_width: 160,
            min_height: 120,
        }
    }
}

impl Negotiator for ClosestFormat {
    fn select(
        &self,
        formats: &[FormatDescriptor],
        request: &FormatRequest,
    ) -> Result<Negotiated, NegotiationError> {
        let no_match = NegotiationError::NoCompatibleFormat {
            min_width: self.min_width,
            min_height: self.min_height,
        };

        let candidates: Vec<&FormatDescriptor> = formats
            .iter()
            .filter(|f| f.width >= self.min_width && f.height >= self.min_height)
            .filter(|f| request.encoding.map_or(true, |e| f.encoding == e))
            .collect();
        if candidates.is_empty() {
            return Err(no_match);
        }

        let exact = candidates
            .iter()
            .any(|f| f.width == request.width && f.height == request.height);
        let covering = candidates
            .iter()
            .filter(|f| f.width >= request.width && f.height >= request.height)
            .min_by_key(|f| (f.area(), f.width));

        let (width, height) = if exact {
            (request.width, request.height)
        } else if let Some(f) = covering {
            (f.width, f.height)
        } else {
            candidates
                .iter()
                .max_by_key(|f| (f.area(), f.width))
                .map(|f| (f.width, f.height))
                .ok_or(no_match.clone())?
        };

        candidates
            .into_iter()
            .filter(|f| f.width == width && f.height == height)
            .filter_map(|f| Some((f.intervals.lowest()?, f)))
            .min_by_key(|(lowest, _)| *lowest)
            .and_then(|(_, f)| Some((f, pick_interval(&f.intervals, request.interval)?)))
            .map(|(f, interval)| {
                tracing::debug!(
                    format = %f,
                    interval,
                    fps = interval_to_fps(interval),
                    "negotiated format"
                );
                Negotiated {
                    format: f.clone(),
                    interval,
                }
            })
            .ok_or(no_match)
    }
}

fn pick_interval(intervals: &FrameIntervals, wanted: Option<u32>) -> Option<u32> {
    match wanted {
        Some(i) if intervals.contains(i) => Some(i),
        Some(i) => intervals.closest(i),
        None => intervals.lowest(),
    }
}

/// Probe/commit payload (UVC 1.5 §4.3.1.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    /// UVC 1.1+ fields.
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    /// UVC 1.5 fields.
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_ref_frames_plus_one: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

/// bmHint bit: keep dwFrameInterval fixed while negotiating.
pub const HINT_FRAME_INTERVAL: u16 = 0x0001;

impl StreamingControl {
    const BASE_LEN: usize = 26;

    /// Payload length for a given `bcdUVC`.
    pub fn wire_len(uvc_version: u16) -> usize {
        if uvc_version >= 0x0150 {
            48
        } else if uvc_version >= 0x0110 {
            34
        } else {
            Self::BASE_LEN
        }
    }

    /// Probe request for a negotiated format.
    pub fn for_format(negotiated: &Negotiated) -> Self {
        Self {
            hint: HINT_FRAME_INTERVAL,
            format_index: negotiated.format.format_index,
            frame_index: negotiated.format.frame_index,
            frame_interval: negotiated.interval,
            ..Self::default()
        }
    }

    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len.max(Self::BASE_LEN)];
        LittleEndian::write_u16(&mut buf[0..2], self.hint);
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        LittleEndian::write_u32(&mut buf[4..8], self.frame_interval);
        LittleEndian::write_u16(&mut buf[8..10], self.key_frame_rate);
        LittleEndian::write_u16(&mut buf[10..12], self.p_frame_rate);
        LittleEndian::write_u16(&mut buf[12..14], self.comp_quality);
        LittleEndian::write_u16(&mut buf[14..16], self.comp_window_size);
        LittleEndian::write_u16(&mut buf[16..18], self.delay);
        LittleEndian::write_u32(&mut buf[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut buf[22..26], self.max_payload_transfer_size);
        if buf.len() >= 34 {
            LittleEndian::write_u32(&mut buf[26..30], self.clock_frequency);
            buf[30] = self.framing_info;
            buf[31] = self.preferred_version;
            buf[32] = self.min_version;
            buf[33] = self.max_version;
        }
        if buf.len() >= 48 {
            buf[34] = self.usage;
            buf[35] = self.bit_depth_luma;
            buf[36] = self.settings;
            buf[37] = self.max_ref_frames_plus_one;
            LittleEndian::write_u16(&mut buf[38..40], self.rate_control_modes);
            LittleEndian::write_u64(&mut buf[40..48], self.layout_per_stream);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        if data.len() < Self::BASE_LEN {
            return Err(RequestError::LengthMismatch {
                expected: Self::BASE_LEN,
                actual: data.len(),
            });
        }
        let mut ctrl = Self {
            hint: LittleEndian::read_u16(&data[0..2]),
            format_index: data[2],
            frame_index: data[3],
            frame_interval: LittleEndian::read_u32(&data[4..8]),
            key_frame_rate: LittleEndian::read_u16(&data[8..10]),
            p_frame_rate: LittleEndian::read_u16(&data[10..12]),
            comp_quality: LittleEndian::read_u16(&data[12..14]),
            comp_window_size: LittleEndian::read_u16(&data[14..16]),
            delay: LittleEndian::read_u16(&data[16..18]),
            max_video_frame_size: LittleEndian::read_u32(&data[18..22]),
            max_payload_transfer_size: LittleEndian::read_u32(&data[22..26]),
            ..Self::default()
        };
        if data.len() >= 34 {
            ctrl.clock_frequency = LittleEndian::read_u32(&data[26..30]);
            ctrl.framing_info = data[30];
            ctrl.preferred_version = data[31];
            ctrl.min_version = data[32];
            ctrl.max_version = data[33];
        }
        if data.len() >= 48 {
            ctrl.usage = data[34];
            ctrl.bit_depth_luma = data[35];
            ctrl.settings = data[36];
            ctrl.max_ref_frames_plus_one = data[37];
            ctrl.rate_control_modes = LittleEndian::read_u16(&data[38..40]);
            ctrl.layout_per_stream = LittleEndian::read_u64(&data[40..48]);
        }
        Ok(ctrl)
    }
}
