//! UVC control identities, payload layouts and capability flags.
//!
//! Known selectors are fixed enums per entity type (camera terminal,
//! processing unit). Extension units and anything we do not model are
//! carried as raw selector IDs and treated as opaque payloads.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

bitflags! {
    /// Capabilities reported by GET_INFO (UVC 1.5 §4.1.2, Table 4-3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlCaps: u8 {
        const GET = 0x01;
        const SET = 0x02;
        /// Disabled because an automatic mode currently owns the control.
        const DISABLED = 0x04;
        /// The device may change the value on its own (AUTO).
        const AUTO_UPDATE = 0x08;
        const ASYNCHRONOUS = 0x10;
    }
}

/// Wire layout of a control payload. Widths are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueLayout {
    Signed(u8),
    Unsigned(u8),
    /// One-hot mode selector; GET_RES returns the mask of supported modes.
    Bitmap(u8),
    Boolean,
    /// Two packed signed fields, each of the given width.
    SignedPair(u8),
    /// Two packed unsigned fields, each of the given width.
    UnsignedPair(u8),
    /// Opaque bytes, passed through untouched.
    Raw,
}

impl ValueLayout {
    /// Payload length implied by the layout, if fixed.
    pub fn len(&self) -> Option<u16> {
        match *self {
            ValueLayout::Signed(w) | ValueLayout::Unsigned(w) | ValueLayout::Bitmap(w) => {
                Some(w as u16)
            }
            ValueLayout::Boolean => Some(1),
            ValueLayout::SignedPair(w) | ValueLayout::UnsignedPair(w) => Some(w as u16 * 2),
            ValueLayout::Raw => None,
        }
    }

    /// Whether the device reports bounds (GET_MIN/MAX/RES/DEF, or RES/DEF
    /// for bitmaps) that a SET must respect.
    pub fn has_range(&self) -> bool {
        !matches!(self, ValueLayout::Boolean | ValueLayout::Raw)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ValueLayout::Signed(_) | ValueLayout::SignedPair(_))
    }
}

/// Camera terminal controls (UVC 1.5 §4.2.2.1).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum CameraControl {
    ScanningMode,
    AutoExposureMode,
    AutoExposurePriority,
    ExposureTimeAbsolute,
    ExposureTimeRelative,
    FocusAbsolute,
    FocusRelative,
    FocusAuto,
    IrisAbsolute,
    IrisRelative,
    ZoomAbsolute,
    ZoomRelative,
    PanTiltAbsolute,
    PanTiltRelative,
    RollAbsolute,
    RollRelative,
    Privacy,
    FocusSimple,
    Window,
    RegionOfInterest,
}

impl CameraControl {
    /// Control selector (wValue high byte).
    pub fn selector(&self) -> u8 {
        match self {
            CameraControl::ScanningMode => 0x01,
            CameraControl::AutoExposureMode => 0x02,
            CameraControl::AutoExposurePriority => 0x03,
            CameraControl::ExposureTimeAbsolute => 0x04,
            CameraControl::ExposureTimeRelative => 0x05,
            CameraControl::FocusAbsolute => 0x06,
            CameraControl::FocusRelative => 0x07,
            CameraControl::FocusAuto => 0x08,
            CameraControl::IrisAbsolute => 0x09,
            CameraControl::IrisRelative => 0x0A,
            CameraControl::ZoomAbsolute => 0x0B,
            CameraControl::ZoomRelative => 0x0C,
            CameraControl::PanTiltAbsolute => 0x0D,
            CameraControl::PanTiltRelative => 0x0E,
            CameraControl::RollAbsolute => 0x0F,
            CameraControl::RollRelative => 0x10,
            CameraControl::Privacy => 0x11,
            CameraControl::FocusSimple => 0x12,
            CameraControl::Window => 0x13,
            CameraControl::RegionOfInterest => 0x14,
        }
    }

    /// Bit position in the camera terminal `bmControls` bitmap.
    pub fn bit(&self) -> u8 {
        match self {
            CameraControl::ScanningMode => 0,
            CameraControl::AutoExposureMode => 1,
            CameraControl::AutoExposurePriority => 2,
            CameraControl::ExposureTimeAbsolute => 3,
            CameraControl::ExposureTimeRelative => 4,
            CameraControl::FocusAbsolute => 5,
            CameraControl::FocusRelative => 6,
            CameraControl::IrisAbsolute => 7,
            CameraControl::IrisRelative => 8,
            CameraControl::ZoomAbsolute => 9,
            CameraControl::ZoomRelative => 10,
            CameraControl::PanTiltAbsolute => 11,
            CameraControl::PanTiltRelative => 12,
            CameraControl::RollAbsolute => 13,
            CameraControl::RollRelative => 14,
            // D15, D16 reserved
            CameraControl::FocusAuto => 17,
            CameraControl::Privacy => 18,
            CameraControl::FocusSimple => 19,
            CameraControl::Window => 20,
            CameraControl::RegionOfInterest => 21,
        }
    }

    pub fn layout(&self) -> ValueLayout {
        match self {
            CameraControl::ScanningMode
            | CameraControl::AutoExposurePriority
            | CameraControl::FocusAuto
            | CameraControl::Privacy => ValueLayout::Boolean,
            CameraControl::AutoExposureMode => ValueLayout::Bitmap(1),
            CameraControl::ExposureTimeAbsolute => ValueLayout::Unsigned(4),
            CameraControl::ExposureTimeRelative | CameraControl::IrisRelative => {
                ValueLayout::Signed(1)
            }
            CameraControl::FocusAbsolute
            | CameraControl::IrisAbsolute
            | CameraControl::ZoomAbsolute => ValueLayout::Unsigned(2),
            CameraControl::FocusSimple => ValueLayout::Unsigned(1),
            CameraControl::RollAbsolute => ValueLayout::Signed(2),
            CameraControl::PanTiltAbsolute => ValueLayout::SignedPair(4),
            CameraControl::FocusRelative
            | CameraControl::ZoomRelative
            | CameraControl::PanTiltRelative
            | CameraControl::RollRelative
            | CameraControl::Window
            | CameraControl::RegionOfInterest => ValueLayout::Raw,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u16 {
        match self {
            CameraControl::FocusRelative | CameraControl::RollRelative => 2,
            CameraControl::ZoomRelative => 3,
            CameraControl::PanTiltRelative => 4,
            CameraControl::Window => 12,
            CameraControl::RegionOfInterest => 10,
            other => other.layout().len().unwrap_or(0),
        }
    }

    pub fn default_caps(&self) -> ControlCaps {
        match self {
            CameraControl::ExposureTimeAbsolute
            | CameraControl::FocusAbsolute
            | CameraControl::IrisAbsolute => {
                ControlCaps::GET | ControlCaps::SET | ControlCaps::AUTO_UPDATE
            }
            _ => ControlCaps::GET | ControlCaps::SET,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        Self::iter().find(|c| c.bit() == bit)
    }

    pub fn from_selector(selector: u8) -> Option<Self> {
        Self::iter().find(|c| c.selector() == selector)
    }
}

/// Processing unit controls (UVC 1.5 §4.2.2.3).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ProcessingControl {
    BacklightCompensation,
    Brightness,
    Contrast,
    ContrastAuto,
    Gain,
    PowerLineFrequency,
    Hue,
    HueAuto,
    Saturation,
    Sharpness,
    Gamma,
    WhiteBalanceTemperature,
    WhiteBalanceTemperatureAuto,
    WhiteBalanceComponent,
    WhiteBalanceComponentAuto,
    DigitalMultiplier,
    DigitalMultiplierLimit,
    AnalogVideoStandard,
    AnalogLockStatus,
}

impl ProcessingControl {
    pub fn selector(&self) -> u8 {
        match self {
            ProcessingControl::BacklightCompensation => 0x01,
            ProcessingControl::Brightness => 0x02,
            ProcessingControl::Contrast => 0x03,
            ProcessingControl::Gain => 0x04,
            ProcessingControl::PowerLineFrequency => 0x05,
            ProcessingControl::Hue => 0x06,
            ProcessingControl::Saturation => 0x07,
            ProcessingControl::Sharpness => 0x08,
            ProcessingControl::Gamma => 0x09,
            ProcessingControl::WhiteBalanceTemperature => 0x0A,
            ProcessingControl::WhiteBalanceTemperatureAuto => 0x0B,
            ProcessingControl::WhiteBalanceComponent => 0x0C,
            ProcessingControl::WhiteBalanceComponentAuto => 0x0D,
            ProcessingControl::DigitalMultiplier => 0x0E,
            ProcessingControl::DigitalMultiplierLimit => 0x0F,
            ProcessingControl::HueAuto => 0x10,
            ProcessingControl::AnalogVideoStandard => 0x11,
            ProcessingControl::AnalogLockStatus => 0x12,
            ProcessingControl::ContrastAuto => 0x13,
        }
    }

    /// Bit position in the processing unit `bmControls` bitmap.
    pub fn bit(&self) -> u8 {
        match self {
            ProcessingControl::Brightness => 0,
            ProcessingControl::Contrast => 1,
            ProcessingControl::Hue => 2,
            ProcessingControl::Saturation => 3,
            ProcessingControl::Sharpness => 4,
            ProcessingControl::Gamma => 5,
            ProcessingControl::WhiteBalanceTemperature => 6,
            ProcessingControl::WhiteBalanceComponent => 7,
            ProcessingControl::BacklightCompensation => 8,
            ProcessingControl::Gain => 9,
            ProcessingControl::PowerLineFrequency => 10,
            ProcessingControl::HueAuto => 11,
            ProcessingControl::WhiteBalanceTemperatureAuto => 12,
            ProcessingControl::WhiteBalanceComponentAuto => 13,
            ProcessingControl::DigitalMultiplier => 14,
            ProcessingControl::DigitalMultiplierLimit => 15,
            ProcessingControl::AnalogVideoStandard => 16,
            ProcessingControl::AnalogLockStatus => 17,
            ProcessingControl::ContrastAuto => 18,
        }
    }

    pub fn layout(&self) -> ValueLayout {
        match self {
            ProcessingControl::Brightness | ProcessingControl::Hue => ValueLayout::Signed(2),
            ProcessingControl::ContrastAuto
            | ProcessingControl::HueAuto
            | ProcessingControl::WhiteBalanceTemperatureAuto
            | ProcessingControl::WhiteBalanceComponentAuto => ValueLayout::Boolean,
            ProcessingControl::PowerLineFrequency
            | ProcessingControl::AnalogVideoStandard
            | ProcessingControl::AnalogLockStatus => ValueLayout::Unsigned(1),
            ProcessingControl::WhiteBalanceComponent => ValueLayout::UnsignedPair(2),
            _ => ValueLayout::Unsigned(2),
        }
    }

    pub fn len(&self) -> u16 {
        self.layout().len().unwrap_or(0)
    }

    pub fn default_caps(&self) -> ControlCaps {
        match self {
            ProcessingControl::AnalogVideoStandard | ProcessingControl::AnalogLockStatus => {
                ControlCaps::GET
            }
            ProcessingControl::Contrast
            | ProcessingControl::Hue
            | ProcessingControl::WhiteBalanceTemperature
            | ProcessingControl::WhiteBalanceComponent => {
                ControlCaps::GET | ControlCaps::SET | ControlCaps::AUTO_UPDATE
            }
            _ => ControlCaps::GET | ControlCaps::SET,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        Self::iter().find(|c| c.bit() == bit)
    }

    pub fn from_selector(selector: u8) -> Option<Self> {
        Self::iter().find(|c| c.selector() == selector)
    }
}

/// A control on the device, known or opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Camera(CameraControl),
    Processing(ProcessingControl),
    /// Vendor extension unit control; payload is passed through untouched.
    Extension { unit: u8, selector: u8 },
    /// Raw selector on a standard unit that we have no typed model for.
    Unknown { unit: u8, selector: u8 },
}

impl Control {
    pub fn selector(&self) -> u8 {
        match self {
            Control::Camera(c) => c.selector(),
            Control::Processing(p) => p.selector(),
            Control::Extension { selector, .. } | Control::Unknown { selector, .. } => *selector,
        }
    }

    pub fn layout(&self) -> ValueLayout {
        match self {
            Control::Camera(c) => c.layout(),
            Control::Processing(p) => p.layout(),
            _ => ValueLayout::Raw,
        }
    }

    /// Fixed payload length, or `None` when it must be learned with GET_LEN.
    pub fn len(&self) -> Option<u16> {
        match self {
            Control::Camera(c) => Some(c.len()),
            Control::Processing(p) => Some(p.len()),
            _ => None,
        }
    }

    pub fn default_caps(&self) -> ControlCaps {
        match self {
            Control::Camera(c) => c.default_caps(),
            Control::Processing(p) => p.default_caps(),
            _ => ControlCaps::GET | ControlCaps::SET,
        }
    }

    /// Every typed control, camera terminal first.
    pub fn known() -> impl Iterator<Item = Control> {
        CameraControl::iter()
            .map(Control::Camera)
            .chain(ProcessingControl::iter().map(Control::Processing))
    }
}

impl From<CameraControl> for Control {
    fn from(c: CameraControl) -> Self {
        Control::Camera(c)
    }
}

impl From<ProcessingControl> for Control {
    fn from(p: ProcessingControl) -> Self {
        Control::Processing(p)
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Camera(c) => {
                let name: &'static str = c.into();
                f.write_str(name)
            }
            Control::Processing(p) => {
                let name: &'static str = p.into();
                f.write_str(name)
            }
            Control::Extension { unit, selector } => write!(f, "xu:{unit}:{selector}"),
            Control::Unknown { unit, selector } => write!(f, "raw:{unit}:{selector}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown control name: {0}")]
pub struct ParseControlError(String);

impl FromStr for Control {
    type Err = ParseControlError;

    /// Accepts kebab-case names (`exposure-time-absolute`) or
    /// `xu:<unit>:<selector>` / `raw:<unit>:<selector>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(c) = CameraControl::from_str(s) {
            return Ok(Control::Camera(c));
        }
        if let Ok(p) = ProcessingControl::from_str(s) {
            return Ok(Control::Processing(p));
        }

        let err = || ParseControlError(s.to_string());
        let mut parts = s.split(':');
        let prefix = parts.next().ok_or_else(err)?;
        let unit: u8 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(err)?;
        let selector: u8 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }
        match prefix {
            "xu" => Ok(Control::Extension { unit, selector }),
            "raw" => Ok(Control::Unknown { unit, selector }),
            _ => Err(err()),
        }
    }
}

/// A control as advertised by a unit's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    pub control: Control,
    /// Unit or terminal ID owning the control (wIndex high byte).
    pub unit_id: u8,
    /// Payload length; `None` until learned with GET_LEN.
    pub length: Option<u16>,
    pub layout: ValueLayout,
    pub caps: ControlCaps,
}

impl ControlDescriptor {
    /// Descriptor for a control with its default layout and capabilities.
    pub fn new(control: Control, unit_id: u8) -> Self {
        Self {
            control,
            unit_id,
            length: control.len(),
            layout: control.layout(),
            caps: control.default_caps(),
        }
    }

    /// Copy with a length learned from the device.
    pub fn with_length(&self, length: u16) -> Self {
        Self {
            length: Some(length),
            ..self.clone()
        }
    }

    /// Copy with capabilities reported by GET_INFO.
    pub fn with_caps(&self, caps: ControlCaps) -> Self {
        Self {
            caps,
            ..self.clone()
        }
    }
}

/// Auto-exposure modes (one-hot values of `auto-exposure-mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum AutoExposureMode {
    Manual,
    Auto,
    ShutterPriority,
    AperturePriority,
}

impl AutoExposureMode {
    pub fn bits(&self) -> u8 {
        match self {
            AutoExposureMode::Manual => 0x01,
            AutoExposureMode::Auto => 0x02,
            AutoExposureMode::ShutterPriority => 0x04,
            AutoExposureMode::AperturePriority => 0x08,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::iter().find(|m| m.bits() == bits)
    }
}

/// Anti-flicker setting (`power-line-frequency`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum PowerLineFrequency {
    Disabled,
    #[strum(serialize = "50hz")]
    Hz50,
    #[strum(serialize = "60hz")]
    Hz60,
    Auto,
}

impl PowerLineFrequency {
    pub fn value(&self) -> u8 {
        match self {
            PowerLineFrequency::Disabled => 0,
            PowerLineFrequency::Hz50 => 1,
            PowerLineFrequency::Hz60 => 2,
            PowerLineFrequency::Auto => 3,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        Self::iter().find(|m| m.value() == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for c in CameraControl::iter() {
            assert!(seen.insert(c.bit()), "duplicate camera bit for {c:?}");
        }
        seen.clear();
        for p in ProcessingControl::iter() {
            assert!(seen.insert(p.bit()), "duplicate processing bit for {p:?}");
        }
    }

    #[test]
    fn test_selectors_round_trip() {
        for c in CameraControl::iter() {
            assert_eq!(CameraControl::from_selector(c.selector()), Some(c));
        }
        for p in ProcessingControl::iter() {
            assert_eq!(ProcessingControl::from_selector(p.selector()), Some(p));
        }
    }

    #[test]
    fn test_reserved_camera_bits() {
        assert_eq!(CameraControl::from_bit(15), None);
        assert_eq!(CameraControl::from_bit(16), None);
        assert_eq!(CameraControl::from_bit(17), Some(CameraControl::FocusAuto));
    }

    #[test]
    fn test_control_names() {
        let c: Control = "exposure-time-absolute".parse().unwrap();
        assert_eq!(c, Control::Camera(CameraControl::ExposureTimeAbsolute));
        assert_eq!(c.to_string(), "exposure-time-absolute");

        let p: Control = "white-balance-temperature-auto".parse().unwrap();
        assert_eq!(
            p,
            Control::Processing(ProcessingControl::WhiteBalanceTemperatureAuto)
        );

        let xu: Control = "xu:4:2".parse().unwrap();
        assert_eq!(xu, Control::Extension { unit: 4, selector: 2 });
        assert_eq!(xu.to_string(), "xu:4:2");

        assert!("xu:4".parse::<Control>().is_err());
        assert!("frobnicate".parse::<Control>().is_err());
    }

    #[test]
    fn test_lengths() {
        assert_eq!(Control::Camera(CameraControl::PanTiltAbsolute).len(), Some(8));
        assert_eq!(Control::Camera(CameraControl::ZoomRelative).len(), Some(3));
        assert_eq!(
            Control::Processing(ProcessingControl::WhiteBalanceComponent).len(),
            Some(4)
        );
        assert_eq!(Control::Extension { unit: 3, selector: 1 }.len(), None);
    }

    #[test]
    fn test_analog_status_is_read_only() {
        let caps = ProcessingControl::AnalogLockStatus.default_caps();
        assert!(caps.contains(ControlCaps::GET));
        assert!(!caps.contains(ControlCaps::SET));
    }
}
