//! Control presets.
//!
//! A preset is a TOML file mapping control names to values, optionally
//! restricted to one camera model by USB VID:PID. Presets for known
//! cameras are embedded at compile time from `contrib/presets/*.toml`.

use crate::session::{DeviceSession, SessionError};
use crate::transport::UsbTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use uvckit_core::value::parse_hex;
use uvckit_core::{Control, ControlCaps, ControlValue};

const PRESET_046D_085E: &str = include_str!("../../../contrib/presets/046d-085e-indoor.toml");

static BUILTIN: OnceLock<Vec<Preset>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to access preset file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid preset: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize preset: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown control {0:?}")]
    UnknownControl(String),
    #[error("bad value for {control}: {reason}")]
    BadValue { control: String, reason: String },
    #[error("preset targets {expected}, device is {actual}")]
    DeviceMismatch {
        expected: PresetDevice,
        actual: PresetDevice,
    },
    #[error("failed to set {control}: {source}")]
    Control {
        control: String,
        #[source]
        source: SessionError,
    },
}

/// Camera identification from the `[device]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetDevice {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl std::fmt::Display for PresetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// A control value as written in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PresetValue {
    Int(i64),
    Pair([i64; 2]),
    /// Hex-encoded payload for extension unit controls.
    Bytes(String),
}

impl PresetValue {
    fn to_control_value(&self, control: &str) -> Result<ControlValue, PresetError> {
        match self {
            PresetValue::Int(v) => Ok(ControlValue::Int(*v)),
            PresetValue::Pair([a, b]) => Ok(ControlValue::Pair(*a, *b)),
            PresetValue::Bytes(hex) => parse_hex(hex)
                .map(ControlValue::Raw)
                .ok_or_else(|| PresetError::BadValue {
                    control: control.to_string(),
                    reason: format!("{hex:?} is not a hex string"),
                }),
        }
    }
}

impl From<&ControlValue> for PresetValue {
    fn from(value: &ControlValue) -> Self {
        match value {
            ControlValue::Int(v) => PresetValue::Int(*v),
            ControlValue::Pair(a, b) => PresetValue::Pair([*a, *b]),
            ControlValue::Raw(_) => PresetValue::Bytes(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<PresetDevice>,
    #[serde(default)]
    pub controls: BTreeMap<String, PresetValue>,
}

impl Preset {
    pub fn from_toml(src: &str) -> Result<Self, PresetError> {
        Ok(toml::from_str(src)?)
    }

    pub fn to_toml(&self) -> Result<String, PresetError> {
        Ok(toml::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, PresetError> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml(&src)
    }

    pub fn save(&self, path: &Path) -> Result<(), PresetError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Whether the preset may be applied to a device with these IDs.
    pub fn applies_to(&self, vendor_id: u16, product_id: u16) -> bool {
        self.device
            .map_or(true, |d| d.vendor_id == vendor_id && d.product_id == product_id)
    }

    /// Controls in application order: automatic-mode switches first, so
    /// the manual values that follow are not rejected by an active auto mode.
    pub fn ordered(&self) -> Vec<(&str, &PresetValue)> {
        let mut entries: Vec<(&str, &PresetValue)> = self
            .controls
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        entries.sort_by_key(|(name, _)| !name.contains("auto"));
        entries
    }

    /// Set every control in the preset. Stops at the first failure.
    pub fn apply<T: UsbTransport>(&self, session: &DeviceSession<'_, T>) -> Result<usize, PresetError> {
        if let Some(expected) = self.device {
            let actual = PresetDevice {
                vendor_id: session.vendor_id(),
                product_id: session.product_id(),
            };
            if expected != actual {
                return Err(PresetError::DeviceMismatch { expected, actual });
            }
        }

        let mut applied = 0;
        for (name, value) in self.ordered() {
            let control: Control = name
                .parse()
                .map_err(|_| PresetError::UnknownControl(name.to_string()))?;
            let value = value.to_control_value(name)?;
            session
                .set(control, &value)
                .map_err(|source| PresetError::Control {
                    control: name.to_string(),
                    source,
                })?;
            applied += 1;
        }
        tracing::info!(device = %session.id(), controls = applied, "applied preset");
        Ok(applied)
    }

    /// Snapshot every settable control the device exposes.
    ///
    /// Controls that fail to read are skipped with a warning.
    pub fn capture<T: UsbTransport>(session: &DeviceSession<'_, T>) -> Self {
        let mut controls = BTreeMap::new();
        for desc in session.controls() {
            if !desc.caps.contains(ControlCaps::SET) {
                continue;
            }
            match session.get(desc.control) {
                Ok(value) => {
                    controls.insert(desc.control.to_string(), PresetValue::from(&value));
                }
                Err(e) => {
                    tracing::warn!(control = %desc.control, error = %e, "skipping control");
                }
            }
        }
        Self {
            device: Some(PresetDevice {
                vendor_id: session.vendor_id(),
                product_id: session.product_id(),
            }),
            controls,
        }
    }
}

fn builtin_presets() -> &'static Vec<Preset> {
    BUILTIN.get_or_init(|| {
        let mut presets = Vec::new();
        for src in [PRESET_046D_085E] {
            match Preset::from_toml(src) {
                Ok(p) => presets.push(p),
                Err(e) => tracing::warn!(error = %e, "bad embedded preset"),
            }
        }
        presets
    })
}

/// Embedded preset for a camera model, if one ships with UvcKit.
pub fn lookup_builtin(vendor_id: u16, product_id: u16) -> Option<&'static Preset> {
    builtin_presets()
        .iter()
        .find(|p| p.device.is_some() && p.applies_to(vendor_id, product_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockTransport};
    use crate::registry::DeviceRegistry;
    use uvckit_core::{CameraControl, ProcessingControl};

    fn open(registry: &DeviceRegistry<MockTransport>) -> DeviceSession<'_, MockTransport> {
        let candidate = registry.devices().unwrap().remove(0);
        registry.open(&candidate).unwrap()
    }

    #[test]
    fn test_builtin_preset_parses() {
        let preset = lookup_builtin(mock::VENDOR_ID, mock::PRODUCT_ID).unwrap();
        assert_eq!(
            preset.controls.get("exposure-time-absolute"),
            Some(&PresetValue::Int(300))
        );
        assert_eq!(
            preset.controls.get("pan-tilt-absolute"),
            Some(&PresetValue::Pair([0, -3600]))
        );
        assert!(lookup_builtin(0x1234, 0x5678).is_none());
    }

    #[test]
    fn test_auto_modes_apply_first() {
        let preset = lookup_builtin(mock::VENDOR_ID, mock::PRODUCT_ID).unwrap();
        let order: Vec<&str> = preset.ordered().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order[0], "auto-exposure-mode");
        assert_eq!(order[1], "white-balance-temperature-auto");
    }

    #[test]
    fn test_apply_builtin() {
        let registry = DeviceRegistry::init(mock::webcam_transport());
        let session = open(&registry);
        let preset = lookup_builtin(session.vendor_id(), session.product_id()).unwrap();
        assert_eq!(preset.apply(&session).unwrap(), 7);
        assert_eq!(session.exposure_time_absolute().unwrap(), 300);
        assert_eq!(session.white_balance_temperature().unwrap(), 4000);
        assert_eq!(session.pan_tilt_absolute().unwrap(), (0, -3600));
    }

    #[test]
    fn test_device_mismatch() {
        let registry = DeviceRegistry::init(mock::webcam_transport());
        let session = open(&registry);
        let preset = Preset::from_toml(
            "[device]\nvendor_id = 0x1234\nproduct_id = 0x0001\n[controls]\nbrightness = 1\n",
        )
        .unwrap();
        assert!(matches!(
            preset.apply(&session),
            Err(PresetError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_value_reported() {
        let registry = DeviceRegistry::init(mock::webcam_transport());
        let session = open(&registry);
        let preset = Preset::from_toml("[controls]\nexposure-time-absolute = 510\n").unwrap();
        match preset.apply(&session) {
            Err(PresetError::Control { control, source }) => {
                assert_eq!(control, "exposure-time-absolute");
                assert!(source.is_out_of_range());
            }
            other => panic!("expected control error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_control() {
        let registry = DeviceRegistry::init(mock::webcam_transport());
        let session = open(&registry);
        let preset = Preset::from_toml("[controls]\nwarp-drive = 9\n").unwrap();
        assert!(matches!(
            preset.apply(&session),
            Err(PresetError::UnknownControl(name)) if name == "warp-drive"
        ));
    }

    #[test]
    fn test_capture_then_apply() {
        let registry = DeviceRegistry::init(mock::webcam_transport());
        let session = open(&registry);
        session.set_brightness(-20).unwrap();
        session.set_exposure_time_absolute(450).unwrap();

        let captured = Preset::capture(&session);
        assert_eq!(
            captured.device,
            Some(PresetDevice {
                vendor_id: mock::VENDOR_ID,
                product_id: mock::PRODUCT_ID
            })
        );
        assert_eq!(
            captured
                .controls
                .get(&Control::from(ProcessingControl::Brightness).to_string()),
            Some(&PresetValue::Int(-20))
        );
        assert_eq!(
            captured
                .controls
                .get(&Control::from(CameraControl::ExposureTimeAbsolute).to_string()),
            Some(&PresetValue::Int(450))
        );

        let text = captured.to_toml().unwrap();
        assert_eq!(Preset::from_toml(&text).unwrap(), captured);
    }

    #[test]
    fn test_raw_values_as_hex() {
        let value = PresetValue::from(&ControlValue::Raw(vec![0x00, 0xa5]));
        assert_eq!(value, PresetValue::Bytes("00a5".to_string()));
        assert_eq!(
            value.to_control_value("xu:4:1").unwrap(),
            ControlValue::Raw(vec![0x00, 0xa5])
        );
        assert!(PresetValue::Bytes("nope".to_string())
            .to_control_value("xu:4:1")
            .is_err());
    }
}
