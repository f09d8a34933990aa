//! uvckit-core — UVC descriptor parsing, control codec and format negotiation.
//!
//! Pure data handling with no USB access: parse a configuration
//! descriptor into units, controls and streaming formats, build and decode
//! class-specific control requests, and pick a streaming format.

pub mod controls;
pub mod descriptor;
pub mod format;
pub mod request;
pub mod value;

pub use controls::{
    AutoExposureMode, CameraControl, Control, ControlCaps, ControlDescriptor, PowerLineFrequency,
    ProcessingControl, ValueLayout,
};
pub use descriptor::{parse, DescriptorError, ParsedDescriptors, StreamingInterface, Unit, UnitKind};
pub use format::{
    ClosestFormat, FormatDescriptor, FormatRequest, FrameIntervals, Negotiated, NegotiationError,
    Negotiator, PixelEncoding, StreamingControl,
};
pub use request::{ControlRequest, Query, RequestError};
pub use value::{ControlRange, ControlValue, ValueError};
