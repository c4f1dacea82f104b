//! Field bus access - frame model, DGN classification, decoding and capture
//!
//! Frames arrive either from a local capture process (candump-style lines)
//! or relayed through the hub from a device with physical bus access. Both
//! paths produce the same [`Frame`], which the [`Decoder`] turns into a
//! [`DecodedEvent`] or silently discards.

pub mod capture;
mod decoder;
mod dgn;
mod frame;

pub use capture::{CaptureProcess, FrameSource, StdinSource};
pub use decoder::{light_brightness_percent, tank_level_percent, DecodedEvent, Decoder};
pub use dgn::{Dgn, DGN_DC_DIMMER_STATUS_3, DGN_TANK_STATUS};
pub use frame::{Frame, RawFrameData};
