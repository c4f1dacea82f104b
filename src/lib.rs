//! Coachlink - RV-C bus decoding and multi-device state synchronization
//!
//! A device with bus access decodes frames into lights, tanks, water devices
//! and climate readings, keeps them in a local store and shares accepted
//! changes with every other panel through a WebSocket hub.

pub mod bus;
pub mod config;
pub mod hub;
pub mod paths;
pub mod router;
pub mod sniffer;
pub mod state;
pub mod sync;
