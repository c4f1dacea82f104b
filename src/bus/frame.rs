//! Bus frame model and capture-line parsing

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::dgn::Dgn;

/// Largest payload a classic CAN frame can carry
pub const MAX_FRAME_BYTES: usize = 8;

/// Largest 29-bit extended arbitration id
pub const MAX_ARBITRATION_ID: u32 = 0x1FFF_FFFF;

/// One bus packet as observed on an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Capture interface (e.g. "can0")
    pub interface: String,
    /// 29-bit extended arbitration id
    pub arbitration_id: u32,
    /// Payload bytes (at most 8)
    pub data: Vec<u8>,
    /// Capture timestamp (milliseconds since epoch)
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(interface: impl Into<String>, arbitration_id: u32, data: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            interface: interface.into(),
            arbitration_id,
            data,
            timestamp_ms,
        }
    }

    /// Parse a candump-style capture line
    ///
    /// Accepted shapes:
    /// ```text
    ///   can0  19FEDA9F   [8]  1A FF C8 FC FF 05 04 00
    ///   (1718000000.123456)  can0  19FEDA9F   [8]  1A FF C8 FC FF 05 04 00
    ///   can0 19FFB7A1 00 01 02 04
    /// ```
    /// A leading `(seconds)` token overrides `fallback_ts_ms`. Returns `None`
    /// for anything that does not parse cleanly.
    pub fn parse_capture_line(line: &str, fallback_ts_ms: u64) -> Option<Self> {
        let mut tokens = line.split_whitespace().peekable();

        let mut timestamp_ms = fallback_ts_ms;
        if let Some(first) = tokens.peek() {
            if let Some(inner) = first.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
                let secs: f64 = inner.parse().ok()?;
                timestamp_ms = (secs * 1000.0) as u64;
                tokens.next();
            }
        }

        let interface = tokens.next()?;
        let id_token = tokens.next()?;
        let arbitration_id = parse_arbitration_id(id_token)?;

        let mut declared_len: Option<usize> = None;
        let mut data = Vec::with_capacity(MAX_FRAME_BYTES);

        for token in tokens {
            if let Some(count) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                if declared_len.is_some() || !data.is_empty() {
                    return None;
                }
                declared_len = Some(count.parse().ok()?);
                continue;
            }

            if token.len() != 2 {
                trace!(line, token, "Rejecting capture line with malformed byte");
                return None;
            }
            let byte = hex::decode(token).ok()?;
            data.extend_from_slice(&byte);

            if data.len() > MAX_FRAME_BYTES {
                return None;
            }
        }

        if let Some(expected) = declared_len {
            if expected != data.len() {
                trace!(line, expected, actual = data.len(), "Byte count mismatch");
                return None;
            }
        }

        Some(Self::new(interface, arbitration_id, data, timestamp_ms))
    }

    /// Arbitration id rendered as 8 uppercase hex digits
    pub fn id_hex(&self) -> String {
        format!("{:08X}", self.arbitration_id)
    }

    /// Data group number of this frame
    pub fn dgn(&self) -> Dgn {
        Dgn::from_arbitration_id(self.arbitration_id)
    }

    /// Source address (lowest 8 bits of the id)
    pub fn source_address(&self) -> u8 {
        (self.arbitration_id & 0xFF) as u8
    }
}

/// Parse a hex arbitration id, with or without a `0x` prefix
fn parse_arbitration_id(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    let id = u32::from_str_radix(digits, 16).ok()?;
    (id <= MAX_ARBITRATION_ID).then_some(id)
}

/// Wire form of a frame inside a `rawFrameRelay` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrameData {
    /// Arbitration id as hex
    pub id: String,
    pub data: Vec<u8>,
    pub interface: String,
    /// Capture timestamp (milliseconds since epoch)
    pub timestamp: u64,
}

impl From<&Frame> for RawFrameData {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id_hex(),
            data: frame.data.clone(),
            interface: frame.interface.clone(),
            timestamp: frame.timestamp_ms,
        }
    }
}

impl RawFrameData {
    /// Convert back into a frame, rejecting ids or payloads a bus cannot carry
    pub fn to_frame(&self) -> Option<Frame> {
        if self.data.len() > MAX_FRAME_BYTES {
            return None;
        }
        let arbitration_id = parse_arbitration_id(&self.id)?;
        Some(Frame::new(
            self.interface.clone(),
            arbitration_id,
            self.data.clone(),
            self.timestamp,
        ))
    }
}
