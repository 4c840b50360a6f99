//! ISO15765-2 (ISO-TP) frame primitives, stateless framing and the
//! bidirectional transceiver state machine
//!
//! The types in this module deal exclusively with the 8 byte CAN data field.
//! Addressing (which CAN ID a frame travels under) is the adapter driver's
//! concern.

use strum_macros::FromRepr;

use crate::{TransportError, TransportResult};

pub mod framer;
pub mod transceiver;

/// Data length of a classic CAN frame
pub const FRAME_LENGTH: usize = 8;

/// Largest payload a 3 nibble ISO-TP length field can announce
pub const MAXIMUM_PAYLOAD: usize = 4095;

/// Worst case frame count for one payload: 1 first frame carrying 6 bytes
/// plus 585 consecutive frames, the last carrying a single byte
pub const MAXIMUM_FRAME_COUNT: usize = 586;

/// Conventional fill byte for unused trailing frame bytes. Ignored on receive
pub const PADDING_BYTE: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// ISO-TP frame type, the high nibble of the PCI byte
pub enum FrameType {
    /// Single frame, payload of 1..=7 bytes
    Single = 0x00,
    /// First frame of a segmented payload
    First = 0x10,
    /// Consecutive frame with a 4 bit rolling sequence number
    Consecutive = 0x20,
    /// Flow control frame steering the sender
    FlowControl = 0x30,
}

impl FrameType {
    /// Extracts the frame type from a raw PCI byte
    pub fn from_pci(pci: u8) -> Option<Self> {
        Self::from_repr(pci & 0xF0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Flow status carried in the first byte of a flow control frame
pub enum FlowControlStatus {
    /// Sender may continue transmitting consecutive frames
    ClearToSend = 0x30,
    /// Sender shall pause and await a further flow control frame
    Wait = 0x31,
    /// Receiver cannot take the announced payload
    Overflow = 0x32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A flow control frame as defined by ISO15765-2 §9.6.
///
/// Wire form is exactly `[status, block_size, separation_time]`.
pub struct FlowControlFrame {
    /// Flow status
    pub status: FlowControlStatus,
    /// Number of consecutive frames allowed before the next flow control
    /// exchange. Zero means "send everything"
    pub block_size: u8,
    /// Minimum separation time between consecutive frames, in the ISO
    /// encoding (0x00..=0x7F milliseconds)
    pub separation_time: u8,
}

impl Default for FlowControlFrame {
    fn default() -> Self {
        Self {
            status: FlowControlStatus::ClearToSend,
            block_size: 0x20,
            separation_time: 0,
        }
    }
}

impl FlowControlFrame {
    /// Creates a clear-to-send frame with the given timing parameters
    pub fn new(block_size: u8, separation_time: u8) -> Self {
        Self {
            status: FlowControlStatus::ClearToSend,
            block_size,
            separation_time,
        }
    }

    /// Parses a flow control frame from raw frame data.
    ///
    /// Requires at least 3 bytes and a known status byte. Trailing padding is
    /// ignored.
    pub fn parse(data: &[u8]) -> TransportResult<Self> {
        if data.len() < 3 {
            return Err(TransportError::ProtocolViolation(format!(
                "flow control frame too short ({} bytes)",
                data.len()
            )));
        }
        let status = FlowControlStatus::from_repr(data[0]).ok_or_else(|| {
            TransportError::ProtocolViolation(format!(
                "unknown flow control status 0x{:02X}",
                data[0]
            ))
        })?;
        Ok(Self {
            status,
            block_size: data[1],
            separation_time: data[2],
        })
    }

    /// Serializes to the 3 byte wire form
    pub fn to_bytes(self) -> Vec<u8> {
        vec![self.status as u8, self.block_size, self.separation_time]
    }
}
