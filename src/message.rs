//! Diagnostic message and header types shared by every layer of the transport

/// A bus header (arbitration ID).
///
/// Values below 0x800 are standard 11 bit CAN IDs, larger values are 29 bit
/// extended IDs. Zero means "unset/any".
pub type Header = u32;

/// Boundary between 11 bit and 29 bit header values
pub const EXTENDED_HEADER_THRESHOLD: Header = 0x800;

/// Renders a header the way ELM327 class adapters expect it on the wire:
/// 3 upper case hex chars for 11 bit IDs, 8 for 29 bit IDs
pub fn format_header(header: Header) -> String {
    if header < EXTENDED_HEADER_THRESHOLD {
        format!("{header:03X}")
    } else {
        format!("{header:08X}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single diagnostic message travelling through the transport.
///
/// Direction decides interpretation: outbound, `id` is the destination and
/// `reply` the header the answer is expected from. Inbound, `id` is the source
/// and `reply` may carry the correlator of the request it answers.
pub struct Message {
    /// Destination (outbound) or source (inbound) header
    pub id: Header,
    /// Expected replier (outbound) or correlator (inbound). Zero accepts any
    pub reply: Header,
    /// Raw service bytes. Non empty for any real request or response
    pub data: Vec<u8>,
}

impl Message {
    /// Creates a message with no reply expectation
    pub fn new(id: Header, data: Vec<u8>) -> Self {
        Self { id, reply: 0, data }
    }

    /// Creates a message expecting a reply from `reply`
    pub fn with_reply(id: Header, reply: Header, data: Vec<u8>) -> Self {
        Self { id, reply, data }
    }

    /// Derives a sibling carrying different payload bytes
    pub fn with_data(&self, data: Vec<u8>) -> Self {
        Self {
            id: self.id,
            reply: self.reply,
            data,
        }
    }

    /// Service identifier of the request (first payload byte)
    pub fn sid(&self) -> Option<u8> {
        self.data.first().copied()
    }
}
