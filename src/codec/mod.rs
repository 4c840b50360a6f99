//! Per bus-protocol payload codecs.
//!
//! The adapter driver installs one [PayloadEncoder] and one [PayloadDecoder]
//! per negotiated bus protocol. Encoders run over outbound UDS payloads before
//! they are handed to the string command provider; decoders run over the
//! concatenated payload bytes of the ECU messages the adapter reported.

use crate::isotp::{FRAME_LENGTH, MAXIMUM_PAYLOAD, framer};
use crate::{TransportError, TransportResult};

/// Encodes a complete UDS payload into the byte form the adapter transmits
pub trait PayloadEncoder: Send + std::fmt::Debug {
    /// Encodes `payload` for transmission
    fn encode(&self, payload: &[u8]) -> TransportResult<Vec<u8>>;
    /// Largest payload this encoder (and the adapter behind it) can carry in
    /// one UDS message
    fn maximum_frame_length(&self) -> usize;
}

/// Decodes the concatenated reply bytes the adapter reported into one UDS payload
pub trait PayloadDecoder: Send + std::fmt::Debug {
    /// Decodes raw reply bytes
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>>;
}

/// Pass-through encoder advertising a maximum payload bound.
///
/// Used whenever the adapter itself (or nobody) segments: plain CAN with or
/// without auto-formatting, on-chip segmentation on STN parts, and the legacy
/// single-frame bus protocols.
#[derive(Debug, Clone, Copy)]
pub struct NullEncoder {
    max: usize,
}

impl NullEncoder {
    /// Creates a pass-through encoder bounded at `maximum_frame_length` bytes
    pub fn new(maximum_frame_length: usize) -> Self {
        Self {
            max: maximum_frame_length,
        }
    }
}

impl PayloadEncoder for NullEncoder {
    fn encode(&self, payload: &[u8]) -> TransportResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(TransportError::MessageTooSmall);
        }
        if payload.len() > self.max {
            return Err(TransportError::MessageTooBig);
        }
        Ok(payload.to_vec())
    }

    fn maximum_frame_length(&self) -> usize {
        self.max
    }
}

/// Identity decoder for adapters which reassemble replies on chip
#[derive(Debug, Clone, Copy)]
pub struct NullDecoder;

impl PayloadDecoder for NullDecoder {
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Stateless ISO-TP segmenting encoder, see [framer::encode]
#[derive(Debug, Clone, Copy)]
pub struct IsoTpEncoder;

impl PayloadEncoder for IsoTpEncoder {
    fn encode(&self, payload: &[u8]) -> TransportResult<Vec<u8>> {
        framer::encode(payload)
    }

    fn maximum_frame_length(&self) -> usize {
        MAXIMUM_PAYLOAD
    }
}

/// Stateless ISO-TP reassembling decoder, see [framer::decode]
#[derive(Debug, Clone, Copy)]
pub struct IsoTpDecoder;

impl PayloadDecoder for IsoTpDecoder {
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        framer::decode(data)
    }
}

/// SAE J1850 reply decoder. The adapter strips headers and checksums already,
/// the payload arrives verbatim
#[derive(Debug, Clone, Copy)]
pub struct J1850Decoder;

impl PayloadDecoder for J1850Decoder {
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        if data.is_empty() {
            return Err(TransportError::DecoderError("empty J1850 reply".into()));
        }
        Ok(data.to_vec())
    }
}

/// KWP2000 (ISO14230) reply decoder, identity for ELM class adapters
#[derive(Debug, Clone, Copy)]
pub struct Kwp2000Decoder;

impl PayloadDecoder for Kwp2000Decoder {
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        if data.is_empty() {
            return Err(TransportError::DecoderError("empty KWP2000 reply".into()));
        }
        Ok(data.to_vec())
    }
}

/// ISO9141-2 reply decoder.
///
/// Replies arrive as 8 byte chunks: bytes 0..=1 carry the response header
/// (only meaningful on the first chunk), byte 2 is a 1-indexed chunk sequence
/// number, bytes 3..7 carry 4 payload bytes, byte 7 is the line checksum.
#[derive(Debug, Clone, Copy)]
pub struct Iso9141Decoder;

impl PayloadDecoder for Iso9141Decoder {
    fn decode(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        if data.is_empty() || data.len() % FRAME_LENGTH != 0 {
            return Err(TransportError::DecoderError(format!(
                "ISO9141 reply length {} is not a multiple of {FRAME_LENGTH}",
                data.len()
            )));
        }
        let mut payload = Vec::with_capacity(2 + data.len() / 2);
        for (index, chunk) in data.chunks(FRAME_LENGTH).enumerate() {
            let sequence = (index + 1) as u8;
            if chunk[2] != sequence {
                return Err(TransportError::DecoderError(format!(
                    "ISO9141 chunk sequence 0x{:02X} (want 0x{sequence:02X})",
                    chunk[2]
                )));
            }
            if index == 0 {
                payload.extend_from_slice(&chunk[0..=1]);
            }
            payload.extend_from_slice(&chunk[3..7]);
        }
        Ok(payload)
    }
}
