//! Stateless ISO-TP block framing.
//!
//! [encode] and [decode] translate between a complete diagnostic payload and a
//! flat concatenation of CAN frame data fields. They are used when the
//! underlying adapter performs no segmentation of its own and simply reports
//! the raw frames it saw, with nobody driving flow control in between.

use crate::{TransportError, TransportResult};

use super::{FrameType, MAXIMUM_PAYLOAD};

/// Payload bytes carried by a first frame after the 2 byte PCI
const FIRST_FRAME_PAYLOAD: usize = 6;
/// Payload bytes carried by a full consecutive frame
const CONSECUTIVE_FRAME_PAYLOAD: usize = 7;

/// Segments a complete payload into the flat byte concatenation of its frames.
///
/// Payloads shorter than 7 bytes become one unpadded single frame
/// `[len, payload...]`. Everything else becomes a first frame followed by
/// consecutive frames whose PCIs run `0x21..=0x2F, 0x20, 0x21, ...`; the final
/// frame is emitted short rather than padded.
pub fn encode(payload: &[u8]) -> TransportResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(TransportError::MessageTooSmall);
    }
    if payload.len() > MAXIMUM_PAYLOAD {
        return Err(TransportError::MessageTooBig);
    }
    if payload.len() < CONSECUTIVE_FRAME_PAYLOAD {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
        return Ok(out);
    }
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 7 + 2);
    out.push(FrameType::First as u8 | (payload.len() >> 8) as u8);
    out.push(payload.len() as u8);
    out.extend_from_slice(&payload[..FIRST_FRAME_PAYLOAD]);
    let mut sequence = 1u8;
    for chunk in payload[FIRST_FRAME_PAYLOAD..].chunks(CONSECUTIVE_FRAME_PAYLOAD) {
        out.push(FrameType::Consecutive as u8 | sequence);
        out.extend_from_slice(chunk);
        sequence = (sequence + 1) & 0x0F;
    }
    Ok(out)
}

/// Reassembles a payload from the flat byte concatenation of its frames.
///
/// Inputs shorter than 9 bytes are treated as one single frame; a leading
/// `0x30` there is a flow control echo from the adapter and passes through
/// unchanged. Longer inputs must start with a first frame and are checked for
/// consecutive frame PCI ordering and for the payload length announced in the
/// first frame.
pub fn decode(data: &[u8]) -> TransportResult<Vec<u8>> {
    if data.is_empty() {
        return Err(TransportError::DecoderError("no frame data".into()));
    }
    if data.len() < 9 {
        let pci = data[0];
        if pci == FrameType::FlowControl as u8 {
            // Adapter echoed the peer's flow control ACK
            return Ok(data.to_vec());
        }
        if pci == 0 || pci >= 8 {
            return Err(TransportError::DecoderError(format!(
                "invalid single frame PCI 0x{pci:02X}"
            )));
        }
        let len = pci as usize;
        if data.len() <= len {
            return Err(TransportError::DecoderError(format!(
                "single frame announces {} bytes, {} present",
                len,
                data.len() - 1
            )));
        }
        return Ok(data[1..=len].to_vec());
    }

    if FrameType::from_pci(data[0]) != Some(FrameType::First) {
        return Err(TransportError::DecoderError(format!(
            "expected first frame, got PCI 0x{:02X}",
            data[0]
        )));
    }
    let announced = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
    if announced <= FIRST_FRAME_PAYLOAD {
        return Err(TransportError::DecoderError(format!(
            "first frame announces only {announced} bytes"
        )));
    }
    let mut payload = Vec::with_capacity(announced);
    payload.extend_from_slice(&data[2..2 + FIRST_FRAME_PAYLOAD]);
    let mut remaining = announced - FIRST_FRAME_PAYLOAD;
    let mut expected_pci = FrameType::Consecutive as u8 | 1;
    let mut offset = 2 + FIRST_FRAME_PAYLOAD;
    while remaining > 0 {
        let pci = *data.get(offset).ok_or_else(|| {
            TransportError::DecoderError(format!("input ended with {remaining} bytes outstanding"))
        })?;
        if pci != expected_pci {
            return Err(TransportError::DecoderError(format!(
                "expected consecutive frame PCI 0x{expected_pci:02X}, got 0x{pci:02X}"
            )));
        }
        expected_pci = if expected_pci == 0x2F {
            0x20
        } else {
            expected_pci + 1
        };
        let take = remaining.min(CONSECUTIVE_FRAME_PAYLOAD);
        if data.len() - offset - 1 < take {
            return Err(TransportError::DecoderError(format!(
                "consecutive frame truncated, wanted {take} bytes"
            )));
        }
        payload.extend_from_slice(&data[offset + 1..offset + 1 + take]);
        remaining -= take;
        offset += 1 + take;
    }
    debug_assert_eq!(payload.len(), announced);
    Ok(payload)
}
