//! The ELM327 / STN command set: maps abstract adapter operations onto their
//! ASCII wire strings and parses the adapter's replies into typed responses.
//!
//! This module is pure, all I/O lives in [crate::stream] and the driver.

use crate::bus_protocol::BusProtocol;
use crate::message::{Header, Message, format_header};
use crate::{TransportError, TransportResult};

const HEX: [u8; 16] = *b"0123456789ABCDEF";

/// An abstract adapter operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Full reset (`ATZ`)
    Reset,
    /// Command echo on/off (`ATE`)
    Echo(bool),
    /// Linefeed emission on/off (`ATL`)
    Linefeeds(bool),
    /// Reply header emission on/off (`ATH`)
    Headers(bool),
    /// Space separation in replies on/off (`ATS`)
    Spaces(bool),
    /// Adaptive timing on/off (`ATAT`)
    AdaptiveTiming(bool),
    /// Outgoing header (`ATSH`)
    SetHeader(Header),
    /// Outgoing header from its textual form, used for the 3 byte broadcast
    /// headers of the legacy protocols (`ATSH`)
    SetHeaderRaw(String),
    /// Receive arbitration filter (`ATCRA`)
    CanReceiveArbitration(Header),
    /// Select protocol (`ATSP`)
    SetProtocol(BusProtocol),
    /// Try protocol with fallback (`ATTP`)
    TryProtocol(BusProtocol),
    /// Describe the active protocol numerically (`ATDPN`)
    DescribeProtocol,
    /// CAN auto formatting on/off (`ATCAF`)
    CanAutoFormat(bool),
    /// Response timeout in units of 4ms (`ATST`)
    SetTimeout(u8),
    /// Battery voltage at pin 16 (`ATRV`)
    ReadVoltage,
    /// OBD2 mode 1 PID 0 probe, forces bus connection
    ConnectProbe,
    /// Raw data transmission, hex encoded, with an optional expected reply
    /// count nibble
    Data {
        /// Bytes to put on the bus
        payload: Vec<u8>,
        /// Number of replies to wait for before returning early
        expected_responses: Option<u8>,
    },
    /// STN transmit announcement for payloads beyond the ELM line limit
    /// (`STPX`); the adapter answers `DATA` and expects the payload next
    StnTransmitAnnounce {
        /// Destination header
        header: Header,
        /// Number of replies to wait for
        replies: u8,
        /// Announced payload length in bytes
        length: usize,
    },
    /// STN on-chip transmit segmentation on/off (`STCSEGT`)
    StnTxSegmentation(bool),
    /// STN on-chip receive segmentation on/off (`STCSEGR`)
    StnRxSegmentation(bool),
    /// ELM identification (`ATI`)
    Identify,
    /// Device description (`AT@1`)
    Describe,
    /// STN identification (`STI`)
    StnIdentify,
    /// STN serial number (`STSN`)
    StnSerialNumber,
    /// UniCarScan identification (`AT#1`)
    UniCarScanIdentify,
}

/// Typed adapter response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command acknowledged
    Ok,
    /// Free form text (identification strings)
    Text(String),
    /// Numeric protocol description
    Protocol(BusProtocol),
    /// Voltage in volts
    Voltage(f32),
    /// Raw ECU reply lines, non-ECU chatter dropped
    Lines(Vec<String>),
    /// Parsed ECU reply messages
    Messages(Vec<Message>),
    /// STN accepted the announcement and awaits the payload
    AwaitingData,
}

fn digit(on: bool) -> char {
    if on { '1' } else { '0' }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(*b >> 4) as usize] as char);
        out.push(HEX[(*b & 0x0F) as usize] as char);
    }
    out
}

fn hex_nibble(c: u8) -> TransportResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(TransportError::InvalidCharacters),
    }
}

fn hex_decode(text: &str) -> TransportResult<Vec<u8>> {
    let compact: Vec<u8> = text.bytes().filter(|b| *b != b' ').collect();
    if compact.len() % 2 != 0 {
        return Err(TransportError::InvalidCharacters);
    }
    compact
        .chunks(2)
        .map(|pair| Ok(hex_nibble(pair[0])? << 4 | hex_nibble(pair[1])?))
        .collect()
}

fn is_hex_line(line: &str) -> bool {
    !line.is_empty()
        && line
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b' ')
}

impl Command {
    /// Renders the command as its wire string (without the trailing CR)
    pub fn wire(&self) -> TransportResult<String> {
        Ok(match self {
            Self::Reset => "ATZ".into(),
            Self::Echo(on) => format!("ATE{}", digit(*on)),
            Self::Linefeeds(on) => format!("ATL{}", digit(*on)),
            Self::Headers(on) => format!("ATH{}", digit(*on)),
            Self::Spaces(on) => format!("ATS{}", digit(*on)),
            Self::AdaptiveTiming(on) => format!("ATAT{}", digit(*on)),
            Self::SetHeader(header) => format!("ATSH{}", format_header(*header)),
            Self::SetHeaderRaw(header) => {
                if header.is_empty() {
                    return Err(TransportError::MalformedService);
                }
                format!("ATSH{header}")
            }
            Self::CanReceiveArbitration(header) => format!("ATCRA{}", format_header(*header)),
            Self::SetProtocol(protocol) => {
                let number = protocol.number().ok_or(TransportError::MalformedService)?;
                format!("ATSP{number}")
            }
            Self::TryProtocol(protocol) => {
                let number = protocol.number().ok_or(TransportError::MalformedService)?;
                format!("ATTP{number}")
            }
            Self::DescribeProtocol => "ATDPN".into(),
            Self::CanAutoFormat(on) => format!("ATCAF{}", digit(*on)),
            Self::SetTimeout(value) => format!("ATST{value:02X}"),
            Self::ReadVoltage => "ATRV".into(),
            Self::ConnectProbe => "0100".into(),
            Self::Data {
                payload,
                expected_responses,
            } => {
                if payload.is_empty() {
                    return Err(TransportError::MessageTooSmall);
                }
                let mut line = hex_encode(payload);
                if let Some(count) = expected_responses {
                    // A trailing lone nibble tells the adapter how many
                    // replies to collect before returning
                    line.push(HEX[(*count & 0x0F) as usize] as char);
                }
                line
            }
            Self::StnTransmitAnnounce {
                header,
                replies,
                length,
            } => format!(
                "STPX h:{}, r:{replies}, l:{length}",
                format_header(*header)
            ),
            Self::StnTxSegmentation(on) => format!("STCSEGT{}", digit(*on)),
            Self::StnRxSegmentation(on) => format!("STCSEGR{}", digit(*on)),
            Self::Identify => "ATI".into(),
            Self::Describe => "AT@1".into(),
            Self::StnIdentify => "STI".into(),
            Self::StnSerialNumber => "STSN".into(),
            Self::UniCarScanIdentify => "AT#1".into(),
        })
    }

    /// Parses the adapter's raw reply text.
    ///
    /// `protocol` supplies the reply header width for data lines; it is
    /// ignored by every other command.
    pub fn parse(&self, raw: &str, protocol: BusProtocol) -> TransportResult<Response> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TransportError::NoResponse);
        }
        if trimmed.contains('?') {
            return Err(TransportError::UnrecognizedCommand);
        }
        for line in lines(trimmed) {
            if line.contains("ERROR") || line.contains("UNABLE") {
                return Err(TransportError::BusError(line.to_string()));
            }
        }
        match self {
            Self::Echo(_)
            | Self::Linefeeds(_)
            | Self::Headers(_)
            | Self::Spaces(_)
            | Self::AdaptiveTiming(_)
            | Self::SetHeader(_)
            | Self::SetHeaderRaw(_)
            | Self::CanReceiveArbitration(_)
            | Self::SetProtocol(_)
            | Self::TryProtocol(_)
            | Self::CanAutoFormat(_)
            | Self::SetTimeout(_)
            | Self::StnTxSegmentation(_)
            | Self::StnRxSegmentation(_) => {
                if trimmed.contains("OK") {
                    Ok(Response::Ok)
                } else {
                    Err(TransportError::UnexpectedResult(trimmed.to_string()))
                }
            }
            Self::Reset
            | Self::Identify
            | Self::Describe
            | Self::StnIdentify
            | Self::StnSerialNumber
            | Self::UniCarScanIdentify => Ok(Response::Text(trimmed.to_string())),
            Self::DescribeProtocol => Ok(Response::Protocol(BusProtocol::from_dpn(trimmed))),
            Self::ReadVoltage => {
                // Last line skips a possible command echo
                let volts = lines(trimmed)
                    .last()
                    .unwrap_or_default()
                    .trim_end_matches(['V', 'v'])
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| TransportError::UnexpectedResult(trimmed.to_string()))?;
                Ok(Response::Voltage(volts))
            }
            Self::ConnectProbe => Ok(Response::Lines(
                lines(trimmed)
                    .filter(|line| is_hex_line(line))
                    .map(str::to_string)
                    .collect(),
            )),
            Self::Data { .. } => {
                let messages = parse_data_lines(trimmed, protocol)?;
                if messages.is_empty() {
                    return Err(TransportError::NoResponse);
                }
                Ok(Response::Messages(messages))
            }
            Self::StnTransmitAnnounce { .. } => {
                if trimmed.contains("DATA") {
                    Ok(Response::AwaitingData)
                } else {
                    Err(TransportError::UnexpectedResult(trimmed.to_string()))
                }
            }
        }
    }
}

fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

// One reply line = header rendered in the protocol's width, then hex payload
pub(crate) fn parse_data_lines(text: &str, protocol: BusProtocol) -> TransportResult<Vec<Message>> {
    let header_len = protocol.header_len();
    let mut messages = Vec::new();
    for line in lines(text) {
        let compact: String = line.chars().filter(|c| *c != ' ').collect();
        if !is_hex_line(&compact) || compact.len() <= header_len {
            log::debug!("dropping non-ECU line {line:?}");
            continue;
        }
        let id = u32::from_str_radix(&compact[..header_len], 16)
            .map_err(|_| TransportError::InvalidCharacters)?;
        let data = hex_decode(&compact[header_len..])?;
        messages.push(Message::new(id, data));
    }
    Ok(messages)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_strings() {
        assert_eq!(Command::Reset.wire().unwrap(), "ATZ");
        assert_eq!(Command::Echo(false).wire().unwrap(), "ATE0");
        assert_eq!(Command::Linefeeds(true).wire().unwrap(), "ATL1");
        assert_eq!(Command::Headers(true).wire().unwrap(), "ATH1");
        assert_eq!(Command::Spaces(false).wire().unwrap(), "ATS0");
        assert_eq!(Command::AdaptiveTiming(false).wire().unwrap(), "ATAT0");
        assert_eq!(Command::SetHeader(0x7E0).wire().unwrap(), "ATSH7E0");
        assert_eq!(
            Command::SetHeaderRaw("686AF1".into()).wire().unwrap(),
            "ATSH686AF1"
        );
        assert_eq!(
            Command::SetHeader(0x18DA10F1).wire().unwrap(),
            "ATSH18DA10F1"
        );
        assert_eq!(
            Command::CanReceiveArbitration(0x7E8).wire().unwrap(),
            "ATCRA7E8"
        );
        assert_eq!(
            Command::SetProtocol(BusProtocol::Can11b500k).wire().unwrap(),
            "ATSP6"
        );
        assert_eq!(
            Command::TryProtocol(BusProtocol::SaeJ1939).wire().unwrap(),
            "ATTPA"
        );
        assert_eq!(Command::DescribeProtocol.wire().unwrap(), "ATDPN");
        assert_eq!(Command::CanAutoFormat(true).wire().unwrap(), "ATCAF1");
        assert_eq!(Command::SetTimeout(0xFF).wire().unwrap(), "ATSTFF");
        assert_eq!(Command::ReadVoltage.wire().unwrap(), "ATRV");
        assert_eq!(Command::ConnectProbe.wire().unwrap(), "0100");
        assert_eq!(Command::Identify.wire().unwrap(), "ATI");
        assert_eq!(Command::Describe.wire().unwrap(), "AT@1");
        assert_eq!(Command::StnIdentify.wire().unwrap(), "STI");
        assert_eq!(Command::StnSerialNumber.wire().unwrap(), "STSN");
        assert_eq!(Command::UniCarScanIdentify.wire().unwrap(), "AT#1");
        assert_eq!(Command::StnTxSegmentation(true).wire().unwrap(), "STCSEGT1");
        assert_eq!(Command::StnRxSegmentation(false).wire().unwrap(), "STCSEGR0");
    }

    #[test]
    fn data_wire_string() {
        let cmd = Command::Data {
            payload: vec![0x09, 0x02],
            expected_responses: None,
        };
        assert_eq!(cmd.wire().unwrap(), "0902");
        let cmd = Command::Data {
            payload: vec![0x01, 0x00],
            expected_responses: Some(1),
        };
        assert_eq!(cmd.wire().unwrap(), "01001");
        let cmd = Command::Data {
            payload: vec![],
            expected_responses: None,
        };
        assert_eq!(cmd.wire(), Err(TransportError::MessageTooSmall));
    }

    #[test]
    fn stpx_wire_string() {
        let cmd = Command::StnTransmitAnnounce {
            header: 0x7E0,
            replies: 1,
            length: 62,
        };
        assert_eq!(cmd.wire().unwrap(), "STPX h:7E0, r:1, l:62");
    }

    #[test]
    fn unknown_protocol_has_no_wire_form() {
        assert_eq!(
            Command::SetProtocol(BusProtocol::Unknown).wire(),
            Err(TransportError::MalformedService)
        );
    }

    #[test]
    fn failure_normalization() {
        let cmd = Command::Echo(false);
        assert_eq!(
            cmd.parse("", BusProtocol::Auto),
            Err(TransportError::NoResponse)
        );
        assert_eq!(
            cmd.parse("?", BusProtocol::Auto),
            Err(TransportError::UnrecognizedCommand)
        );
        assert!(matches!(
            cmd.parse("CAN ERROR", BusProtocol::Auto),
            Err(TransportError::BusError(_))
        ));
        assert!(matches!(
            cmd.parse("UNABLE TO CONNECT", BusProtocol::Auto),
            Err(TransportError::BusError(_))
        ));
        assert_eq!(cmd.parse("OK", BusProtocol::Auto), Ok(Response::Ok));
        assert!(matches!(
            cmd.parse("ELM327", BusProtocol::Auto),
            Err(TransportError::UnexpectedResult(_))
        ));
    }

    #[test]
    fn identification_and_protocol_parsing() {
        assert_eq!(
            Command::Identify.parse("ELM327 v1.5", BusProtocol::Auto),
            Ok(Response::Text("ELM327 v1.5".into()))
        );
        assert_eq!(
            Command::DescribeProtocol.parse("A6", BusProtocol::Auto),
            Ok(Response::Protocol(BusProtocol::Can11b500k))
        );
        assert_eq!(
            Command::DescribeProtocol.parse("0", BusProtocol::Auto),
            Ok(Response::Protocol(BusProtocol::Auto))
        );
    }

    #[test]
    fn voltage_parsing() {
        assert_eq!(
            Command::ReadVoltage.parse("12.3V", BusProtocol::Auto),
            Ok(Response::Voltage(12.3))
        );
        assert_eq!(
            Command::ReadVoltage.parse("11.9", BusProtocol::Auto),
            Ok(Response::Voltage(11.9))
        );
        assert!(matches!(
            Command::ReadVoltage.parse("LOW", BusProtocol::Auto),
            Err(TransportError::UnexpectedResult(_))
        ));
    }

    #[test]
    fn probe_drops_non_ecu_lines() {
        let reply = "SEARCHING...\r7E8 06 41 00 BE 1F B8 10\r7E9 06 41 00 80 00 00 01";
        assert_eq!(
            Command::ConnectProbe.parse(reply, BusProtocol::Can11b500k),
            Ok(Response::Lines(vec![
                "7E8 06 41 00 BE 1F B8 10".into(),
                "7E9 06 41 00 80 00 00 01".into()
            ]))
        );
    }

    #[test]
    fn data_lines_become_messages() {
        let cmd = Command::Data {
            payload: vec![0x09, 0x02],
            expected_responses: None,
        };
        let reply = "7E81049024944344750\r7E8214E4131433539";
        let Response::Messages(messages) = cmd.parse(reply, BusProtocol::Can11b500k).unwrap()
        else {
            panic!("expected messages");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, 0x7E8);
        assert_eq!(
            messages[0].data,
            vec![0x10, 0x49, 0x02, 0x49, 0x44, 0x34, 0x47, 0x50]
        );
        assert_eq!(messages[1].id, 0x7E8);
        assert_eq!(
            messages[1].data,
            vec![0x21, 0x4E, 0x41, 0x31, 0x43, 0x35, 0x39]
        );
    }

    #[test]
    fn data_lines_with_29bit_headers() {
        let cmd = Command::Data {
            payload: vec![0x3E, 0x00],
            expected_responses: None,
        };
        let reply = "18DAF110037E00AA";
        let Response::Messages(messages) = cmd.parse(reply, BusProtocol::Can29b500k).unwrap()
        else {
            panic!("expected messages");
        };
        assert_eq!(messages[0].id, 0x18DAF110);
        assert_eq!(messages[0].data, vec![0x03, 0x7E, 0x00, 0xAA]);
    }

    #[test]
    fn no_data_reply_is_no_response() {
        let cmd = Command::Data {
            payload: vec![0x09, 0x02],
            expected_responses: None,
        };
        assert_eq!(
            cmd.parse("NO DATA", BusProtocol::Can11b500k),
            Err(TransportError::NoResponse)
        );
    }

    #[test]
    fn stpx_expects_data_prompt() {
        let cmd = Command::StnTransmitAnnounce {
            header: 0x7E0,
            replies: 1,
            length: 10,
        };
        assert_eq!(
            cmd.parse("DATA", BusProtocol::Can11b500k),
            Ok(Response::AwaitingData)
        );
        assert!(matches!(
            cmd.parse("STOPPED", BusProtocol::Can11b500k),
            Err(TransportError::UnexpectedResult(_))
        ));
    }
}
