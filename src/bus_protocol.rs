//! Bus protocol descriptors as negotiated with ELM327 class adapters

use strum_macros::{Display, FromRepr};

/// Bus protocol tag, numbered the way the ELM327 `ATSP`/`ATTP`/`ATDPN`
/// commands number them.
///
/// `Unknown` is the sentinel for "adapter reported something we cannot map".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BusProtocol {
    /// Not negotiated / unmappable
    #[strum(serialize = "Unknown")]
    Unknown = 0xFF,
    /// Adapter chooses the protocol itself
    #[strum(serialize = "Automatic")]
    Auto = 0x00,
    /// SAE J1850 PWM (41.6 kbaud, Ford)
    #[strum(serialize = "SAE J1850 PWM")]
    J1850Pwm = 0x01,
    /// SAE J1850 VPW (10.4 kbaud, GM)
    #[strum(serialize = "SAE J1850 VPW")]
    J1850Vpwm = 0x02,
    /// ISO9141-2 (5 baud init)
    #[strum(serialize = "ISO9141-2")]
    Iso9141 = 0x03,
    /// ISO14230-4 KWP2000 with 5 baud init
    #[strum(serialize = "KWP2000 (5 baud init)")]
    Kwp2000Slow = 0x04,
    /// ISO14230-4 KWP2000 with fast init
    #[strum(serialize = "KWP2000 (fast init)")]
    Kwp2000Fast = 0x05,
    /// ISO15765-4 CAN, 11 bit IDs, 500 kbaud
    #[strum(serialize = "CAN 11bit/500k")]
    Can11b500k = 0x06,
    /// ISO15765-4 CAN, 29 bit IDs, 500 kbaud
    #[strum(serialize = "CAN 29bit/500k")]
    Can29b500k = 0x07,
    /// ISO15765-4 CAN, 11 bit IDs, 250 kbaud
    #[strum(serialize = "CAN 11bit/250k")]
    Can11b250k = 0x08,
    /// ISO15765-4 CAN, 29 bit IDs, 250 kbaud
    #[strum(serialize = "CAN 29bit/250k")]
    Can29b250k = 0x09,
    /// SAE J1939 (recognized, not driven beyond raw messages)
    #[strum(serialize = "SAE J1939")]
    SaeJ1939 = 0x0A,
    /// User programmable slot 1 (CAN 11 bit, 125 kbaud by default)
    #[strum(serialize = "User1 CAN 11bit/125k")]
    User1Can11b125k = 0x0B,
    /// User programmable slot 2 (CAN 11 bit, 50 kbaud by default)
    #[strum(serialize = "User2 CAN 11bit/50k")]
    User2Can11b50k = 0x0C,
}

impl BusProtocol {
    /// True for every CAN based protocol (including J1939 and the user slots)
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            Self::Can11b500k
                | Self::Can29b500k
                | Self::Can11b250k
                | Self::Can29b250k
                | Self::SaeJ1939
                | Self::User1Can11b125k
                | Self::User2Can11b50k
        )
    }

    /// True once this tag names a concrete negotiated protocol
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Unknown | Self::Auto)
    }

    /// True for protocols with 29 bit headers
    pub fn is_29bit(&self) -> bool {
        matches!(self, Self::Can29b500k | Self::Can29b250k | Self::SaeJ1939)
    }

    /// Conventional functional broadcast header for this protocol, rendered
    /// the way `ATSH` expects it
    pub fn broadcast_header(&self) -> &'static str {
        match self {
            Self::J1850Pwm => "616AF1",
            Self::J1850Vpwm | Self::Iso9141 | Self::Kwp2000Slow => "686AF1",
            Self::Kwp2000Fast => "C233F1",
            Self::Can11b500k | Self::Can11b250k | Self::User1Can11b125k | Self::User2Can11b50k => {
                "7DF"
            }
            Self::Can29b500k | Self::Can29b250k | Self::SaeJ1939 => "18DB33F1",
            Self::Unknown | Self::Auto => "",
        }
    }

    /// Number of hex characters the adapter renders per reply header:
    /// 8 for 29 bit protocols, 3 otherwise
    pub fn header_len(&self) -> usize {
        if self.is_29bit() { 8 } else { 3 }
    }

    /// Digit used with `ATSP`/`ATTP`. None for [BusProtocol::Unknown]
    pub fn number(&self) -> Option<char> {
        match self {
            Self::Unknown => None,
            other => char::from_digit(*other as u32, 16).map(|c| c.to_ascii_uppercase()),
        }
    }

    /// Maps an `ATDPN` reply to a protocol tag. The adapter prefixes `A` when
    /// it picked the protocol automatically
    pub fn from_dpn(reply: &str) -> Self {
        let trimmed = reply.trim().trim_start_matches(['A', 'a']);
        u8::from_str_radix(trimmed, 16)
            .ok()
            .and_then(Self::from_repr)
            .unwrap_or(Self::Unknown)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_match_elm_table() {
        assert_eq!(BusProtocol::Auto.number(), Some('0'));
        assert_eq!(BusProtocol::J1850Pwm.number(), Some('1'));
        assert_eq!(BusProtocol::Can11b500k.number(), Some('6'));
        assert_eq!(BusProtocol::SaeJ1939.number(), Some('A'));
        assert_eq!(BusProtocol::User2Can11b50k.number(), Some('C'));
        assert_eq!(BusProtocol::Unknown.number(), None);
    }

    #[test]
    fn dpn_parsing() {
        assert_eq!(BusProtocol::from_dpn("6"), BusProtocol::Can11b500k);
        assert_eq!(BusProtocol::from_dpn("A6"), BusProtocol::Can11b500k);
        assert_eq!(BusProtocol::from_dpn("A7\r"), BusProtocol::Can29b500k);
        assert_eq!(BusProtocol::from_dpn("3"), BusProtocol::Iso9141);
        assert_eq!(BusProtocol::from_dpn("0"), BusProtocol::Auto);
        assert_eq!(BusProtocol::from_dpn(""), BusProtocol::Unknown);
        assert_eq!(BusProtocol::from_dpn("Z"), BusProtocol::Unknown);
        assert!(!BusProtocol::from_dpn("0").is_valid());
        assert!(BusProtocol::from_dpn("8").is_valid());
    }

    #[test]
    fn derived_attributes() {
        assert!(BusProtocol::Can29b250k.is_can());
        assert!(BusProtocol::SaeJ1939.is_can());
        assert!(!BusProtocol::Iso9141.is_can());
        assert_eq!(BusProtocol::Can11b500k.header_len(), 3);
        assert_eq!(BusProtocol::Can29b500k.header_len(), 8);
        assert_eq!(BusProtocol::SaeJ1939.header_len(), 8);
        assert_eq!(BusProtocol::Iso9141.header_len(), 3);
        assert_eq!(BusProtocol::Can11b500k.broadcast_header(), "7DF");
        assert_eq!(BusProtocol::Can29b500k.broadcast_header(), "18DB33F1");
        assert_eq!(BusProtocol::Kwp2000Fast.broadcast_header(), "C233F1");
    }
}
