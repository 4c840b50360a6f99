//! UDS (ISO14229) wire level definitions needed by the transport: the
//! negative response grammar and the pipeline which serializes access to one
//! adapter.
//!
//! The service catalog itself (what 0x10, 0x22 and friends *mean*) is out of
//! scope, a diagnostic server crate supplies it.

pub mod pipeline;

/// Service ID of a negative response message
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Raw code of [NegativeResponseCode::RequestCorrectlyReceivedResponsePending]
pub const RESPONSE_PENDING: u8 = 0x78;

/// UDS negative response codes (ISO14229-1 A.1).
///
/// `0x78` (request correctly received, response pending) is an intermediate
/// signal, not a terminal error; the transport filters it out, every other
/// code terminates the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegativeResponseCode {
    /// ECU rejected the request with no specific reason
    GeneralReject,
    /// Service not supported by the ECU
    ServiceNotSupported,
    /// Sub function not supported by the ECU
    SubFunctionNotSupported,
    /// Request length or format was wrong
    IncorrectMessageLengthOrInvalidFormat,
    /// Response would not fit the transport
    ResponseTooLong,
    /// ECU is busy, repeat the request
    BusyRepeatRequest,
    /// Prerequisite conditions not met
    ConditionsNotCorrect,
    /// Request was sent out of order
    RequestSequenceError,
    /// A subnet component did not answer the ECU in time
    NoResponseFromSubnetComponent,
    /// A failure condition blocks execution
    FailurePreventsExecutionOfRequestedAction,
    /// Request parameter outside its valid range
    RequestOutOfRange,
    /// Security access has not been granted
    SecurityAccessDenied,
    /// Security key was wrong
    InvalidKey,
    /// Too many wrong security keys
    ExceedNumberOfAttempts,
    /// Security retry delay has not expired yet
    RequiredTimeDelayNotExpired,
    /// 0x38..=0x4F, reserved for ISO15764 extended data link security
    ReservedByExtendedDataLinkSecurityDocumentation(u8),
    /// Upload/download request refused
    UploadDownloadNotAccepted,
    /// Data transfer halted due to a fault
    TransferDataSuspended,
    /// Error while erasing or flashing
    GeneralProgrammingFailure,
    /// Block sequence counter mismatch during reprogramming
    WrongBlockSequenceCounter,
    /// Request accepted, terminal response follows later
    RequestCorrectlyReceivedResponsePending,
    /// Sub function not supported in the active session
    SubFunctionNotSupportedInActiveSession,
    /// Service not supported in the active session
    ServiceNotSupportedInActiveSession,
    /// Engine RPM too high
    RpmTooHigh,
    /// Engine RPM too low
    RpmTooLow,
    /// Engine is running
    EngineIsRunning,
    /// Engine is not running
    EngineIsNotRunning,
    /// Engine has not run long enough
    EngineRunTimeTooLow,
    /// Coolant temperature too high
    TemperatureTooHigh,
    /// Coolant temperature too low
    TemperatureTooLow,
    /// Vehicle speed too high
    VehicleSpeedTooHigh,
    /// Vehicle speed too low
    VehicleSpeedTooLow,
    /// Throttle/pedal too high
    ThrottleTooHigh,
    /// Throttle/pedal too low
    ThrottleTooLow,
    /// Transmission not in neutral
    TransmissionRangeNotInNeutral,
    /// Transmission not in gear
    TransmissionRangeNotInGear,
    /// Brake switch not closed
    BrakeSwitchNotClosed,
    /// Shifter lever not in park
    ShifterLeverNotInPark,
    /// Torque converter clutch is locked
    TorqueConverterClutchLocked,
    /// System voltage too high
    VoltageTooHigh,
    /// System voltage too low
    VoltageTooLow,
    /// 0x94..=0xFE, reserved for specific conditions not correct
    ReservedForSpecificConditionsNotCorrect(u8),
    /// Any other reserved code
    IsoSaeReserved(u8),
}

impl From<u8> for NegativeResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnetComponent,
            0x26 => Self::FailurePreventsExecutionOfRequestedAction,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x38..=0x4F => Self::ReservedByExtendedDataLinkSecurityDocumentation(code),
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x81 => Self::RpmTooHigh,
            0x82 => Self::RpmTooLow,
            0x83 => Self::EngineIsRunning,
            0x84 => Self::EngineIsNotRunning,
            0x85 => Self::EngineRunTimeTooLow,
            0x86 => Self::TemperatureTooHigh,
            0x87 => Self::TemperatureTooLow,
            0x88 => Self::VehicleSpeedTooHigh,
            0x89 => Self::VehicleSpeedTooLow,
            0x8A => Self::ThrottleTooHigh,
            0x8B => Self::ThrottleTooLow,
            0x8C => Self::TransmissionRangeNotInNeutral,
            0x8D => Self::TransmissionRangeNotInGear,
            0x8F => Self::BrakeSwitchNotClosed,
            0x90 => Self::ShifterLeverNotInPark,
            0x91 => Self::TorqueConverterClutchLocked,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            0x94..=0xFE => Self::ReservedForSpecificConditionsNotCorrect(code),
            _ => Self::IsoSaeReserved(code),
        }
    }
}

impl NegativeResponseCode {
    /// True for the intermediate "response pending" signal
    pub fn is_response_pending(&self) -> bool {
        *self == Self::RequestCorrectlyReceivedResponsePending
    }

    /// Raw wire code
    pub fn byte(&self) -> u8 {
        match self {
            Self::GeneralReject => 0x10,
            Self::ServiceNotSupported => 0x11,
            Self::SubFunctionNotSupported => 0x12,
            Self::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Self::ResponseTooLong => 0x14,
            Self::BusyRepeatRequest => 0x21,
            Self::ConditionsNotCorrect => 0x22,
            Self::RequestSequenceError => 0x24,
            Self::NoResponseFromSubnetComponent => 0x25,
            Self::FailurePreventsExecutionOfRequestedAction => 0x26,
            Self::RequestOutOfRange => 0x31,
            Self::SecurityAccessDenied => 0x33,
            Self::InvalidKey => 0x35,
            Self::ExceedNumberOfAttempts => 0x36,
            Self::RequiredTimeDelayNotExpired => 0x37,
            Self::ReservedByExtendedDataLinkSecurityDocumentation(c) => *c,
            Self::UploadDownloadNotAccepted => 0x70,
            Self::TransferDataSuspended => 0x71,
            Self::GeneralProgrammingFailure => 0x72,
            Self::WrongBlockSequenceCounter => 0x73,
            Self::RequestCorrectlyReceivedResponsePending => RESPONSE_PENDING,
            Self::SubFunctionNotSupportedInActiveSession => 0x7E,
            Self::ServiceNotSupportedInActiveSession => 0x7F,
            Self::RpmTooHigh => 0x81,
            Self::RpmTooLow => 0x82,
            Self::EngineIsRunning => 0x83,
            Self::EngineIsNotRunning => 0x84,
            Self::EngineRunTimeTooLow => 0x85,
            Self::TemperatureTooHigh => 0x86,
            Self::TemperatureTooLow => 0x87,
            Self::VehicleSpeedTooHigh => 0x88,
            Self::VehicleSpeedTooLow => 0x89,
            Self::ThrottleTooHigh => 0x8A,
            Self::ThrottleTooLow => 0x8B,
            Self::TransmissionRangeNotInNeutral => 0x8C,
            Self::TransmissionRangeNotInGear => 0x8D,
            Self::BrakeSwitchNotClosed => 0x8F,
            Self::ShifterLeverNotInPark => 0x90,
            Self::TorqueConverterClutchLocked => 0x91,
            Self::VoltageTooHigh => 0x92,
            Self::VoltageTooLow => 0x93,
            Self::ReservedForSpecificConditionsNotCorrect(c) => *c,
            Self::IsoSaeReserved(c) => *c,
        }
    }
}
