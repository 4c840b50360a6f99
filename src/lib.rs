#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate which provides the transport and framing layer needed to talk UDS (ISO14229)
//! and OBD2 (SAE J1979) to vehicle ECUs through low cost serial diagnostic adapters
//! (ELM327, STN11xx/STN22xx, UniCarScan and compatible clones)
//!
//! ## What this crate does
//!
//! * ISO15765-2 (ISO-TP) segmentation and reassembly of diagnostic payloads up to 4095
//!   bytes onto 8 byte CAN frames, both as a bidirectional transceiver state machine
//!   ([isotp::transceiver::Transceiver]) and as stateless block encoders/decoders
//!   ([isotp::framer]) for adapters which do their own segmentation
//! * Decoders for the legacy OBD2 bus protocols (SAE J1850, ISO9141-2, KWP2000)
//! * A single-in-flight command queue over a full duplex byte stream with
//!   terminator based response framing and per command timeouts
//!   ([stream::StreamCommandQueue])
//! * The ELM327 AT/ST command set and its response grammar ([elm327::commands])
//! * An adapter driver which identifies the adapter IC, negotiates the bus protocol
//!   and routes UDS messages through the correct codec pair ([elm327::Elm327])
//! * A pipeline which serializes concurrent UDS submissions onto one adapter and
//!   filters transient "response pending" negative responses
//!   ([uds::pipeline::UdsPipeline])
//!
//! ## What this crate does NOT do
//!
//! This crate delivers framed UDS messages byte-accurately. It does not implement the
//! UDS service catalog itself (session control, DTC reading, flashing and friends),
//! nor OBD2 PID decoding tables. Build those on top, or use a diagnostic server crate
//! which consumes this transport.

use crate::uds::NegativeResponseCode;

pub mod bus_protocol;
pub mod codec;
pub mod elm327;
pub mod isotp;
pub mod message;
pub mod simulation;
pub mod stream;
pub mod uds;

/// Transport layer result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Error produced by the transport layer
pub enum TransportError {
    /// Physical or adapter level error reported from the wire
    /// (`BUS ERROR`, `UNABLE TO CONNECT`, ...)
    #[error("bus error: {0}")]
    BusError(String),
    /// ISO-TP (or other bus codec) could not encode the payload
    #[error("encoder error: {0}")]
    EncoderError(String),
    /// ISO-TP (or other bus codec) could not decode the frame data
    #[error("decoder error: {0}")]
    DecoderError(String),
    /// The adapter has terminally departed
    #[error("adapter disconnected")]
    Disconnected,
    /// Response contained non ASCII or otherwise unparseable bytes
    #[error("invalid characters in response")]
    InvalidCharacters,
    /// Structural violation in a higher layer response
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// The requested operation has no mapping for the current command provider
    #[error("malformed service")]
    MalformedService,
    /// The adapter or ECU returned an empty reply
    #[error("no response")]
    NoResponse,
    /// The per command timer expired before the response terminator was seen
    #[error("command timed out")]
    Timeout,
    /// The ECU replied with a negative response code other than responsePending
    #[error("ECU negative response: {0:?}")]
    UdsNegativeResponse(NegativeResponseCode),
    /// Response type or shape did not match what the command expected
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
    /// The adapter lacks a capability needed for this request
    #[error("adapter is unsuitable for this request")]
    UnsuitableAdapter,
    /// The adapter answered `?` (command not understood)
    #[error("adapter did not recognize the command")]
    UnrecognizedCommand,
    /// ISO-TP state machine violation
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Payload is empty
    #[error("message too small")]
    MessageTooSmall,
    /// Payload exceeds the maximum the protocol can carry
    #[error("message too big")]
    MessageTooBig,
    /// Underlying stream error or end of stream
    #[error("communication failure: {0}")]
    Communication(String),
    /// The queue was shut down while the command was active
    #[error("transport shut down")]
    Shutdown,
}
