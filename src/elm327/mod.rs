//! Driver for ELM327 class serial adapters (genuine ELM, STN11xx/STN22xx,
//! UniCarScan and the countless clones).
//!
//! The driver owns a [StreamCommandQueue], walks the adapter through
//! identification and bus protocol negotiation, installs the matching
//! encoder/decoder pair, and routes UDS messages through it. Callers observe
//! the lifecycle through [Elm327::state] or a registered observer callback.

use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::bus_protocol::BusProtocol;
use crate::codec::{
    Iso9141Decoder, IsoTpDecoder, J1850Decoder, Kwp2000Decoder, NullDecoder, NullEncoder,
    PayloadDecoder, PayloadEncoder,
};
use crate::message::{Header, Message};
use crate::stream::StreamCommandQueue;
use crate::uds::{NEGATIVE_RESPONSE_SID, RESPONSE_PENDING};
use crate::{TransportError, TransportResult};

use self::commands::{Command, Response};

pub mod commands;

/// Best effort probe commands during init may simply time out
const DUMMY_TIMEOUT: Duration = Duration::from_millis(300);
/// AT configuration commands answer quickly
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1500);
/// Bus traffic waits for ECU timeouts, which we max out via `ATST`
const DATA_TIMEOUT: Duration = Duration::from_millis(5000);

bitflags! {
    /// On-chip ISO-TP segmentation capabilities of the adapter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Segmentation: u8 {
        /// Adapter segments outbound payloads itself
        const TX = 0b01;
        /// Adapter reassembles inbound payloads itself
        const RX = 0b10;
    }
}

/// Adapter IC family, decides which extended command sets are available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcFamily {
    /// Genuine ELM327 or a plain clone
    Elm327,
    /// ScanTool STN11xx
    Stn11xx,
    /// ScanTool STN22xx
    Stn22xx,
    /// WGSoft.de UniCarScan
    UniCarScan,
}

impl IcFamily {
    /// True for the ScanTool parts with the `ST` command set
    pub fn is_stn(&self) -> bool {
        matches!(self, Self::Stn11xx | Self::Stn22xx)
    }

    /// Payload bound of the IC's on-chip segmentation
    fn segmentation_limit(&self) -> usize {
        match self {
            Self::Stn11xx => 0x7FF,
            Self::Stn22xx => 0xFFF,
            Self::Elm327 | Self::UniCarScan => 0xFF,
        }
    }
}

/// Identification gathered during the init sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// `ATI` identification string
    pub vendor: String,
    /// Device description (`AT@1`), falls back to the `ATI` string
    pub version: String,
    /// Detected IC family
    pub ic: IcFamily,
    /// STN device name (`STI`)
    pub name: Option<String>,
    /// STN serial number (`STSN`)
    pub serial: Option<String>,
}

/// Adapter lifecycle.
///
/// ```text
/// created -> searching -> { notFound | configuring }
/// configuring -> { unsupportedProtocol | connected }
/// connected -> gone
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterState {
    /// Driver constructed, nothing sent yet
    Created,
    /// Init sequence is running
    Searching,
    /// No adapter answered the init sequence
    NotFound,
    /// Adapter identified, bus negotiation running
    Configuring(AdapterInfo),
    /// The requested bus protocol could not be negotiated
    UnsupportedProtocol,
    /// Ready for [Elm327::send_uds]
    Connected {
        /// Negotiated bus protocol
        protocol: BusProtocol,
        /// ECU messages seen while probing, keyed by their source header
        detected: Vec<Message>,
    },
    /// Shut down
    Gone,
}

type StateObserver = Box<dyn Fn(&AdapterState) + Send>;

/// ELM327 class adapter driver
pub struct Elm327 {
    queue: StreamCommandQueue,
    state: AdapterState,
    observer: Option<StateObserver>,
    info: Option<AdapterInfo>,
    protocol: BusProtocol,
    encoder: Box<dyn PayloadEncoder>,
    decoder: Box<dyn PayloadDecoder>,
    segmentation: Segmentation,
    can_auto_format: bool,
    current_header: Header,
    current_arbitration: Header,
}

impl std::fmt::Debug for Elm327 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Elm327 {{ state: {:?}, protocol: {:?} }}",
            self.state, self.protocol
        )
    }
}

impl Elm327 {
    /// Creates a driver over an already running command queue
    pub fn new(queue: StreamCommandQueue) -> Self {
        Self {
            queue,
            state: AdapterState::Created,
            observer: None,
            info: None,
            protocol: BusProtocol::Unknown,
            encoder: Box::new(NullEncoder::new(7)),
            decoder: Box::new(NullDecoder),
            segmentation: Segmentation::empty(),
            can_auto_format: false,
            current_header: 0,
            current_arbitration: 0,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> &AdapterState {
        &self.state
    }

    /// Identification gathered during init, if init ran
    pub fn info(&self) -> Option<&AdapterInfo> {
        self.info.as_ref()
    }

    /// Negotiated bus protocol
    pub fn protocol(&self) -> BusProtocol {
        self.protocol
    }

    /// Discovered segmentation capabilities
    pub fn segmentation(&self) -> Segmentation {
        self.segmentation
    }

    /// Largest UDS payload one [Elm327::send_uds] call can carry
    pub fn mtu(&self) -> usize {
        self.encoder.maximum_frame_length()
    }

    /// Registers a callback fired once per state transition
    pub fn set_state_observer<F: Fn(&AdapterState) + Send + 'static>(&mut self, observer: F) {
        self.observer = Some(Box::new(observer));
    }

    /// Initializes the adapter and connects with the given protocol
    /// (`Auto` lets the adapter search)
    pub fn connect(&mut self, protocol: BusProtocol) -> TransportResult<()> {
        self.search(&[protocol], &[], false)
    }

    /// Initializes the adapter, then negotiates a bus protocol.
    ///
    /// With no `tests`, the first protocol is selected via `ATSP` and verified
    /// with an OBD2 probe. Otherwise each candidate protocol is tried with
    /// each test message until one answers; with `test_all` the search runs
    /// across all tests and collects every answer.
    pub fn search(
        &mut self,
        protocols: &[BusProtocol],
        tests: &[Message],
        test_all: bool,
    ) -> TransportResult<()> {
        self.set_state(AdapterState::Searching);
        let info = match self.init_sequence() {
            Ok(info) => info,
            Err(e) => {
                warn!("adapter init failed: {e}");
                self.set_state(AdapterState::NotFound);
                return Err(e);
            }
        };
        info!("adapter identified: {info:?}");
        self.info = Some(info.clone());
        self.set_state(AdapterState::Configuring(info));
        match self.configure(protocols, tests, test_all) {
            Ok((protocol, detected)) => {
                info!("connected, protocol {protocol}, {} probe replies", detected.len());
                self.protocol = protocol;
                self.set_state(AdapterState::Connected { protocol, detected });
                Ok(())
            }
            Err(e) => {
                self.set_state(AdapterState::UnsupportedProtocol);
                Err(e)
            }
        }
    }

    /// Sends one UDS request and returns the reassembled reply
    pub fn send_uds(&mut self, message: &Message) -> TransportResult<Message> {
        if !matches!(self.state, AdapterState::Connected { .. }) {
            return Err(TransportError::Disconnected);
        }
        if message.data.is_empty() {
            return Err(TransportError::MessageTooSmall);
        }
        self.apply_addressing(message)?;
        let encoded = self.encoder.encode(&message.data)?;
        let is_stn = self.info.as_ref().is_some_and(|i| i.ic.is_stn());
        let response = if encoded.len() > 8 && is_stn {
            // The ELM line length limit does not apply once the STN has been
            // told how many bytes are coming
            let announce = Command::StnTransmitAnnounce {
                header: message.id,
                replies: 1,
                length: encoded.len(),
            };
            match self.command(&announce, COMMAND_TIMEOUT)? {
                Response::AwaitingData => {}
                other => {
                    return Err(TransportError::UnexpectedResult(format!(
                        "STPX answered {other:?}"
                    )));
                }
            }
            self.command(
                &Command::Data {
                    payload: encoded,
                    expected_responses: None,
                },
                DATA_TIMEOUT,
            )?
        } else {
            self.command(
                &Command::Data {
                    payload: encoded,
                    expected_responses: None,
                },
                DATA_TIMEOUT,
            )?
        };
        let Response::Messages(replies) = response else {
            return Err(TransportError::UnexpectedResult(
                "data command did not yield messages".into(),
            ));
        };
        self.assemble_reply(message, replies)
    }

    /// Battery voltage as reported by the adapter (`ATRV`)
    pub fn read_voltage(&self) -> TransportResult<f32> {
        match self.command(&Command::ReadVoltage, COMMAND_TIMEOUT)? {
            Response::Voltage(v) => Ok(v),
            other => Err(TransportError::UnexpectedResult(format!(
                "voltage reply was {other:?}"
            ))),
        }
    }

    /// Stops the queue worker and transitions to [AdapterState::Gone]
    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        self.set_state(AdapterState::Gone);
    }

    fn set_state(&mut self, state: AdapterState) {
        if state != self.state {
            debug!("adapter state -> {state:?}");
            self.state = state;
            if let Some(observer) = &self.observer {
                observer(&self.state);
            }
        }
    }

    fn command(&self, command: &Command, timeout: Duration) -> TransportResult<Response> {
        let wire = command.wire()?;
        let raw = self.queue.send(&wire, timeout)?;
        command.parse(&raw, self.protocol)
    }

    fn expect_ok(&self, command: Command, timeout: Duration) -> TransportResult<()> {
        match self.command(&command, timeout)? {
            Response::Ok => Ok(()),
            other => Err(TransportError::UnexpectedResult(format!(
                "{command:?} answered {other:?}"
            ))),
        }
    }

    fn init_sequence(&mut self) -> TransportResult<AdapterInfo> {
        // Wake the UART, flush half-received garbage. Both may time out
        let _ = self.queue.send(" ", DUMMY_TIMEOUT);
        let _ = self.queue.send(" ", DUMMY_TIMEOUT);
        let Response::Text(ident) = self.command(&Command::Reset, COMMAND_TIMEOUT)? else {
            return Err(TransportError::UnexpectedResult("reset gave no text".into()));
        };
        debug!("reset ident {ident:?}");
        self.expect_ok(Command::Spaces(false), COMMAND_TIMEOUT)?;
        self.expect_ok(Command::Echo(false), COMMAND_TIMEOUT)?;
        self.expect_ok(Command::Linefeeds(false), COMMAND_TIMEOUT)?;
        self.expect_ok(Command::Headers(true), COMMAND_TIMEOUT)?;

        let Response::Text(vendor) = self.command(&Command::Identify, COMMAND_TIMEOUT)? else {
            return Err(TransportError::UnexpectedResult("ATI gave no text".into()));
        };
        let mut info = AdapterInfo {
            version: vendor.clone(),
            vendor,
            ic: IcFamily::Elm327,
            name: None,
            serial: None,
        };
        if let Ok(Response::Text(description)) = self.command(&Command::Describe, COMMAND_TIMEOUT)
        {
            info.version = description;
        }
        if let Ok(Response::Text(sti)) = self.command(&Command::StnIdentify, COMMAND_TIMEOUT) {
            if sti.contains("STN11") {
                info.ic = IcFamily::Stn11xx;
            } else if sti.contains("STN22") {
                info.ic = IcFamily::Stn22xx;
            }
            if info.ic.is_stn() {
                info.name = Some(sti);
                if let Ok(Response::Text(serial)) =
                    self.command(&Command::StnSerialNumber, COMMAND_TIMEOUT)
                {
                    info.serial = Some(serial);
                }
            }
        }
        if let Ok(Response::Text(id)) = self.command(&Command::UniCarScanIdentify, COMMAND_TIMEOUT)
        {
            if id.contains("WGSoft.de") {
                info.ic = IcFamily::UniCarScan;
            }
        }
        Ok(info)
    }

    fn configure(
        &mut self,
        protocols: &[BusProtocol],
        tests: &[Message],
        test_all: bool,
    ) -> TransportResult<(BusProtocol, Vec<Message>)> {
        let (negotiated, detected) = if tests.is_empty() {
            let desired = protocols.first().copied().unwrap_or(BusProtocol::Auto);
            self.expect_ok(Command::SetProtocol(desired), COMMAND_TIMEOUT)?;
            // The probe forces the adapter onto the bus; its failure modes
            // (no vehicle, wrong protocol) surface through ATDPN below
            let probe = self.command(&Command::ConnectProbe, DATA_TIMEOUT);
            let Response::Protocol(actual) =
                self.command(&Command::DescribeProtocol, COMMAND_TIMEOUT)?
            else {
                return Err(TransportError::UnexpectedResult("ATDPN gave no tag".into()));
            };
            if !actual.is_valid() {
                warn!("adapter settled on {actual}, which is unusable");
                return Err(TransportError::UnsuitableAdapter);
            }
            self.protocol = actual;
            let detected = match probe {
                Ok(Response::Lines(lines)) => {
                    commands::parse_data_lines(&lines.join("\r"), actual).unwrap_or_default()
                }
                _ => Vec::new(),
            };
            (actual, detected)
        } else {
            self.search_with_tests(protocols, tests, test_all)?
        };

        if negotiated.is_can() {
            self.configure_can()?;
        } else {
            self.segmentation = Segmentation::empty();
            self.can_auto_format = false;
        }
        self.install_codecs(negotiated);
        Ok((negotiated, detected))
    }

    fn search_with_tests(
        &mut self,
        protocols: &[BusProtocol],
        tests: &[Message],
        test_all: bool,
    ) -> TransportResult<(BusProtocol, Vec<Message>)> {
        let mut negotiated = None;
        let mut detected = Vec::new();
        'protocols: for protocol in protocols {
            if self.expect_ok(Command::TryProtocol(*protocol), COMMAND_TIMEOUT).is_err() {
                continue;
            }
            self.protocol = *protocol;
            for test in tests {
                let header = if test.id == 0 {
                    Command::SetHeaderRaw(protocol.broadcast_header().to_string())
                } else {
                    Command::SetHeader(test.id)
                };
                if self.expect_ok(header, COMMAND_TIMEOUT).is_err() {
                    continue;
                }
                let data = Command::Data {
                    payload: test.data.clone(),
                    expected_responses: None,
                };
                match self.command(&data, DATA_TIMEOUT) {
                    Ok(Response::Messages(messages)) => {
                        debug!("{protocol} answered the test probe");
                        detected.extend(messages);
                        negotiated = Some(*protocol);
                        if !test_all {
                            break 'protocols;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!("test probe on {protocol} failed: {e}"),
                }
            }
        }
        match negotiated {
            Some(protocol) => {
                self.protocol = protocol;
                Ok((protocol, detected))
            }
            None => Err(TransportError::NoResponse),
        }
    }

    fn configure_can(&mut self) -> TransportResult<()> {
        self.expect_ok(Command::AdaptiveTiming(false), COMMAND_TIMEOUT)?;
        self.expect_ok(Command::SetTimeout(0xFF), COMMAND_TIMEOUT)?;
        self.can_auto_format = self
            .expect_ok(Command::CanAutoFormat(true), COMMAND_TIMEOUT)
            .is_ok();
        let is_stn = self.info.as_ref().is_some_and(|i| i.ic.is_stn());
        self.segmentation = if is_stn {
            let mut segmentation = Segmentation::empty();
            if self
                .expect_ok(Command::StnTxSegmentation(true), COMMAND_TIMEOUT)
                .is_ok()
            {
                segmentation |= Segmentation::TX;
            }
            if self
                .expect_ok(Command::StnRxSegmentation(true), COMMAND_TIMEOUT)
                .is_ok()
            {
                segmentation |= Segmentation::RX;
            }
            segmentation
        } else {
            self.probe_segmentation()
        };
        debug!("segmentation capabilities: {:?}", self.segmentation);
        Ok(())
    }

    // Some clones (UniCarScan among them) segment on chip without speaking
    // the ST command set. A payload beyond the ELM line limit reveals the
    // transmit side, a suppressed-response tester present the receive side.
    fn probe_segmentation(&self) -> Segmentation {
        let mut long = vec![0x3E, 0x80];
        long.resize(12, 0x00);
        let tx_probe = self.command(
            &Command::Data {
                payload: long,
                expected_responses: Some(0),
            },
            COMMAND_TIMEOUT,
        );
        let accepted = |result: &TransportResult<Response>| {
            matches!(result, Ok(_) | Err(TransportError::NoResponse))
        };
        if !accepted(&tx_probe) {
            return Segmentation::empty();
        }
        let rx_probe = self.command(
            &Command::Data {
                payload: vec![0x3E, 0x80],
                expected_responses: Some(0),
            },
            COMMAND_TIMEOUT,
        );
        if accepted(&rx_probe) {
            Segmentation::TX | Segmentation::RX
        } else {
            Segmentation::TX
        }
    }

    fn install_codecs(&mut self, protocol: BusProtocol) {
        let (encoder, decoder): (Box<dyn PayloadEncoder>, Box<dyn PayloadDecoder>) = match protocol
        {
            BusProtocol::J1850Pwm | BusProtocol::J1850Vpwm => {
                (Box::new(NullEncoder::new(7)), Box::new(J1850Decoder))
            }
            BusProtocol::Iso9141 => (Box::new(NullEncoder::new(7)), Box::new(Iso9141Decoder)),
            BusProtocol::Kwp2000Slow | BusProtocol::Kwp2000Fast => {
                (Box::new(NullEncoder::new(7)), Box::new(Kwp2000Decoder))
            }
            _ => {
                let limit = self
                    .info
                    .as_ref()
                    .map(|i| i.ic.segmentation_limit())
                    .unwrap_or(0xFF);
                let encoder: Box<dyn PayloadEncoder> =
                    if self.segmentation.contains(Segmentation::TX) {
                        Box::new(NullEncoder::new(limit))
                    } else if self.can_auto_format {
                        Box::new(NullEncoder::new(7))
                    } else {
                        Box::new(NullEncoder::new(8))
                    };
                let decoder: Box<dyn PayloadDecoder> =
                    if self.segmentation.contains(Segmentation::RX) {
                        Box::new(NullDecoder)
                    } else {
                        Box::new(IsoTpDecoder)
                    };
                (encoder, decoder)
            }
        };
        self.encoder = encoder;
        self.decoder = decoder;
        debug!("codecs installed, MTU {}", self.encoder.maximum_frame_length());
    }

    // Re-issue ATSH/ATCRA only when the addressing actually changed
    fn apply_addressing(&mut self, message: &Message) -> TransportResult<()> {
        if message.id != 0 && message.id != self.current_header {
            self.expect_ok(Command::SetHeader(message.id), COMMAND_TIMEOUT)?;
            self.current_header = message.id;
        }
        // ATCRA only exists on the CAN protocols; elsewhere replies are
        // filtered in software
        if self.protocol.is_can()
            && message.reply != 0
            && message.reply != self.current_arbitration
        {
            self.expect_ok(Command::CanReceiveArbitration(message.reply), COMMAND_TIMEOUT)?;
            self.current_arbitration = message.reply;
        }
        Ok(())
    }

    fn assemble_reply(
        &mut self,
        request: &Message,
        replies: Vec<Message>,
    ) -> TransportResult<Message> {
        let sid = request.data[0];
        // Without on-chip reassembly the adapter reports raw frames, so the
        // pending marker hides behind the single-frame PCI byte
        let pci_offset = if self.segmentation.contains(Segmentation::RX) {
            0
        } else {
            1
        };
        let mut concatenated = Vec::new();
        let mut source = 0;
        for reply in replies {
            if request.reply != 0 && reply.id != request.reply {
                debug!("dropping reply from 0x{:X}", reply.id);
                continue;
            }
            if is_response_pending(&reply.data, sid, pci_offset) {
                debug!("dropping transient response-pending frame");
                continue;
            }
            source = reply.id;
            concatenated.extend_from_slice(&reply.data);
        }
        if concatenated.is_empty() {
            return Err(TransportError::NoResponse);
        }
        let decoded = self.decoder.decode(&concatenated)?;
        if decoded.len() >= 3
            && decoded[0] == NEGATIVE_RESPONSE_SID
            && decoded[1] == sid
            && decoded[2] != RESPONSE_PENDING
        {
            return Err(TransportError::UdsNegativeResponse(decoded[2].into()));
        }
        Ok(Message::with_reply(source, request.id, decoded))
    }
}

fn is_response_pending(data: &[u8], sid: u8, pci_offset: usize) -> bool {
    if data.len() < pci_offset + 3 {
        return false;
    }
    if pci_offset == 1 && data[0] != 0x03 {
        return false;
    }
    data[pci_offset] == NEGATIVE_RESPONSE_SID
        && data[pci_offset + 1] == sid
        && data[pci_offset + 2] == RESPONSE_PENDING
}
