//! In-process ELM327/STN emulator for testing the transport without hardware.
//!
//! [SimulatedElm] speaks the wire grammar of [crate::elm327::commands] over a
//! pair of in-memory byte streams which plug straight into
//! [crate::stream::StreamCommandQueue]. Adapter state (echo, headers,
//! protocol, segmentation) is emulated faithfully enough to drive the full
//! init and configuration sequences; what the "vehicle" answers to data lines
//! is supplied by a responder callback.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus_protocol::BusProtocol;
use crate::message::{Message, format_header};

/// Produces the wire level reply messages of the emulated vehicle for the raw
/// bytes the adapter put on the bus. Each reply message is rendered as one
/// response line (header + hex payload)
pub type EcuResponder = Box<dyn FnMut(&[u8]) -> Vec<Message> + Send>;

/// Which adapter IC the emulator pretends to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimIc {
    /// Plain ELM327 v1.5
    Elm327,
    /// ScanTool STN1110
    Stn1110,
    /// ScanTool STN2230
    Stn2230,
    /// UniCarScan (WGSoft.de)
    UniCarScan,
}

struct SimState {
    ic: SimIc,
    vehicle_protocol: BusProtocol,
    echo: bool,
    linefeeds: bool,
    headers: bool,
    spaces: bool,
    adaptive_timing: bool,
    can_auto_format: bool,
    timeout: u8,
    tx_segmentation: bool,
    rx_segmentation: bool,
    protocol: BusProtocol,
    auto_detected: bool,
    header: String,
    arbitration: String,
    pending_stpx: Option<usize>,
    responder: Option<EcuResponder>,
    voltage: f32,
    line: Vec<u8>,
    to_host: VecDeque<u8>,
}

impl SimState {
    fn power_on(ic: SimIc, vehicle_protocol: BusProtocol) -> Self {
        Self {
            ic,
            vehicle_protocol,
            echo: true,
            linefeeds: true,
            headers: false,
            spaces: true,
            adaptive_timing: true,
            can_auto_format: true,
            timeout: 0x32,
            tx_segmentation: false,
            rx_segmentation: false,
            protocol: BusProtocol::Auto,
            auto_detected: false,
            header: String::new(),
            arbitration: String::new(),
            pending_stpx: None,
            responder: None,
            voltage: 12.6,
            line: Vec::new(),
            to_host: VecDeque::new(),
        }
    }

    fn is_stn(&self) -> bool {
        matches!(self.ic, SimIc::Stn1110 | SimIc::Stn2230)
    }

    fn ident(&self) -> &'static str {
        match self.ic {
            SimIc::Elm327 | SimIc::UniCarScan => "ELM327 v1.5",
            SimIc::Stn1110 | SimIc::Stn2230 => "ELM327 v1.4b",
        }
    }

    fn reply(&mut self, text: &str) {
        for line in text.split('\r') {
            self.to_host.extend(line.bytes());
            self.to_host.push_back(b'\r');
            if self.linefeeds {
                self.to_host.push_back(b'\n');
            }
        }
        self.to_host.push_back(b'\r');
        self.to_host.push_back(b'>');
    }

    fn on_byte(&mut self, byte: u8) {
        if byte != b'\r' {
            self.line.push(byte);
            return;
        }
        let line: String = String::from_utf8_lossy(&self.line.split_off(0)).to_string();
        if self.echo {
            self.to_host.extend(line.bytes());
            self.to_host.push_back(b'\r');
        }
        self.on_line(line.trim().to_ascii_uppercase());
    }

    fn on_line(&mut self, line: String) {
        if let Some(length) = self.pending_stpx.take() {
            match decode_hex(&line) {
                Some(payload) if payload.len() == length => self.dispatch_to_bus(payload),
                _ => self.reply("?"),
            }
            return;
        }
        if line.is_empty() {
            self.reply("?");
            return;
        }
        if let Some(rest) = line.strip_prefix("AT") {
            self.on_at(rest);
            return;
        }
        if let Some(rest) = line.strip_prefix("ST") {
            if self.is_stn() {
                self.on_st(rest);
            } else {
                self.reply("?");
            }
            return;
        }
        // Everything else must be a hex data line, optionally carrying a
        // trailing expected-reply-count nibble
        let hex = if line.len() % 2 == 1 {
            &line[..line.len() - 1]
        } else {
            line.as_str()
        };
        match decode_hex(hex) {
            // The ELM line parser takes at most 8 data bytes; only ICs with
            // on-chip segmentation accept more
            Some(payload)
                if payload.len() > 8
                    && !self.tx_segmentation
                    && self.ic != SimIc::UniCarScan =>
            {
                self.reply("?")
            }
            Some(payload) => self.dispatch_to_bus(payload),
            None => self.reply("?"),
        }
    }

    fn on_at(&mut self, cmd: &str) {
        match cmd {
            "Z" => {
                let ident = self.ident();
                let vehicle = self.vehicle_protocol;
                let responder = self.responder.take();
                let voltage = self.voltage;
                *self = SimState::power_on(self.ic, vehicle);
                self.responder = responder;
                self.voltage = voltage;
                self.reply(ident);
            }
            "I" => self.reply(self.ident()),
            "@1" => self.reply("OBDII to RS232 Interpreter"),
            "#1" => {
                if self.ic == SimIc::UniCarScan {
                    self.reply("UniCarScan UCSI-2100 by WGSoft.de")
                } else {
                    self.reply("?")
                }
            }
            "RV" => {
                let text = format!("{:.1}V", self.voltage);
                self.reply(&text);
            }
            "DPN" => {
                let digit = self.protocol.number().unwrap_or('0');
                let text = if self.auto_detected {
                    format!("A{digit}")
                } else {
                    format!("{digit}")
                };
                self.reply(&text);
            }
            "E0" => self.set_flag(|s, v| s.echo = v, false),
            "E1" => self.set_flag(|s, v| s.echo = v, true),
            "L0" => self.set_flag(|s, v| s.linefeeds = v, false),
            "L1" => self.set_flag(|s, v| s.linefeeds = v, true),
            "H0" => self.set_flag(|s, v| s.headers = v, false),
            "H1" => self.set_flag(|s, v| s.headers = v, true),
            "S0" => self.set_flag(|s, v| s.spaces = v, false),
            "S1" => self.set_flag(|s, v| s.spaces = v, true),
            "AT0" => self.set_flag(|s, v| s.adaptive_timing = v, false),
            "AT1" => self.set_flag(|s, v| s.adaptive_timing = v, true),
            "CAF0" => self.set_flag(|s, v| s.can_auto_format = v, false),
            "CAF1" => self.set_flag(|s, v| s.can_auto_format = v, true),
            _ => {
                if let Some(header) = cmd.strip_prefix("SH") {
                    self.header = header.to_string();
                    self.reply("OK");
                } else if let Some(arbitration) = cmd.strip_prefix("CRA") {
                    self.arbitration = arbitration.to_string();
                    self.reply("OK");
                } else if let Some(digit) = cmd.strip_prefix("SP").or(cmd.strip_prefix("TP")) {
                    self.select_protocol(digit);
                } else if let Some(value) = cmd.strip_prefix("ST") {
                    match u8::from_str_radix(value, 16) {
                        Ok(v) => {
                            self.timeout = v;
                            self.reply("OK");
                        }
                        Err(_) => self.reply("?"),
                    }
                } else {
                    self.reply("?");
                }
            }
        }
    }

    fn on_st(&mut self, cmd: &str) {
        match cmd {
            "I" => match self.ic {
                SimIc::Stn1110 => self.reply("STN1110 v4.2.0"),
                SimIc::Stn2230 => self.reply("STN2230 v5.1.1"),
                _ => self.reply("?"),
            },
            "SN" => self.reply("110012345678"),
            "CSEGT0" => self.set_flag(|s, v| s.tx_segmentation = v, false),
            "CSEGT1" => self.set_flag(|s, v| s.tx_segmentation = v, true),
            "CSEGR0" => self.set_flag(|s, v| s.rx_segmentation = v, false),
            "CSEGR1" => self.set_flag(|s, v| s.rx_segmentation = v, true),
            _ => {
                if let Some(args) = cmd.strip_prefix("PX") {
                    match parse_stpx_length(args) {
                        Some(length) => {
                            self.pending_stpx = Some(length);
                            self.reply("DATA");
                        }
                        None => self.reply("?"),
                    }
                } else {
                    self.reply("?");
                }
            }
        }
    }

    fn set_flag(&mut self, set: fn(&mut Self, bool), value: bool) {
        set(self, value);
        self.reply("OK");
    }

    fn select_protocol(&mut self, digit: &str) {
        match u8::from_str_radix(digit, 16).ok().and_then(BusProtocol::from_repr) {
            Some(BusProtocol::Auto) => {
                self.protocol = self.vehicle_protocol;
                self.auto_detected = true;
                self.reply("OK");
            }
            Some(protocol) => {
                self.protocol = protocol;
                self.auto_detected = false;
                self.reply("OK");
            }
            None => self.reply("?"),
        }
    }

    fn dispatch_to_bus(&mut self, payload: Vec<u8>) {
        if self.protocol != self.vehicle_protocol {
            self.reply("UNABLE TO CONNECT");
            return;
        }
        let Some(responder) = self.responder.as_mut() else {
            self.reply("NO DATA");
            return;
        };
        let replies = responder(&payload);
        if replies.is_empty() {
            self.reply("NO DATA");
            return;
        }
        let mut lines = Vec::with_capacity(replies.len());
        for message in replies {
            let mut line = String::new();
            if self.headers {
                line.push_str(&format_header(message.id));
                if self.spaces {
                    line.push(' ');
                }
            }
            for (i, byte) in message.data.iter().enumerate() {
                if self.spaces && i != 0 {
                    line.push(' ');
                }
                line.push_str(&format!("{byte:02X}"));
            }
            lines.push(line);
        }
        self.reply(&lines.join("\r"));
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() || text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

// "STPX h:7E0, r:1, l:62" style argument list; only the length matters here
fn parse_stpx_length(args: &str) -> Option<usize> {
    args.split(',')
        .map(|part| part.trim())
        .find_map(|part| part.strip_prefix("L:"))
        .and_then(|value| value.trim().parse().ok())
}

/// An emulated ELM327 class adapter plus the vehicle behind it
pub struct SimulatedElm {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedElm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimulatedElm({:?})", self.state.lock().unwrap().ic)
    }
}

impl SimulatedElm {
    /// Creates an emulator for the given IC sitting on a vehicle bus speaking
    /// `vehicle_protocol`
    pub fn new(ic: SimIc, vehicle_protocol: BusProtocol) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::power_on(ic, vehicle_protocol))),
        }
    }

    /// Installs the vehicle side responder
    pub fn set_responder<F: FnMut(&[u8]) -> Vec<Message> + Send + 'static>(&self, responder: F) {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Queues raw bytes toward the host outside any command exchange
    pub fn inject_unsolicited(&self, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .to_host
            .extend(bytes.iter().copied());
    }

    /// Stream pair to hand to [crate::stream::StreamCommandQueue::new]
    pub fn streams(&self) -> (SimStreamReader, SimStreamWriter) {
        (
            SimStreamReader {
                state: self.state.clone(),
            },
            SimStreamWriter {
                state: self.state.clone(),
            },
        )
    }
}

/// Host side read half of the emulated serial link
#[derive(Debug)]
pub struct SimStreamReader {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimState({:?}, {:?})", self.ic, self.protocol)
    }
}

impl Read for SimStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.to_host.is_empty() {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match state.to_host.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Host side write half of the emulated serial link
#[derive(Debug)]
pub struct SimStreamWriter {
    state: Arc<Mutex<SimState>>,
}

impl Write for SimStreamWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        for byte in buf {
            state.on_byte(*byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::{QueueSettings, StreamCommandQueue};

    fn queue_for(sim: &SimulatedElm) -> StreamCommandQueue {
        let (reader, writer) = sim.streams();
        StreamCommandQueue::new(reader, writer, QueueSettings::default())
    }

    #[test]
    fn identifies_and_acknowledges() {
        let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
        let queue = queue_for(&sim);
        let t = Duration::from_secs(1);
        // Echo is on after power-up, the reply still contains the payload
        assert!(queue.send("ATE0", t).unwrap().contains("OK"));
        assert_eq!(queue.send("ATI", t).unwrap(), "ELM327 v1.5");
        assert_eq!(queue.send("STI", t).unwrap(), "?");
        assert!(queue.send("ATZ", t).unwrap().contains("ELM327 v1.5"));
    }

    #[test]
    fn protocol_selection_and_dpn() {
        let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
        let queue = queue_for(&sim);
        let t = Duration::from_secs(1);
        queue.send("ATE0", t).unwrap();
        assert!(queue.send("ATSP0", t).unwrap().contains("OK"));
        assert_eq!(queue.send("ATDPN", t).unwrap(), "A6");
        assert!(queue.send("ATSP6", t).unwrap().contains("OK"));
        assert_eq!(queue.send("ATDPN", t).unwrap(), "6");
    }

    #[test]
    fn data_lines_reach_the_responder() {
        let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
        sim.set_responder(|payload| {
            assert_eq!(payload, [0x09, 0x02]);
            vec![Message::new(0x7E8, vec![0x06, 0x49, 0x02, 0x01, 0x31, 0x32, 0x33])]
        });
        let queue = queue_for(&sim);
        let t = Duration::from_secs(1);
        queue.send("ATE0", t).unwrap();
        queue.send("ATS0", t).unwrap();
        queue.send("ATH1", t).unwrap();
        queue.send("ATSP6", t).unwrap();
        assert_eq!(queue.send("0902", t).unwrap(), "7E806490201313233");
    }

    #[test]
    fn wrong_protocol_cannot_connect() {
        let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Iso9141);
        sim.set_responder(|_| vec![Message::new(0x10, vec![0x41, 0x00])]);
        let queue = queue_for(&sim);
        let t = Duration::from_secs(1);
        queue.send("ATE0", t).unwrap();
        queue.send("ATSP6", t).unwrap();
        assert!(queue.send("0100", t).unwrap().contains("UNABLE TO CONNECT"));
    }

    #[test]
    fn stn_segmentation_and_stpx() {
        let sim = SimulatedElm::new(SimIc::Stn1110, BusProtocol::Can11b500k);
        sim.set_responder(|payload| {
            assert_eq!(payload.len(), 10);
            vec![Message::new(0x7E8, vec![0x6E, 0xF1, 0x90])]
        });
        let queue = queue_for(&sim);
        let t = Duration::from_secs(1);
        queue.send("ATE0", t).unwrap();
        queue.send("ATS0", t).unwrap();
        queue.send("ATH1", t).unwrap();
        queue.send("ATSP6", t).unwrap();
        assert_eq!(queue.send("STI", t).unwrap(), "STN1110 v4.2.0");
        assert!(queue.send("STCSEGT1", t).unwrap().contains("OK"));
        assert_eq!(
            queue.send("STPX h:7E0, r:1, l:10", t).unwrap(),
            "DATA"
        );
        assert_eq!(
            queue.send("2EF19031323334353637", t).unwrap(),
            "7E86EF190"
        );
    }

    #[test]
    fn unsolicited_bytes_flow_through() {
        let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
        let queue = queue_for(&sim);
        let (tx, rx) = std::sync::mpsc::channel();
        queue.set_unsolicited_handler(move |bytes| {
            let _ = tx.send(bytes.to_vec());
        });
        std::thread::sleep(Duration::from_millis(20));
        sim.inject_unsolicited(b"ACT ALERT\r");
        let bytes = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(bytes, b"ACT ALERT\r");
    }
}
