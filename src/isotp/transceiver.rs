//! Bidirectional ISO-TP transceiver.
//!
//! [Transceiver] is a pure state machine: it owns no I/O. Callers feed it
//! payloads to send ([Transceiver::write]) and received 8 byte frames
//! ([Transceiver::did_read]); it answers with an [Action] telling the caller
//! what to do next. One instance serves one logical endpoint and is reused
//! across messages; [Transceiver::reset] returns it to idle at any time.

use log::{debug, warn};

use crate::{TransportError, TransportResult};

use super::{FRAME_LENGTH, FlowControlFrame, FlowControlStatus, FrameType, MAXIMUM_PAYLOAD};

/// How the transceiver reacts to protocol violations on the receive side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reset and try to interpret the offending frame as the start of a new
    /// message; if that fails too, swallow the frame
    Defensive,
    /// Surface a [TransportError::ProtocolViolation] and leave state untouched
    Strict,
}

/// Externally visible transceiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No transfer in either direction
    Idle,
    /// A segmented send is waiting for flow control from the peer
    Sending,
    /// A segmented receive is collecting consecutive frames
    Receiving,
}

/// What the caller must do after feeding the transceiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A complete inbound payload is ready
    Process(Vec<u8>),
    /// Transmit these frames, pacing consecutive frames by `separation_time`
    /// milliseconds (ISO encoding, as requested by the peer)
    WriteFrames {
        /// Frame data fields to transmit, in order. Short frames may be
        /// padded to 8 bytes before hitting the wire
        frames: Vec<Vec<u8>>,
        /// Pause between consecutive frames requested by the peer
        separation_time: u8,
        /// True iff this logical send emits no further frames
        last_batch: bool,
    },
    /// Nothing to do yet
    WaitForMore,
}

/// Bidirectional ISO-TP segmentation state machine.
///
/// Flow control parameters configured here are the *local* ones, announced to
/// the peer when receiving. Both default to zero: send everything without
/// pause and without block ACKs.
#[derive(Debug)]
pub struct Transceiver {
    behavior: Behavior,
    block_size: u8,
    separation_time: u8,
    state: State,
    tx_pending: Vec<u8>,
    tx_sequence: u8,
    rx_buffer: Vec<u8>,
    rx_remaining: usize,
    rx_fc_counter: u8,
    rx_expected_sequence: u8,
}

impl Transceiver {
    /// Creates a transceiver with default local flow control (block size 0,
    /// separation time 0)
    pub fn new(behavior: Behavior) -> Self {
        Self::with_flow_control(behavior, 0, 0)
    }

    /// Creates a transceiver announcing the given block size and separation
    /// time to sending peers
    pub fn with_flow_control(behavior: Behavior, block_size: u8, separation_time: u8) -> Self {
        Self {
            behavior,
            block_size,
            separation_time,
            state: State::Idle,
            tx_pending: Vec::new(),
            tx_sequence: 0,
            rx_buffer: Vec::new(),
            rx_remaining: 0,
            rx_fc_counter: 0,
            rx_expected_sequence: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns to idle and clears both directions
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.tx_pending.clear();
        self.tx_sequence = 0;
        self.rx_buffer.clear();
        self.rx_remaining = 0;
        self.rx_fc_counter = 0;
        self.rx_expected_sequence = 0;
    }

    /// Initiates a send.
    ///
    /// Payloads of up to 7 bytes go out as one single frame and the
    /// transceiver stays idle. Longer payloads emit the first frame only and
    /// transition to [State::Sending]; consecutive frames follow once the
    /// peer's flow control arrives via [Transceiver::did_read].
    pub fn write(&mut self, payload: &[u8]) -> TransportResult<Action> {
        if self.state != State::Idle {
            return Err(TransportError::ProtocolViolation(format!(
                "write while {:?}",
                self.state
            )));
        }
        if payload.is_empty() {
            return Err(TransportError::MessageTooSmall);
        }
        if payload.len() > MAXIMUM_PAYLOAD {
            return Err(TransportError::MessageTooBig);
        }
        if payload.len() <= 7 {
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.push(payload.len() as u8);
            frame.extend_from_slice(payload);
            return Ok(Action::WriteFrames {
                frames: vec![frame],
                separation_time: 0,
                last_batch: true,
            });
        }
        let mut first = Vec::with_capacity(FRAME_LENGTH);
        first.push(FrameType::First as u8 | (payload.len() >> 8) as u8);
        first.push(payload.len() as u8);
        first.extend_from_slice(&payload[..6]);
        self.tx_pending = payload[6..].to_vec();
        self.tx_sequence = 1;
        self.state = State::Sending;
        debug!(
            "FF out, {} bytes total, {} pending",
            payload.len(),
            self.tx_pending.len()
        );
        Ok(Action::WriteFrames {
            frames: vec![first],
            separation_time: 0,
            last_batch: false,
        })
    }

    /// Ingests one received 8 byte frame.
    ///
    /// A frame of any other length is a protocol violation in both behavior
    /// modes. All other violations follow the configured [Behavior].
    pub fn did_read(&mut self, frame: &[u8]) -> TransportResult<Action> {
        if frame.len() != FRAME_LENGTH {
            return Err(TransportError::ProtocolViolation(format!(
                "frame length {} (want {})",
                frame.len(),
                FRAME_LENGTH
            )));
        }
        match self.dispatch(frame) {
            Ok(action) => Ok(action),
            Err(violation) if self.behavior == Behavior::Defensive => {
                warn!("recovering from {violation}, re-reading frame as a new message");
                self.reset();
                match self.dispatch(frame) {
                    Ok(action) => Ok(action),
                    Err(_) => {
                        self.reset();
                        Ok(Action::WaitForMore)
                    }
                }
            }
            Err(violation) => Err(violation),
        }
    }

    // Single dispatch step. Must not mutate state before a possible error
    // return, strict mode promises untouched state after a violation.
    fn dispatch(&mut self, frame: &[u8]) -> TransportResult<Action> {
        if self.state == State::Sending {
            return self.on_flow_control(frame);
        }
        match FrameType::from_pci(frame[0]) {
            Some(FrameType::Single) => self.on_single_frame(frame),
            Some(FrameType::First) => self.on_first_frame(frame),
            Some(FrameType::Consecutive) => self.on_consecutive_frame(frame),
            Some(FrameType::FlowControl) => Err(TransportError::ProtocolViolation(format!(
                "flow control frame while {:?}",
                self.state
            ))),
            None => Err(TransportError::ProtocolViolation(format!(
                "unknown PCI 0x{:02X}",
                frame[0]
            ))),
        }
    }

    fn on_flow_control(&mut self, frame: &[u8]) -> TransportResult<Action> {
        let fc = FlowControlFrame::parse(frame)?;
        match fc.status {
            FlowControlStatus::Wait => {
                debug!("peer requested wait, holding {} bytes", self.tx_pending.len());
                Ok(Action::WaitForMore)
            }
            FlowControlStatus::Overflow => Err(TransportError::ProtocolViolation(
                "peer reported flow control overflow".into(),
            )),
            FlowControlStatus::ClearToSend => {
                let mut frames = Vec::new();
                let mut last_batch = false;
                loop {
                    let take = self.tx_pending.len().min(7);
                    let mut cf = Vec::with_capacity(take + 1);
                    cf.push(FrameType::Consecutive as u8 | (self.tx_sequence & 0x0F));
                    cf.extend(self.tx_pending.drain(..take));
                    self.tx_sequence = (self.tx_sequence + 1) & 0x0F;
                    frames.push(cf);
                    if self.tx_pending.is_empty() {
                        last_batch = true;
                        break;
                    }
                    if fc.block_size != 0 && frames.len() == fc.block_size as usize {
                        break;
                    }
                }
                debug!(
                    "CTS: sending {} consecutive frames, {} bytes left",
                    frames.len(),
                    self.tx_pending.len()
                );
                if last_batch {
                    self.reset();
                }
                Ok(Action::WriteFrames {
                    frames,
                    separation_time: fc.separation_time,
                    last_batch,
                })
            }
        }
    }

    fn on_single_frame(&mut self, frame: &[u8]) -> TransportResult<Action> {
        if self.state != State::Idle {
            return Err(TransportError::ProtocolViolation(
                "single frame while receiving".into(),
            ));
        }
        let dl = (frame[0] & 0x0F) as usize;
        if !(1..=7).contains(&dl) {
            return Err(TransportError::ProtocolViolation(format!(
                "single frame data length {dl}"
            )));
        }
        Ok(Action::Process(frame[1..=dl].to_vec()))
    }

    fn on_first_frame(&mut self, frame: &[u8]) -> TransportResult<Action> {
        if self.state != State::Idle {
            return Err(TransportError::ProtocolViolation(
                "first frame while receiving".into(),
            ));
        }
        let announced = (((frame[0] & 0x0F) as usize) << 8) | frame[1] as usize;
        if announced <= 7 {
            return Err(TransportError::ProtocolViolation(format!(
                "first frame announces {announced} bytes"
            )));
        }
        self.rx_buffer.clear();
        self.rx_buffer.extend_from_slice(&frame[2..FRAME_LENGTH]);
        self.rx_remaining = announced - 6;
        self.rx_fc_counter = self.block_size;
        self.rx_expected_sequence = 1;
        self.state = State::Receiving;
        debug!("FF in, expecting {announced} bytes, sending FC");
        Ok(Action::WriteFrames {
            frames: vec![self.local_flow_control().to_bytes()],
            separation_time: 0,
            last_batch: false,
        })
    }

    fn on_consecutive_frame(&mut self, frame: &[u8]) -> TransportResult<Action> {
        if self.state != State::Receiving {
            return Err(TransportError::ProtocolViolation(
                "consecutive frame while idle".into(),
            ));
        }
        let sequence = frame[0] & 0x0F;
        if sequence != self.rx_expected_sequence {
            return Err(TransportError::ProtocolViolation(format!(
                "sequence number {sequence} (want {})",
                self.rx_expected_sequence
            )));
        }
        let take = self.rx_remaining.min(7);
        self.rx_buffer.extend_from_slice(&frame[1..1 + take]);
        self.rx_remaining = self.rx_remaining.saturating_sub(7);
        self.rx_expected_sequence = (self.rx_expected_sequence + 1) & 0x0F;
        if self.rx_remaining == 0 {
            let payload = std::mem::take(&mut self.rx_buffer);
            self.reset();
            return Ok(Action::Process(payload));
        }
        if self.block_size == 0 {
            return Ok(Action::WaitForMore);
        }
        self.rx_fc_counter -= 1;
        if self.rx_fc_counter == 0 {
            self.rx_fc_counter = self.block_size;
            debug!("block complete, sending FC, {} bytes outstanding", self.rx_remaining);
            return Ok(Action::WriteFrames {
                frames: vec![self.local_flow_control().to_bytes()],
                separation_time: 0,
                last_batch: false,
            });
        }
        Ok(Action::WaitForMore)
    }

    fn local_flow_control(&self) -> FlowControlFrame {
        FlowControlFrame::new(self.block_size, self.separation_time)
    }
}
