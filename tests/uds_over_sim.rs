//! End to end tests driving the full stack (pipeline -> driver -> command
//! queue) against the in-process ELM327 emulator.

use std::sync::{Arc, Mutex, mpsc};

use uds_transport::TransportError;
use uds_transport::bus_protocol::BusProtocol;
use uds_transport::elm327::{AdapterState, Elm327, IcFamily, Segmentation};
use uds_transport::isotp::framer;
use uds_transport::message::Message;
use uds_transport::simulation::{SimIc, SimulatedElm};
use uds_transport::stream::{QueueSettings, StreamCommandQueue};
use uds_transport::uds::pipeline::UdsPipeline;

fn driver_for(sim: &SimulatedElm) -> Elm327 {
    let (reader, writer) = sim.streams();
    Elm327::new(StreamCommandQueue::new(
        reader,
        writer,
        QueueSettings::default(),
    ))
}

// Raw frame messages an adapter without on-chip reassembly reports for one
// segmented ISO-TP reply
fn can_frames(id: u32, payload: &[u8]) -> Vec<Message> {
    let encoded = framer::encode(payload).unwrap();
    encoded
        .chunks(8)
        .map(|chunk| Message::new(id, chunk.to_vec()))
        .collect()
}

#[test]
fn read_vin_over_emulated_can() {
    env_logger::try_init().ok();
    let vin: Vec<u8> = {
        let mut v = vec![0x49, 0x02, 0x01];
        v.extend_from_slice(b"WDB2030081A123456");
        v
    };
    let expected = vin.clone();
    let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
    sim.set_responder(move |payload| match payload {
        [0x01, 0x00] => vec![Message::new(
            0x7E8,
            vec![0x06, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10],
        )],
        [0x09, 0x02] => can_frames(0x7E8, &vin),
        _ => vec![],
    });

    let mut driver = driver_for(&sim);
    let (state_tx, state_rx) = mpsc::channel();
    driver.set_state_observer(move |state| {
        let _ = state_tx.send(state.clone());
    });
    driver.connect(BusProtocol::Can11b500k).unwrap();
    assert_eq!(driver.info().unwrap().ic, IcFamily::Elm327);

    let pipeline = UdsPipeline::new(driver);
    let reply = pipeline.send(0x7E0, 0x7E8, &[0x09, 0x02]).unwrap();
    assert_eq!(reply.id, 0x7E8);
    assert_eq!(reply.data, expected);

    let states: Vec<AdapterState> = state_rx.try_iter().collect();
    assert!(matches!(states.first(), Some(AdapterState::Searching)));
    assert!(matches!(states.last(), Some(AdapterState::Connected { .. })));

    pipeline.shutdown().unwrap();
}

#[test]
fn long_write_over_emulated_stn() {
    env_logger::try_init().ok();
    let request: Vec<u8> = {
        let mut v = vec![0x2E, 0xF1, 0x90];
        v.extend_from_slice(b"WDB2030081A123456");
        v
    };
    let request_c = request.clone();
    let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let seen_c = seen.clone();

    let sim = SimulatedElm::new(SimIc::Stn2230, BusProtocol::Can29b500k);
    sim.set_responder(move |payload| {
        seen_c.lock().unwrap().push(payload.to_vec());
        match payload {
            [0x01, 0x00] => vec![Message::new(
                0x18DAF110,
                vec![0x06, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10],
            )],
            p if p == request_c.as_slice() => {
                vec![Message::new(0x18DAF110, vec![0x6E, 0xF1, 0x90])]
            }
            _ => vec![],
        }
    });

    let mut driver = driver_for(&sim);
    driver.connect(BusProtocol::Can29b500k).unwrap();
    assert_eq!(driver.info().unwrap().ic, IcFamily::Stn22xx);
    assert_eq!(driver.segmentation(), Segmentation::TX | Segmentation::RX);
    assert_eq!(driver.mtu(), 0xFFF);

    let reply = driver
        .send_uds(&Message::with_reply(0x18DA10F1, 0x18DAF110, request.clone()))
        .unwrap();
    assert_eq!(reply.data, vec![0x6E, 0xF1, 0x90]);
    // The 20 byte request crossed the emulated bus in one piece
    assert!(seen.lock().unwrap().iter().any(|p| *p == request));
}

#[test]
fn iso9141_replies_are_reassembled() {
    env_logger::try_init().ok();
    let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Iso9141);
    sim.set_responder(|payload| match payload {
        [0x01, 0x00] => vec![Message::new(
            0x06B,
            vec![0x41, 0x00, 0x01, 0xBE, 0x1F, 0xB8, 0x10, 0xC3],
        )],
        [0x09, 0x02] => vec![
            Message::new(0x06B, vec![0x49, 0x02, 0x01, 0x00, 0x00, 0x00, 0x31, 0x5A]),
            Message::new(0x06B, vec![0x49, 0x02, 0x02, 0x44, 0x34, 0x47, 0x50, 0x5B]),
        ],
        _ => vec![],
    });

    let mut driver = driver_for(&sim);
    driver.connect(BusProtocol::Iso9141).unwrap();
    assert_eq!(driver.protocol(), BusProtocol::Iso9141);
    assert_eq!(driver.mtu(), 7);

    let reply = driver
        .send_uds(&Message::with_reply(0x068, 0x06B, vec![0x09, 0x02]))
        .unwrap();
    // Header echo + 4 payload bytes per chunk, checksums stripped
    assert_eq!(
        reply.data,
        vec![0x49, 0x02, 0x00, 0x00, 0x00, 0x31, 0x44, 0x34, 0x47, 0x50]
    );
}

#[test]
fn response_pending_is_filtered_end_to_end() {
    env_logger::try_init().ok();
    let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
    sim.set_responder(|payload| match payload {
        [0x01, 0x00] => vec![Message::new(
            0x7E8,
            vec![0x06, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10],
        )],
        [0x31, 0x01, 0xFF, 0x00] => vec![
            Message::new(0x7E8, vec![0x03, 0x7F, 0x31, 0x78, 0xAA, 0xAA, 0xAA, 0xAA]),
            Message::new(0x7E8, vec![0x04, 0x71, 0x01, 0xFF, 0x00, 0xAA, 0xAA, 0xAA]),
        ],
        _ => vec![],
    });

    let mut driver = driver_for(&sim);
    driver.connect(BusProtocol::Can11b500k).unwrap();
    let pipeline = UdsPipeline::new(driver);
    let reply = pipeline.send(0x7E0, 0x7E8, &[0x31, 0x01, 0xFF, 0x00]).unwrap();
    assert_eq!(reply.data, vec![0x71, 0x01, 0xFF, 0x00]);
}

#[test]
fn terminal_negative_response_ends_the_request() {
    env_logger::try_init().ok();
    let sim = SimulatedElm::new(SimIc::Elm327, BusProtocol::Can11b500k);
    sim.set_responder(|payload| match payload {
        [0x01, 0x00] => vec![Message::new(
            0x7E8,
            vec![0x06, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10],
        )],
        [0x10, 0x03] => vec![Message::new(0x7E8, vec![0x03, 0x7F, 0x10, 0x22])],
        _ => vec![],
    });

    let mut driver = driver_for(&sim);
    driver.connect(BusProtocol::Can11b500k).unwrap();
    let pipeline = UdsPipeline::new(driver);
    let err = pipeline.send(0x7E0, 0x7E8, &[0x10, 0x03]).unwrap_err();
    assert!(matches!(err, TransportError::UdsNegativeResponse(nrc)
        if nrc.byte() == 0x22));
}
