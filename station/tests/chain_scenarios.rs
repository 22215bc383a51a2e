//! End-to-end protocol scenarios: the full station stack (Reader, table,
//! sink, store) driven against a virtual chain of simulated nodes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chain_sim::{NodeConfig, VirtualChain};
use chain_types::{err, ChainLink, Command, Packet, BLOCK_LEN};
use serde_json::json;
use sram_station::config::Deadlines;
use sram_station::reader::{Op, Reader};
use sram_station::sink::{EventRecord, EventSink, Level, LevelWindow, Output};
use sram_station::store::MemoryStore;

type TestReader = Reader<VirtualChain, MemoryStore>;
type Events = Arc<Mutex<Vec<EventRecord>>>;

fn harness(chain: VirtualChain) -> (TestReader, Arc<MemoryStore>, Events) {
    let (output, events) = Output::buffer(LevelWindow::from(Level::Debug));
    let store = Arc::new(MemoryStore::default());
    let reader = Reader::new(
        "station/chain-a",
        "nucleo-f446re",
        "virtual",
        chain,
        store.clone(),
        EventSink::new(vec![output]),
        Deadlines::default(),
    );
    (reader, store, events)
}

async fn ping(reader: &mut TestReader) -> serde_json::Value {
    reader
        .handle(Op::Ping, &json!({ "command": "ping" }))
        .await
        .expect("discovery must succeed")
}

fn warnings(events: &Events) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.level == Level::Warning)
        .map(|e| e.message.clone())
        .collect()
}

// ── Scenario 1: single-device ping ────────────────────────────────────────────

#[tokio::test]
async fn single_device_ping() {
    let uid = "A".repeat(25);
    let chain = VirtualChain::new(vec![NodeConfig::basic(&uid, 16384)]);
    let (mut reader, _, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();

    let response = ping(&mut reader).await;

    let devices = response["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["uid"], uid.as_str());
    assert_eq!(devices[0]["pic"], 1);
    assert_eq!(devices[0]["sram_size"], 16384);
    let record = reader.table().get(&uid).unwrap();
    assert_eq!((record.pic, record.sram_size), (1, 16384));
}

// ── Scenario 2: three-device broadcast discovery ──────────────────────────────

#[tokio::test]
async fn three_device_ping_orders_by_position() {
    let chain = VirtualChain::new(
        ["X", "Y", "Z"]
            .iter()
            .map(|uid| NodeConfig::basic(uid, 4 * BLOCK_LEN))
            .collect(),
    );
    let (mut reader, _, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();

    let response = ping(&mut reader).await;

    let devices = response["devices"].as_array().unwrap();
    let order: Vec<(&str, u64)> = devices
        .iter()
        .map(|d| (d["uid"].as_str().unwrap(), d["pic"].as_u64().unwrap()))
        .collect();
    assert_eq!(order, [("X", 1), ("Y", 2), ("Z", 3)]);
    assert!(reader.table().is_consistent());
}

// ── Scenario 3: CRC mismatch on the way downstream ────────────────────────────

#[tokio::test]
async fn corrupt_request_answers_err_from_the_head() {
    let chain = VirtualChain::new(
        ["X", "Y", "Z"]
            .iter()
            .map(|uid| NodeConfig::basic(uid, 4 * BLOCK_LEN))
            .collect(),
    );
    let (mut reader, _, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();

    let mut request = Packet::new(Command::Read);
    request.set_uid("Y").unwrap();
    request.set_options(0);
    request.finalize();
    let mut bytes = request.encode().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF; // flip a checksum byte

    reader.link_mut().inject_raw(&bytes);
    let response = reader
        .link_mut()
        .receive(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(response.command(), Some(Command::Err));
    assert_eq!(response.options(), err::CHECKSUM_MISMATCH);
    assert_eq!(response.pic(), 1, "the head node reports the corruption");
    assert!(response.verify());
}

#[tokio::test]
async fn corrupt_responses_are_warned_and_skipped() {
    let chain = VirtualChain::uniform("NODE", 2, 2 * BLOCK_LEN);
    let (mut reader, store, events) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    reader.link_mut().faults_mut().corrupt_from = Some("NODE-1".into());
    let response = reader
        .handle(Op::Read, &json!({ "command": "read" }))
        .await
        .unwrap();

    // NODE-1's blocks are all corrupted; NODE-2's land.
    assert_eq!(response["samples"], 2);
    assert!(store.samples().iter().all(|s| s.uid == "NODE-2"));
    let warned = warnings(&events);
    assert_eq!(warned.len(), 2);
    assert!(warned
        .iter()
        .all(|m| m == "Packet from device NODE-1 is corrupted"));
}

// ── Scenario 4: full memory dump ──────────────────────────────────────────────

#[tokio::test]
async fn full_dump_yields_every_block_once() {
    let mut chain = VirtualChain::new(vec![NodeConfig::basic("X", 4096)]);
    let mut image = vec![0u8; 4096];
    for (i, block) in image.chunks_mut(BLOCK_LEN).enumerate() {
        block.fill(i as u8);
    }
    chain.node_mut(0).set_sram(&image);

    let (mut reader, store, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    let response = reader
        .handle(Op::Read, &json!({ "command": "read" }))
        .await
        .unwrap();
    assert_eq!(response["samples"], 4);

    let mut samples = store.samples();
    samples.sort_by_key(|s| s.block_offset);
    let offsets: Vec<u32> = samples.iter().map(|s| s.block_offset).collect();
    assert_eq!(offsets, [0, 1, 2, 3]);
    for sample in &samples {
        assert_eq!(sample.uid, "X");
        assert_eq!(sample.board_kind, "nucleo-f446re");
        assert_eq!(sample.pic, 1);
        assert!(sample
            .payload
            .iter()
            .all(|&b| b == sample.block_offset as u8));
    }
}

// ── Scenario 5: write / read round-trip ───────────────────────────────────────

#[tokio::test]
async fn write_then_read_returns_what_was_written() {
    let chain = VirtualChain::new(vec![NodeConfig::basic("X", 4096)]);
    let (mut reader, store, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    let block: Vec<u8> = [0xDE, 0xAD]
        .iter()
        .cycle()
        .copied()
        .take(BLOCK_LEN)
        .collect();
    let data: Vec<u32> = block.iter().map(|&b| b as u32).collect();
    reader
        .handle(
            Op::Write,
            &json!({ "command": "write", "device": "X", "offset": 2, "data": data }),
        )
        .await
        .unwrap();

    reader
        .handle(Op::Read, &json!({ "command": "read" }))
        .await
        .unwrap();
    let sample = store
        .samples()
        .into_iter()
        .find(|s| s.block_offset == 2)
        .unwrap();
    assert_eq!(sample.payload, block);
}

// ── Scenario 6: write-invert needs a reference dump ───────────────────────────

#[tokio::test]
async fn write_invert_without_reference_emits_warnings_and_no_writes() {
    let chain = VirtualChain::uniform("NODE", 3, 2 * BLOCK_LEN);
    let (mut reader, _, events) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    let response = reader
        .handle(Op::WriteInvert, &json!({ "command": "write_invert" }))
        .await
        .unwrap();
    assert_eq!(response["blocks"], 0);

    // Even table positions: NODE-1 and NODE-3.
    let warned = warnings(&events);
    assert_eq!(
        warned,
        vec![
            "At least one full memory sample has to be read from device NODE-1",
            "At least one full memory sample has to be read from device NODE-3",
        ]
    );
    let writes = reader
        .link()
        .injected_commands()
        .iter()
        .filter(|&&c| c == Command::Write as u8)
        .count();
    assert_eq!(writes, 0, "no WRITE may reach the wire without a reference");
}

#[tokio::test]
async fn write_invert_inverts_the_reference_dump() {
    let chain = VirtualChain::new(vec![NodeConfig::basic("X", 2 * BLOCK_LEN)]);
    let (mut reader, _, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    // Reference dump first, then the inverted write-back.
    reader
        .handle(Op::Read, &json!({ "command": "read" }))
        .await
        .unwrap();
    let reference = reader.link().node(0).sram().to_vec();

    let response = reader
        .handle(Op::WriteInvert, &json!({ "command": "write_invert" }))
        .await
        .unwrap();
    assert_eq!(response["blocks"], 2);
    assert_eq!(response["devices"][0], "X");

    let inverted: Vec<u8> = reference.iter().map(|b| !b).collect();
    assert_eq!(reader.link().node(0).sram(), &inverted[..]);
}

// ── Interpreter surface end to end ────────────────────────────────────────────

#[tokio::test]
async fn load_exec_retrieve_roundtrip() {
    let chain = VirtualChain::uniform("NODE", 2, 2 * BLOCK_LEN);
    let (mut reader, _, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    reader
        .handle(
            Op::Load,
            &json!({ "command": "load", "device": "NODE-2", "source": "6 7 * 2 3 +" }),
        )
        .await
        .unwrap();
    let exec = reader
        .handle(
            Op::Exec,
            &json!({ "command": "exec", "device": "NODE-2", "reset": true }),
        )
        .await
        .unwrap();
    assert_eq!(exec["code"], 0);

    let retrieved = reader
        .handle(Op::Retr, &json!({ "command": "retr", "device": "NODE-2" }))
        .await
        .unwrap();
    assert_eq!(retrieved["text"], "42\n5\n");
    assert_eq!(
        retrieved["integers"].as_array().unwrap(),
        &vec![json!(42), json!(5)]
    );
}

// ── Sensor sweep ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn sensors_sweep_persists_one_reading_per_device() {
    let chain = VirtualChain::uniform("NODE", 2, 2 * BLOCK_LEN);
    let expected = NodeConfig::basic("NODE-1", 2 * BLOCK_LEN).sensors;
    let (mut reader, store, _) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    let response = reader
        .handle(Op::Sensors, &json!({ "command": "sensors" }))
        .await
        .unwrap();
    assert_eq!(response["readings"].as_array().unwrap().len(), 2);

    let readings = store.sensors();
    assert_eq!(readings.len(), 2);
    let first = readings.iter().find(|r| r.uid == "NODE-1").unwrap();
    assert_eq!(first.board_kind, "nucleo-f446re");
    assert_eq!(first.temperature_raw, expected.temperature_raw);
    assert_eq!(first.voltage_raw, expected.voltage_raw);
    assert_eq!(first.temp30_cal, expected.temp30_cal);
    assert_eq!(first.temp110_cal, expected.temp110_cal);
    assert_eq!(first.vdd_cal, expected.vdd_cal);
}

// ── Timeout path: a device that stops answering ───────────────────────────────

#[tokio::test]
async fn dropped_device_aborts_with_an_error_event() {
    let chain = VirtualChain::uniform("NODE", 2, 2 * BLOCK_LEN);
    let (mut reader, store, events) = harness(chain);
    reader.link_mut().power_on().await.unwrap();
    ping(&mut reader).await;

    reader.link_mut().faults_mut().drop_from = Some("NODE-1".into());
    let response = reader
        .handle(Op::Read, &json!({ "command": "read" }))
        .await
        .unwrap();

    assert_eq!(response["samples"], 2);
    assert!(store.samples().iter().all(|s| s.uid == "NODE-2"));
    let errors: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.level == Level::Error)
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(
        errors,
        vec!["Timed out waiting for a response from device NODE-1"]
    );
}
