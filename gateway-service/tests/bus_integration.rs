//! Cross-module integration test: a fake TCP-bridge "bus" on one end, a real
//! `NikobusEngine` on the other, exercising transport → scheduler → listener
//! → state cache end to end ("switch ON group 1").
//!
//! This needs more than one module's test fixtures (transport framing,
//! scheduler ACK/answer correlation, cache update) so it lives here rather
//! than as a `#[cfg(test)]` unit test.

use std::time::Duration;

use nikobus_gateway::codec::{build_dollar_frame, parse_dollar_frame};
use nikobus_gateway::config::Config;
use nikobus_gateway::transport::Endpoint;
use nikobus_gateway::types::ModuleAddress;
use nikobus_gateway::{EngineEvent, NikobusEngine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const CONFIG_JSON: &str = r#"{
    "modules": [
        {"type": "switch", "address": "4707", "channels": [
            {"description": "Kitchen lights"},
            {"description": "Hallway lights"}
        ]}
    ],
    "engine": { "feedback_module_present": true }
}"#;

/// A minimal stand-in for the real bus: drains the handshake, then answers
/// every `0x15` (write group 1) command with an ACK echo followed by the
/// mirroring state-answer frame.
async fn run_fake_bus(listener: TcpListener) {
    let (stream, _) = listener.accept().await.expect("accept");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Drain the four fixed handshake frames.
    for _ in 0..4 {
        let mut buf = Vec::new();
        reader.read_until(b'\r', &mut buf).await.expect("read handshake frame");
    }

    loop {
        let mut buf = Vec::new();
        let n = reader.read_until(b'\r', &mut buf).await.expect("read command frame");
        if n == 0 {
            return;
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);
        let Ok(frame) = parse_dollar_frame(&line) else { continue };
        if frame.function_code() != Some(0x15) {
            continue;
        }
        let addr_lo = frame.payload[1];
        let addr_hi = frame.payload[2];
        let group_bytes: [u8; 6] = frame.payload[3..9].try_into().unwrap();

        let ack_payload = vec![0x05u8, addr_lo, addr_hi];
        let ack_frame = format!("{}\r", build_dollar_frame(&ack_payload));
        write_half.write_all(ack_frame.as_bytes()).await.expect("write ack");

        let mut answer_payload = vec![addr_lo, addr_hi, 0x00u8];
        answer_payload.extend_from_slice(&group_bytes);
        let answer_frame = format!("{}\r", build_dollar_frame(&answer_payload));
        write_half.write_all(answer_frame.as_bytes()).await.expect("write answer");
    }
}

#[tokio::test]
async fn turn_on_switch_round_trips_through_a_fake_bus() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(run_fake_bus(listener));

    let config = Config::parse(CONFIG_JSON).expect("config parses");
    let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());
    let engine = NikobusEngine::connect(config, endpoint)
        .await
        .expect("engine connects and handshakes");

    let mut events = engine.subscribe();
    let module = ModuleAddress::parse("4707").unwrap();

    tokio::time::timeout(Duration::from_secs(5), engine.turn_on_switch(module, 1))
        .await
        .expect("did not time out")
        .expect("turn_on_switch succeeds");

    assert_eq!(engine.get(module, 1).await.unwrap(), 0xFF);

    let mut saw_refresh = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if matches!(event, EngineEvent::Refreshed { module: m } if m == module) {
            saw_refresh = true;
            break;
        }
    }
    assert!(saw_refresh, "expected a Refreshed event for the written module");
}

#[tokio::test]
async fn unknown_module_is_rejected_before_touching_the_bus() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(run_fake_bus(listener));

    let config = Config::parse(CONFIG_JSON).expect("config parses");
    let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());
    let engine = NikobusEngine::connect(config, endpoint).await.expect("connects");

    let unconfigured = ModuleAddress::parse("FFFF").unwrap();
    let result = engine.turn_on_switch(unconfigured, 1).await;
    assert!(result.is_err(), "writing to an unconfigured module should fail synchronously");
}

#[tokio::test]
async fn channel_out_of_range_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(run_fake_bus(listener));

    let config = Config::parse(CONFIG_JSON).expect("config parses");
    let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());
    let engine = NikobusEngine::connect(config, endpoint).await.expect("connects");

    let module = ModuleAddress::parse("4707").unwrap();
    // Config only declares 2 channels for this module.
    let result = engine.turn_on_switch(module, 9).await;
    assert!(result.is_err(), "channel 9 is out of range for a 2-channel module");
}
