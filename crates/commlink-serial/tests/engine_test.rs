//! Cross-module engine scenario: open two ports, frame incoming
//! traffic, run a macro on one while transferring a file on the other,
//! then shut everything down and check the event stream.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use commlink_serial::engine::parser::FixedLengthParser;
use commlink_serial::{
    ConnectionController, EngineEvent, ErrorKind, FileTransferService, FlowControl,
    FramingKind, MacroEntry, MacroRunner, MacroState, PortConfig, SimulatedTransport,
};
use tokio::time::{sleep, timeout};

fn config(port: &str) -> PortConfig {
    PortConfig {
        port_name: port.to_string(),
        flow_control: FlowControl::RtsCts,
        ..Default::default()
    }
}

async fn drain_events(
    sub: &mut commlink_serial::Subscription,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(Some(ev)) = timeout(Duration::from_millis(200), sub.receiver.recv()).await {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn test_full_engine_scenario() {
    let controller = ConnectionController::new();
    let mut sub = controller.subscribe();

    // Two independent ports.
    let sensor = SimulatedTransport::new("SENSOR");
    let modem = SimulatedTransport::new("MODEM");
    controller
        .open_connection_with(config("SENSOR"), sensor.clone())
        .await
        .unwrap();
    controller
        .open_connection_with(config("MODEM"), modem.clone())
        .await
        .unwrap();

    // Fixed-length framing on the sensor link, AT lines on the modem.
    controller
        .set_parser("SENSOR", Box::new(FixedLengthParser::new(4)))
        .await
        .unwrap();
    controller
        .set_framing("MODEM", &FramingKind::AtLine)
        .await
        .unwrap();

    // Incoming traffic on both ports.
    sensor.inject_rx(b"AAAABBBBCC").await;
    modem.inject_rx(b"OK\r\nERROR\r\n").await;

    // Macro on the modem port.
    let runner = MacroRunner::new(Arc::clone(&controller), "MODEM");
    runner
        .load_macro(vec![
            MacroEntry {
                command: "AT".to_string(),
                delay_ms: 10,
                ..Default::default()
            },
            MacroEntry {
                command: "ATI".to_string(),
                delay_ms: 10,
                ..Default::default()
            },
        ])
        .unwrap();
    runner.start(1, 0).unwrap();

    // File transfer on the sensor port in parallel.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("firmware.bin");
    let payload = vec![0x42u8; 2500];
    std::fs::File::create(&path)
        .unwrap()
        .write_all(&payload)
        .unwrap();
    let transfer = FileTransferService::start(Arc::clone(&controller), "SENSOR", &path)
        .await
        .unwrap();

    assert!(transfer.wait().await);
    timeout(Duration::from_secs(5), async {
        while runner.state() != MacroState::Stopped {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("macro did not finish");

    sleep(Duration::from_millis(100)).await;

    // Wire-level results.
    let modem_tx = modem.drain_tx().await;
    assert_eq!(modem_tx, b"AT\r\nATI\r\n");
    let sensor_tx = sensor.drain_tx().await;
    assert_eq!(sensor_tx, payload);

    controller.close_connection(None).await.unwrap();
    assert!(controller.list_connections().await.is_empty());

    let events = drain_events(&mut sub).await;

    // Framed packets arrived with their raw reads first.
    let sensor_packets: Vec<Vec<u8>> = events
        .iter()
        .filter_map(|ev| match ev {
            EngineEvent::PacketReceived { port_name, packet } if port_name == "SENSOR" => {
                Some(packet.data.to_vec())
            }
            _ => None,
        })
        .collect();
    assert_eq!(sensor_packets, vec![b"AAAA".to_vec(), b"BBBB".to_vec()]);

    let modem_packets: Vec<Vec<u8>> = events
        .iter()
        .filter_map(|ev| match ev {
            EngineEvent::PacketReceived { port_name, packet } if port_name == "MODEM" => {
                Some(packet.data.to_vec())
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        modem_packets,
        vec![b"OK\r\n".to_vec(), b"ERROR\r\n".to_vec()]
    );

    let raw_pos = events.iter().position(|ev| {
        matches!(ev, EngineEvent::DataReceived { port_name, .. } if port_name == "SENSOR")
    });
    let packet_pos = events.iter().position(|ev| {
        matches!(ev, EngineEvent::PacketReceived { port_name, .. } if port_name == "SENSOR")
    });
    assert!(raw_pos.unwrap() < packet_pos.unwrap());

    // Lifecycle events: one open and one close per port.
    for port in ["SENSOR", "MODEM"] {
        let opened = events
            .iter()
            .filter(|ev| matches!(ev, EngineEvent::PortOpened { port_name } if port_name == port))
            .count();
        let closed = events
            .iter()
            .filter(|ev| matches!(ev, EngineEvent::PortClosed { port_name } if port_name == port))
            .count();
        assert_eq!(opened, 1, "{} opened once", port);
        assert_eq!(closed, 1, "{} closed once", port);
    }

    // Transfer completed successfully with progress along the way.
    assert!(events.iter().any(|ev| matches!(
        ev,
        EngineEvent::FileProgress { port_name, .. } if port_name == "SENSOR"
    )));
    assert!(events.iter().any(|ev| matches!(
        ev,
        EngineEvent::FileCompleted { success: true, .. }
    )));

    // Macro finished to completion.
    assert!(events.iter().any(|ev| matches!(
        ev,
        EngineEvent::MacroFinished { completed: true, .. }
    )));
}

#[tokio::test]
async fn test_engine_rejects_conflicting_operations() {
    let controller = ConnectionController::new();
    controller.open_connection(config("COM1")).await.unwrap();

    // Duplicate open.
    let err = controller.open_connection(config("COM1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyOpen);

    // Sending to an unknown port.
    let err = controller
        .send_data("COM9", b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PortNotFound);

    // Only one transfer slot per port.
    let _cancel = controller
        .register_file_transfer("COM1", "t-1")
        .await
        .unwrap();
    let err = controller
        .register_file_transfer("COM1", "t-2")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransferBusy);
    controller.unregister_file_transfer("COM1", "t-1").await;

    controller.close_connection(None).await.unwrap();
}
