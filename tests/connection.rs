//! Integration tests for the connection core
//!
//! Two endpoints are wired through an in-memory simulated connector that
//! applies an exchange rate, enforces a packet-size ceiling with F08
//! rejects, and can inject temporary failures. Covers rate discovery, flow
//! control both ways, graceful close, idle teardown, and data transfer.

use async_trait::async_trait;
use bytes::Bytes;
use paystream::connection::ConnectionError;
use paystream::crypto::PacketCrypto;
use paystream::packet::{ErrorCode, Frame, Packet, PacketType};
use paystream::transport::{
    Fulfill, MaxPacketDetails, PacketOutcome, PacketSender, Prepare, Reject, RejectCode,
    TransportError,
};
use paystream::{Connection, ConnectionConfig, ConnectionEvent, Rate, Role};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const SECRET: [u8; 32] = [7; 32];

/// Inbound half of an endpoint, type-erased so both sides can point at
/// each other.
trait Inbound: Send {
    fn handle(&mut self, prepare: &Prepare) -> Result<Fulfill, Reject>;
}

impl<T: PacketSender> Inbound for Connection<T> {
    fn handle(&mut self, prepare: &Prepare) -> Result<Fulfill, Reject> {
        self.handle_prepare(prepare)
    }
}

/// Late-bound peer reference, filled in once both endpoints exist.
#[derive(Clone, Default)]
struct PeerSlot(Arc<Mutex<Option<Arc<Mutex<dyn Inbound>>>>>);

impl PeerSlot {
    fn set(&self, peer: Arc<Mutex<dyn Inbound>>) {
        *self.0.lock().unwrap() = Some(peer);
    }

    fn get(&self) -> Arc<Mutex<dyn Inbound>> {
        self.0.lock().unwrap().clone().expect("peer not wired")
    }
}

/// One-hop connector: applies a rate, enforces a max packet amount, and
/// hands the packet to the peer endpoint.
struct SimConnector {
    peer: PeerSlot,
    rate: (u64, u64),
    max_packet: Option<u64>,
    temporary_failures: u32,
    packets: Arc<Mutex<u32>>,
}

#[async_trait]
impl PacketSender for SimConnector {
    async fn send_prepare(&mut self, prepare: Prepare) -> Result<PacketOutcome, TransportError> {
        *self.packets.lock().unwrap() += 1;

        if self.temporary_failures > 0 {
            self.temporary_failures -= 1;
            return Ok(PacketOutcome::Rejected(Reject {
                code: RejectCode::TEMPORARY_FAILURE,
                message: "try again".to_string(),
                data: Bytes::new(),
            }));
        }

        if let Some(max) = self.max_packet {
            if prepare.amount > max {
                let details = MaxPacketDetails {
                    received: prepare.amount,
                    maximum: max,
                };
                return Ok(PacketOutcome::Rejected(Reject {
                    code: RejectCode::PACKET_TOO_LARGE,
                    message: String::new(),
                    data: details.to_bytes(),
                }));
            }
        }

        let delivered =
            (prepare.amount as u128 * self.rate.0 as u128 / self.rate.1 as u128) as u64;
        let delivered_prepare = Prepare {
            amount: delivered,
            execution_condition: prepare.execution_condition,
            data: prepare.data,
        };
        let outcome = self.peer.get().lock().unwrap().handle(&delivered_prepare);
        Ok(match outcome {
            Ok(fulfill) => PacketOutcome::Fulfilled(fulfill),
            Err(reject) => PacketOutcome::Rejected(reject),
        })
    }
}

struct Harness {
    client: Arc<Mutex<Connection<SimConnector>>>,
    server: Arc<Mutex<Connection<SimConnector>>>,
    /// Packets the client pushed into its connector.
    client_packets: Arc<Mutex<u32>>,
}

fn wire_with_config(
    rate: (u64, u64),
    max_packet: Option<u64>,
    temporary_failures: u32,
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
) -> Harness {
    let to_server = PeerSlot::default();
    let to_client = PeerSlot::default();
    let client_packets = Arc::new(Mutex::new(0));
    let server_packets = Arc::new(Mutex::new(0));

    let mut client = Connection::new(
        SimConnector {
            peer: to_server.clone(),
            rate,
            max_packet,
            temporary_failures,
            packets: client_packets.clone(),
        },
        &SECRET,
        Role::Initiator,
        client_config,
    )
    .unwrap();
    client.set_source_account("test.client");
    client.set_destination_account("test.server");
    client.set_local_asset("ABC", 9);

    let mut server = Connection::new(
        SimConnector {
            peer: to_client.clone(),
            rate,
            max_packet: None,
            temporary_failures: 0,
            packets: server_packets,
        },
        &SECRET,
        Role::Responder,
        server_config,
    )
    .unwrap();
    server.set_source_account("test.server");
    server.set_local_asset("XYZ", 6);

    let client = Arc::new(Mutex::new(client));
    let server = Arc::new(Mutex::new(server));
    to_server.set(server.clone());
    to_client.set(client.clone());

    Harness {
        client,
        server,
        client_packets,
    }
}

fn wire(rate: (u64, u64), max_packet: Option<u64>) -> Harness {
    wire_with_config(
        rate,
        max_packet,
        0,
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    )
}

fn drain(rx: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn discovers_exchange_rate_and_connects() {
    let h = wire((2, 1), None);
    let mut client_events = h.client.lock().unwrap().subscribe();
    let mut server_events = h.server.lock().unwrap().subscribe();

    h.client.lock().unwrap().connect().await.unwrap();

    let client = h.client.lock().unwrap();
    assert!(client.is_connected());
    assert_eq!(client.exchange_rate(), Some(Rate::new(2, 1).unwrap()));

    let events = drain(&mut client_events);
    assert!(matches!(events[0], ConnectionEvent::Connect));

    // The probe's handshake frames told the server who we are.
    let server = h.server.lock().unwrap();
    assert!(server.is_connected());
    assert_eq!(server.destination_account(), Some("test.client"));
    let asset = server.remote_asset().unwrap();
    assert_eq!((asset.code.as_str(), asset.scale), ("ABC", 9));
    assert!(matches!(
        drain(&mut server_events)[0],
        ConnectionEvent::Connect
    ));
}

#[tokio::test]
async fn probe_learns_max_packet_from_f08() {
    let h = wire((1, 1), Some(1000));
    h.client.lock().unwrap().connect().await.unwrap();

    let client = h.client.lock().unwrap();
    assert_eq!(client.exchange_rate(), Some(Rate::ONE));
    assert_eq!(client.max_packet_amount(), Some(1000));
}

#[tokio::test]
async fn rate_probe_fails_without_enough_precision() {
    // Rate 1/1000 crushes every delivered amount to few digits, and the
    // ceiling keeps the volley from ever using larger probes.
    let h = wire((1, 1000), Some(10));
    let result = h.client.lock().unwrap().connect().await;
    assert!(matches!(result, Err(ConnectionError::RateProbe(_))));
    assert!(h.client.lock().unwrap().is_closed());
}

#[tokio::test]
async fn money_flows_and_totals_add_up() {
    let h = wire((2, 1), None);
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(1_000_000));

    h.client.lock().unwrap().connect().await.unwrap();

    let id = {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        client.stream_mut(id).unwrap().set_send_max(50);
        id
    };
    assert_eq!(id, 1);

    h.client.lock().unwrap().maybe_start_send_loop().await;

    let client = h.client.lock().unwrap();
    assert_eq!(client.total_sent(), 50);
    assert_eq!(client.total_delivered(), 100);
    assert_eq!(client.stream(id).unwrap().total_sent(), 50);
    assert_eq!(client.last_packet_rate(), Some(Rate::new(2, 1).unwrap()));

    let server = h.server.lock().unwrap();
    assert_eq!(server.total_received(), 100);
    assert_eq!(server.stream(id).unwrap().total_received(), 100);
}

#[tokio::test]
async fn money_is_chunked_by_max_packet_amount() {
    let h = wire((1, 1), Some(1000));
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(1_000_000));

    h.client.lock().unwrap().connect().await.unwrap();
    {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        client.stream_mut(id).unwrap().set_send_max(2500);
    }
    h.client.lock().unwrap().maybe_start_send_loop().await;

    let client = h.client.lock().unwrap();
    assert_eq!(client.total_sent(), 2500);
    assert_eq!(h.server.lock().unwrap().total_received(), 2500);
}

#[tokio::test]
async fn receive_limit_is_enforced_and_advertised() {
    let h = wire((1, 1), None);
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(100));

    h.client.lock().unwrap().connect().await.unwrap();
    {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        client.stream_mut(id).unwrap().set_send_max(150);
    }
    h.client.lock().unwrap().maybe_start_send_loop().await;

    // The oversized first packet was rejected with a StreamMaxMoney
    // advertisement; the retry fit inside the advertised window.
    let client = h.client.lock().unwrap();
    assert_eq!(client.total_sent(), 100);
    assert_eq!(client.stream(1).unwrap().remote_receive_max(), Some(100));

    let server = h.server.lock().unwrap();
    let stream = server.stream(1).unwrap();
    assert_eq!(stream.total_received(), 100);
    assert!(stream.total_received() <= stream.receive_max() * 101 / 100);
}

#[tokio::test]
async fn graceful_close_drains_then_closes_both_ends() {
    let h = wire((1, 1), None);
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(1_000_000));
    let mut client_events = h.client.lock().unwrap().subscribe();
    let mut server_events = h.server.lock().unwrap().subscribe();

    h.client.lock().unwrap().connect().await.unwrap();
    {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        let stream = client.stream_mut(id).unwrap();
        stream.set_send_max(20);
        stream.write(Bytes::from_static(b"goodbye")).unwrap();
    }

    h.client.lock().unwrap().end().await.unwrap();

    let client = h.client.lock().unwrap();
    assert!(client.is_closed());
    assert_eq!(client.total_sent(), 20);
    let events = drain(&mut client_events);
    assert!(matches!(events[events.len() - 2], ConnectionEvent::End));
    assert!(matches!(events[events.len() - 1], ConnectionEvent::Close));

    let mut server = h.server.lock().unwrap();
    assert!(server.is_closed());
    assert_eq!(server.total_received(), 20);
    assert_eq!(&server.read_from_stream(1, 64)[..], b"goodbye");
    let events = drain(&mut server_events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Stream(1))));
    assert!(matches!(events[events.len() - 2], ConnectionEvent::End));
    assert!(matches!(events[events.len() - 1], ConnectionEvent::Close));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_destroys_connection() {
    let mut config = ConnectionConfig::default();
    config.idle_timeout_ms = 5000;
    let h = wire_with_config((1, 1), None, 0, config, ConnectionConfig::default());
    let mut events = h.client.lock().unwrap().subscribe();

    h.client.lock().unwrap().connect().await.unwrap();
    drain(&mut events);

    // Not yet.
    tokio::time::advance(Duration::from_millis(4000)).await;
    assert!(!h.client.lock().unwrap().check_idle().await);

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert!(h.client.lock().unwrap().check_idle().await);
    assert!(h.client.lock().unwrap().is_closed());

    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    match &events[0] {
        ConnectionEvent::Error(error) => {
            assert_eq!(
                error.to_string(),
                "Connection timed out due to inactivity"
            );
        }
        other => panic!("expected Error event, got {:?}", other),
    }
    assert!(matches!(events[1], ConnectionEvent::Close));

    // Firing twice is a no-op.
    tokio::time::advance(Duration::from_millis(10_000)).await;
    assert!(!h.client.lock().unwrap().check_idle().await);
}

#[tokio::test(start_paused = true)]
async fn temporary_errors_retry_with_backoff() {
    let mut config = ConnectionConfig::default();
    config.min_exchange_rate_precision = 1;
    // The whole first volley fails with T00; the retry volley succeeds.
    let h = wire_with_config((1, 1), None, 5, config, ConnectionConfig::default());

    h.client.lock().unwrap().connect().await.unwrap();
    assert!(h.client.lock().unwrap().is_connected());
    assert_eq!(*h.client_packets.lock().unwrap(), 6);
}

#[tokio::test]
async fn data_roundtrip_100k() {
    let h = wire((1, 1), None);
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(1_000_000));

    h.client.lock().unwrap().connect().await.unwrap();

    let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        client
            .stream_mut(id)
            .unwrap()
            .write(Bytes::from(payload.clone()))
            .unwrap();
    }

    // Pump: the client sends until its windows close, the server reads and
    // advertises fresh windows, and so on until everything arrived.
    let mut received = Vec::new();
    for _ in 0..50 {
        if received.len() >= payload.len() {
            break;
        }
        h.client.lock().unwrap().maybe_start_send_loop().await;
        loop {
            let chunk = h.server.lock().unwrap().read_from_stream(1, 65536);
            if chunk.is_empty() {
                break;
            }
            received.extend_from_slice(&chunk);
        }
        h.server.lock().unwrap().maybe_start_send_loop().await;
    }

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    assert!(!h.client.lock().unwrap().is_closed());
    assert!(!h.server.lock().unwrap().is_closed());
}

#[tokio::test]
async fn destroy_sends_at_most_one_close_packet() {
    let h = wire((1, 1), None);
    let mut server_events = h.server.lock().unwrap().subscribe();
    h.client.lock().unwrap().connect().await.unwrap();

    let before = *h.client_packets.lock().unwrap();
    h.client.lock().unwrap().destroy(None).await;
    assert_eq!(*h.client_packets.lock().unwrap(), before + 1);

    // Nothing further leaves, not even via explicit wake-ups.
    h.client.lock().unwrap().maybe_start_send_loop().await;
    h.client.lock().unwrap().destroy(None).await;
    assert_eq!(*h.client_packets.lock().unwrap(), before + 1);

    // The peer saw the graceful close.
    let events = drain(&mut server_events);
    assert!(h.server.lock().unwrap().is_closed());
    assert!(matches!(events[events.len() - 2], ConnectionEvent::End));
    assert!(matches!(events[events.len() - 1], ConnectionEvent::Close));
}

#[tokio::test]
async fn stream_parity_violation_closes_connection() {
    let h = wire((1, 1), None);
    let mut server_events = h.server.lock().unwrap().subscribe();

    // Hand-craft a packet claiming a responder-parity stream id.
    let crypto = PacketCrypto::new(&SECRET).unwrap();
    let mut packet = Packet::new(9, PacketType::Prepare, 0);
    packet.frames.push(Frame::StreamMoney {
        stream_id: 4,
        shares: 1,
    });
    let data = crypto.seal(&packet.encode()).unwrap();
    let fulfillment = crypto.fulfillment(&data);
    let prepare = Prepare {
        amount: 10,
        execution_condition: PacketCrypto::condition(&fulfillment),
        data,
    };

    let reject = h
        .server
        .lock()
        .unwrap()
        .handle_prepare(&prepare)
        .unwrap_err();
    assert_eq!(reject.code, RejectCode::APPLICATION_ERROR);

    // The inner packet carries the ConnectionClose explaining why.
    let inner = Packet::decode(&crypto.open(&reject.data).unwrap()).unwrap();
    assert_eq!(inner.packet_type, PacketType::Reject);
    assert_eq!(inner.sequence, 9);
    assert!(inner.frames.iter().any(|frame| matches!(
        frame,
        Frame::ConnectionClose {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    )));

    assert!(h.server.lock().unwrap().is_closed());
    let events = drain(&mut server_events);
    assert!(matches!(events[0], ConnectionEvent::Error(_)));
    assert!(matches!(events[1], ConnectionEvent::Close));
}

#[tokio::test]
async fn stream_id_beyond_limit_is_rejected() {
    let h = wire((1, 1), None);

    let crypto = PacketCrypto::new(&SECRET).unwrap();
    let mut packet = Packet::new(3, PacketType::Prepare, 0);
    // Default ceiling is 2 × 10 streams; id 99 is far beyond it.
    packet.frames.push(Frame::StreamMoney {
        stream_id: 99,
        shares: 1,
    });
    let data = crypto.seal(&packet.encode()).unwrap();
    let fulfillment = crypto.fulfillment(&data);
    let prepare = Prepare {
        amount: 10,
        execution_condition: PacketCrypto::condition(&fulfillment),
        data,
    };

    let reject = h
        .server
        .lock()
        .unwrap()
        .handle_prepare(&prepare)
        .unwrap_err();
    let inner = Packet::decode(&crypto.open(&reject.data).unwrap()).unwrap();
    assert!(inner.frames.iter().any(|frame| matches!(
        frame,
        Frame::ConnectionClose {
            code: ErrorCode::StreamIdError,
            ..
        }
    )));
}

#[tokio::test]
async fn undecryptable_packet_is_rejected_without_state_changes() {
    let h = wire((1, 1), None);

    let prepare = Prepare {
        amount: 500,
        execution_condition: [9; 32],
        data: Bytes::from_static(&[0xAB; 64]),
    };
    let reject = h
        .server
        .lock()
        .unwrap()
        .handle_prepare(&prepare)
        .unwrap_err();
    assert_eq!(reject.code, RejectCode::UNEXPECTED_PAYMENT);

    let server = h.server.lock().unwrap();
    assert!(!server.is_closed());
    assert_eq!(server.stream_count(), 0);
    assert_eq!(server.total_received(), 0);
}

#[tokio::test]
async fn money_to_a_closed_stream_is_rejected() {
    let h = wire((1, 1), None);
    h.server
        .lock()
        .unwrap()
        .set_stream_handler(|stream| stream.set_receive_max(1_000));

    h.client.lock().unwrap().connect().await.unwrap();
    {
        let mut client = h.client.lock().unwrap();
        let id = client.create_stream().unwrap();
        client.stream_mut(id).unwrap().set_send_max(10);
    }
    h.client.lock().unwrap().maybe_start_send_loop().await;
    assert_eq!(h.client.lock().unwrap().total_sent(), 10);

    // Close the stream on both ends.
    h.client.lock().unwrap().stream_mut(1).unwrap().end(None);
    h.client.lock().unwrap().maybe_start_send_loop().await;

    // The server forgot the stream entirely; replaying value at its id is
    // refused and the id is never reborn.
    let crypto = PacketCrypto::new(&SECRET).unwrap();
    let mut packet = Packet::new(77, PacketType::Prepare, 0);
    packet.frames.push(Frame::StreamMoney {
        stream_id: 1,
        shares: 1,
    });
    let data = crypto.seal(&packet.encode()).unwrap();
    let fulfillment = crypto.fulfillment(&data);
    let prepare = Prepare {
        amount: 5,
        execution_condition: PacketCrypto::condition(&fulfillment),
        data,
    };
    let reject = h
        .server
        .lock()
        .unwrap()
        .handle_prepare(&prepare)
        .unwrap_err();
    let inner = Packet::decode(&crypto.open(&reject.data).unwrap()).unwrap();
    assert!(inner.frames.iter().any(|frame| matches!(
        frame,
        Frame::StreamClose {
            stream_id: 1,
            code: ErrorCode::StreamStateError,
            ..
        }
    )));
}

#[tokio::test]
async fn stream_ids_exhaust_against_remote_limit() {
    let mut config = ConnectionConfig::default();
    config.max_remote_streams = 1;
    let h = wire_with_config((1, 1), None, 0, config, ConnectionConfig::default());

    let mut client = h.client.lock().unwrap();
    assert_eq!(client.create_stream().unwrap(), 1);
    assert!(matches!(
        client.create_stream(),
        Err(ConnectionError::StreamIdBlocked)
    ));
}
