//! Async driver smoke tests: two transports wired back to back over the
//! in-memory link, exercising the full tokio event loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use meshstream::radio::{LinkFaults, NodeId, PairedRadio};
use meshstream::{Driver, StreamConfig, TransportHandle};
use tokio::sync::mpsc;

fn test_config() -> StreamConfig {
    StreamConfig {
        retransmit_timeout: Duration::from_millis(500),
        pacing_rate: 1000.0,
        pacing_burst: 32,
        ..StreamConfig::default()
    }
}

/// Forward datagrams from the in-memory radio into a driver's inbound
/// channel, the way a real adapter callback would.
fn spawn_forwarder(radio: Arc<PairedRadio>, tx: mpsc::Sender<(NodeId, Bytes)>) {
    tokio::spawn(async move {
        loop {
            while let Some((src, dg)) = radio.recv() {
                if tx.send((src, dg)).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
}

fn spawn_transport(
    node_radio: Arc<PairedRadio>,
) -> (TransportHandle, mpsc::Sender<(NodeId, Bytes)>) {
    let (driver, handle, inbound) = Driver::new(test_config(), node_radio.clone()).unwrap();
    tokio::spawn(driver.run());
    spawn_forwarder(node_radio, inbound.clone());
    (handle, inbound)
}

#[tokio::test]
async fn echo_roundtrip_through_drivers() {
    let (ra, rb) = PairedRadio::pair(1, 2, 256, LinkFaults::none());
    let (ra, rb) = (Arc::new(ra), Arc::new(rb));
    let (client, _tx_a) = spawn_transport(ra);
    let (gateway, _tx_b) = spawn_transport(rb);

    let deadline = Some(Instant::now() + Duration::from_secs(10));

    // Gateway: accept one stream and echo one payload back.
    let gw = gateway.clone();
    let server = tokio::spawn(async move {
        let sid = gw.next_accepted(deadline).await.unwrap();
        let data = gw.recv_some(sid, deadline).await.unwrap().unwrap();
        gw.send_all(sid, &data, deadline).await.unwrap();
        gw.close(sid).unwrap();
    });

    let sid = client.open(2).unwrap();
    client.send_all(sid, b"hello", deadline).await.unwrap();

    let echoed = client.recv_some(sid, deadline).await.unwrap().unwrap();
    assert_eq!(&echoed[..], b"hello");

    client.close(sid).unwrap();
    server.await.unwrap();

    assert_eq!(client.stats().fatal_losses, 0);
    assert_eq!(client.stats().rsts_sent, 0);
}

#[tokio::test]
async fn recv_deadline_expires() {
    let (ra, _rb) = PairedRadio::pair(1, 2, 16, LinkFaults::none());
    let (client, _tx) = spawn_transport(Arc::new(ra));

    let sid = client.open(2).unwrap();
    let deadline = Some(Instant::now() + Duration::from_millis(200));
    let err = client.recv_some(sid, deadline).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn window_backpressure_releases_under_acks() {
    let (ra, rb) = PairedRadio::pair(1, 2, 256, LinkFaults::none());
    let (ra, rb) = (Arc::new(ra), Arc::new(rb));
    let (client, _tx_a) = spawn_transport(ra);
    let (gateway, _tx_b) = spawn_transport(rb);

    let deadline = Some(Instant::now() + Duration::from_secs(20));

    // 4 KiB is far more than window_size * chunk_payload_size, so the
    // sender must park and resume as ACKs advance the window.
    let payload: Vec<u8> = (0..4096).map(|i| (i % 239) as u8).collect();

    let gw = gateway.clone();
    let expected = payload.clone();
    let server = tokio::spawn(async move {
        let sid = gw.next_accepted(deadline).await.unwrap();
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = gw.recv_some(sid, deadline).await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, expected);
    });

    let sid = client.open(2).unwrap();
    client.send_all(sid, &payload, deadline).await.unwrap();
    server.await.unwrap();
}
