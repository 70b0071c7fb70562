//! End-to-end envelope exchange between two endpoints over a synthetic
//! datagram shuttle with controllable loss.

use std::time::{Duration, Instant};

use bytes::Bytes;
use meshenvelope::{
    Envelope, EnvelopeConfig, EnvelopeEndpoint, EnvelopeKind, HandlerRegistry,
    ReliabilityStrategy,
};

const CLIENT: u32 = 1;
const GATEWAY: u32 = 2;

fn echo_gateway(config: EnvelopeConfig) -> EnvelopeEndpoint {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "echo",
        Box::new(|req: &Envelope| -> meshenvelope::Result<Bytes> { Ok(req.data.clone()) }),
    );
    EnvelopeEndpoint::new(config, handlers)
}

fn test_config(strategy: ReliabilityStrategy) -> EnvelopeConfig {
    EnvelopeConfig {
        strategy,
        inter_burst_delay: Duration::from_millis(100),
        resend_timeout: Duration::from_secs(2),
        quiet_interval: Duration::from_millis(500),
        max_attempts: 10,
        ..EnvelopeConfig::default()
    }
}

/// Drive both endpoints until the client holds its response, dropping
/// datagrams according to `keep`.
fn exchange(
    client: &mut EnvelopeEndpoint,
    gateway: &mut EnvelopeEndpoint,
    request_id: &str,
    mut keep: impl FnMut(u32, &[u8]) -> bool,
) -> Envelope {
    let mut now = Instant::now();
    for _ in 0..1500 {
        for (dest, datagram) in client.poll(now) {
            assert_eq!(dest, GATEWAY);
            if keep(CLIENT, &datagram) {
                gateway.on_datagram(CLIENT, &datagram, now);
            }
        }
        for (dest, datagram) in gateway.poll(now) {
            assert_eq!(dest, CLIENT);
            if keep(GATEWAY, &datagram) {
                client.on_datagram(GATEWAY, &datagram, now);
            }
        }
        if let Some((src, response)) = client.take_response(request_id) {
            assert_eq!(src, GATEWAY);
            return response;
        }
        now += Duration::from_millis(100);
    }
    panic!("no response within the exchange budget");
}

#[test]
fn request_response_roundtrip() {
    let config = test_config(ReliabilityStrategy::Simple);
    let mut client = EnvelopeEndpoint::new(config.clone(), HandlerRegistry::new());
    let mut gateway = echo_gateway(config);

    let request = Envelope::request("echo", Bytes::from_static(b"over the mesh"));
    let id = client
        .request(GATEWAY, &request, Instant::now())
        .unwrap();

    let response = exchange(&mut client, &mut gateway, &id, |_, _| true);
    assert_eq!(response.kind, EnvelopeKind::Response);
    assert_eq!(&response.data[..], b"over the mesh");
    assert_eq!(gateway.stats().delivered, 1);
}

#[test]
fn multichunk_request_survives_loss() {
    let config = test_config(ReliabilityStrategy::Simple);
    let mut client = EnvelopeEndpoint::new(config.clone(), HandlerRegistry::new());
    let mut gateway = echo_gateway(config);

    // Poorly compressible payload, so the request spans several chunks.
    let data: Vec<u8> = (0..3000u32)
        .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
        .collect();
    let request = Envelope::request("echo", Bytes::from(data.clone()));
    let id = client
        .request(GATEWAY, &request, Instant::now())
        .unwrap();

    // Drop every fifth datagram, both directions.
    let mut counter = 0u32;
    let response = exchange(&mut client, &mut gateway, &id, |_, _| {
        counter += 1;
        counter % 5 != 0
    });
    assert_eq!(&response.data[..], &data[..]);
}

#[test]
fn windowed_strategy_repairs_with_nacks() {
    let config = test_config(ReliabilityStrategy::Windowed);
    let mut client = EnvelopeEndpoint::new(config.clone(), HandlerRegistry::new());
    let mut gateway = echo_gateway(config);

    let data: Vec<u8> = (0..3000u32)
        .flat_map(|i| i.wrapping_mul(0x9E3779B9).to_le_bytes())
        .collect();
    let request = Envelope::request("echo", Bytes::from(data.clone()));
    let id = client
        .request(GATEWAY, &request, Instant::now())
        .unwrap();

    // Drop a third of the client's datagrams on the first attempt only.
    let mut sent = 0u32;
    let response = exchange(&mut client, &mut gateway, &id, |src, _| {
        if src == CLIENT {
            sent += 1;
            sent > 90 || sent % 3 != 0
        } else {
            true
        }
    });
    assert_eq!(&response.data[..], &data[..]);
}

#[test]
fn unknown_command_yields_error_envelope() {
    let config = test_config(ReliabilityStrategy::Simple);
    let mut client = EnvelopeEndpoint::new(config.clone(), HandlerRegistry::new());
    let mut gateway = echo_gateway(config);

    let request = Envelope::request("selfdestruct", Bytes::new());
    let id = client
        .request(GATEWAY, &request, Instant::now())
        .unwrap();

    let response = exchange(&mut client, &mut gateway, &id, |_, _| true);
    assert_eq!(response.kind, EnvelopeKind::Error);
    assert!(String::from_utf8_lossy(&response.data).contains("selfdestruct"));
}

#[test]
fn handler_runs_once_despite_duplicate_datagrams() {
    let config = test_config(ReliabilityStrategy::Simple);
    let mut client = EnvelopeEndpoint::new(config.clone(), HandlerRegistry::new());
    let mut gateway = echo_gateway(config);

    let request = Envelope::request("echo", Bytes::from_static(b"dup me"));
    let id = client
        .request(GATEWAY, &request, Instant::now())
        .unwrap();

    // Deliver every client datagram twice.
    let mut now = Instant::now();
    let mut response = None;
    for _ in 0..100 {
        for (_, datagram) in client.poll(now) {
            gateway.on_datagram(CLIENT, &datagram, now);
            gateway.on_datagram(CLIENT, &datagram, now);
        }
        for (_, datagram) in gateway.poll(now) {
            client.on_datagram(GATEWAY, &datagram, now);
        }
        if let Some((_, r)) = client.take_response(&id) {
            response = Some(r);
            break;
        }
        now += Duration::from_millis(100);
    }

    assert!(response.is_some());
    assert_eq!(gateway.stats().delivered, 1);
    assert_eq!(gateway.stats().duplicates_suppressed, 0);
}

#[test]
fn corrupt_datagrams_dropped_and_counted() {
    let config = test_config(ReliabilityStrategy::Simple);
    let mut gateway = echo_gateway(config);
    let now = Instant::now();

    gateway.on_datagram(CLIENT, b"??", now);
    gateway.on_datagram(CLIENT, b"XYZW-not-a-chunk-header", now);
    assert_eq!(gateway.decode_drops(), 2);
    assert_eq!(gateway.stats().delivered, 0);
}
