use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use lora_fwd_gateway::config::FilterConfig;
use lora_fwd_gateway::protocol::{PacketType, UP_HEADER_LEN};
use lora_fwd_gateway::{GatewayConfig, GatewayContext, KvStore, MemoryStore, ServiceConfig, ServiceHandle};
use lora_fwd_radio::{Concentrator, ReceivedPacket, SimulatedConcentrator};

fn uplink_frame(fport: u8) -> Vec<u8> {
    let mut f = vec![0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x2A, 0x00, fport];
    f.extend_from_slice(&[0x11, 0x22, 0x33]);
    f.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    f
}

async fn recv(server: &UdpSocket) -> (Vec<u8>, std::net::SocketAddr) {
    let mut buf = vec![0u8; 8192];
    let (n, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .expect("no datagram from the gateway")
        .unwrap();
    buf.truncate(n);
    (buf, from)
}

#[tokio::test]
async fn test_service_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    let store = Arc::new(MemoryStore::new());
    store.put("lab/fport/5", "");
    let radio = Arc::new(SimulatedConcentrator::new());

    let service = ServiceConfig {
        name: "lab".into(),
        server_address: "127.0.0.1".into(),
        port_up: port,
        port_down: port,
        keepalive_s: 5,
        push_timeout_ms: 200,
        pull_timeout_ms: 50,
        filter: FilterConfig {
            fport: "include".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    let config = GatewayConfig {
        services: vec![service.clone()],
        ..Default::default()
    };
    let ctx = GatewayContext::new(config, store.clone(), radio.clone()).unwrap();
    let jit = {
        let scheduler = Arc::clone(&ctx.scheduler);
        let hal: Arc<dyn Concentrator> = radio.clone();
        let stop = Arc::clone(&ctx.stop);
        tokio::spawn(async move { scheduler.run(hal, stop).await })
    };
    let handle = ServiceHandle::start(&ctx, service, None).unwrap();

    for fport in [10, 5] {
        radio
            .inject(ReceivedPacket {
                count_us: 12_345,
                payload: uplink_frame(fport),
                ..Default::default()
            })
            .await;
    }
    handle.dispatch(radio.receive(8).await.unwrap());

    // PULL_DATA and PUSH_DATA arrive in either order
    let mut pull_from = None;
    let mut rxpk = None;
    while pull_from.is_none() || rxpk.is_none() {
        let (d, from) = recv(&server).await;
        assert_eq!(d[0], 2);
        assert_eq!(&d[4..12], &0xAA55_5A00_0000_0000u64.to_be_bytes());
        if d[3] == PacketType::PullData as u8 {
            server.send_to(&[2, d[1], d[2], 4], from).await.unwrap();
            pull_from = Some(from);
        } else if d[3] == PacketType::PushData as u8 {
            server.send_to(&[2, d[1], d[2], 1], from).await.unwrap();
            let body: Value = serde_json::from_slice(&d[UP_HEADER_LEN..]).unwrap();
            rxpk = Some(body["rxpk"].clone());
        }
    }
    let rxpk = rxpk.unwrap();
    assert_eq!(rxpk.as_array().unwrap().len(), 1);
    assert_eq!(rxpk[0]["tmst"], 12_345);
    assert_eq!(rxpk[0]["size"], 16);

    let mut resp = vec![2, 0x0A, 0x0B, 3];
    let txpk = json!({
        "txpk": {
            "imme": true, "freq": 869.525, "rfch": 0, "powe": 14,
            "modu": "LORA", "datr": "SF9BW125", "codr": "4/5",
            "ipol": true, "size": 5, "data": "aGVsbG8="
        }
    });
    resp.extend(serde_json::to_vec(&txpk).unwrap());
    server.send_to(&resp, pull_from.unwrap()).await.unwrap();

    let ack = loop {
        let (d, _) = recv(&server).await;
        if d[3] == PacketType::TxAck as u8 {
            break d;
        }
    };
    assert_eq!(&ack[1..3], &[0x0A, 0x0B]);
    let body: Value = serde_json::from_slice(&ack[UP_HEADER_LEN..]).unwrap();
    assert_eq!(body, json!({ "txpk_ack": { "error": "NONE" } }));

    radio.advance(60_000);
    let sent = timeout(Duration::from_secs(2), async {
        loop {
            let sent = radio.transmitted().await;
            if !sent.is_empty() {
                break sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sent[0].payload, b"hello");
    assert_eq!(sent[0].freq_hz, 869_525_000);

    ctx.stop.store(true, Ordering::Relaxed);
    handle.stop(Duration::from_secs(2)).await;
    jit.await.unwrap();
    assert!(!store.exists("service/lorawan/lab"));
}
