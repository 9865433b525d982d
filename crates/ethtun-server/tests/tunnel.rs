//! Data path, quotas and shutdown against a live server with a loopback relay.

mod common;

use std::time::Duration;

use common::*;
use ethtun_core::codec::{self, WireMessage, MAX_DATA_PAYLOAD};
use ethtun_core::control::{ControlMessage, ERROR_CODE_QUOTA_BYTES};
use ethtun_core::ProtocolViolation;
use ethtun_server::quota::QuotaLimits;
use ethtun_server::ServerConfig;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn loopback_echoes_full_size_frame() {
    let server = spawn(base_config()).await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    let frame: Vec<u8> = (0..MAX_DATA_PAYLOAD).map(|i| (i % 251) as u8).collect();
    ws.send(data(&frame)).await.unwrap();
    assert_eq!(next_wire(&mut ws).await, WireMessage::Data(frame));

    assert_eq!(
        codec::encode(&WireMessage::Data(vec![0; MAX_DATA_PAYLOAD + 1])),
        Err(ProtocolViolation::PayloadTooLarge {
            kind: codec::FrameKind::Data,
            len: MAX_DATA_PAYLOAD + 1,
            max: MAX_DATA_PAYLOAD,
        })
    );
    close(ws).await;
}

#[tokio::test]
async fn control_ping_is_answered() {
    let server = spawn(base_config()).await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    let ping = ControlMessage::Ping(b"hello".to_vec()).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();
    let WireMessage::Control(payload) = next_wire(&mut ws).await else {
        panic!("expected control reply");
    };
    assert_eq!(ControlMessage::parse(&payload), Some(ControlMessage::Pong(b"hello".to_vec())));
    close(ws).await;
}

#[tokio::test]
async fn byte_quota_closes_with_policy() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 4096,
            max_frames_per_second: 0,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    // 2051 bytes in plus the 2051-byte echo overruns 4096.
    ws.send(data(&[0xAB; MAX_DATA_PAYLOAD])).await.unwrap();
    let frame = expect_close(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "byte quota exceeded");
}

#[tokio::test]
async fn byte_quota_reports_error_before_closing() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 100,
            max_frames_per_second: 0,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    ws.send(data(&[1; 200])).await.unwrap();
    let WireMessage::Control(payload) = next_wire(&mut ws).await else {
        panic!("expected error control message");
    };
    let Some(ControlMessage::Error { code, message }) = ControlMessage::parse(&payload) else {
        panic!("expected error control message");
    };
    assert_eq!(code, ERROR_CODE_QUOTA_BYTES);
    assert_eq!(message, "byte quota exceeded");
    assert_eq!(expect_close(&mut ws).await.code, CloseCode::Policy);
}

#[tokio::test]
async fn frame_burst_trips_rate_quota() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 0,
            max_frames_per_second: 5,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    for i in 0..20u8 {
        // Later sends may race the server's close.
        let _ = ws.send(data(&[i; 64])).await;
    }
    let frame = expect_close(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "frame rate quota exceeded");
}

#[tokio::test]
async fn two_frames_per_second_trips_on_the_third() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 0,
            max_frames_per_second: 2,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    for i in 0..3u8 {
        ws.send(data(&[i; 16])).await.unwrap();
    }
    assert_eq!(next_wire(&mut ws).await, WireMessage::Data(vec![0; 16]));
    assert_eq!(next_wire(&mut ws).await, WireMessage::Data(vec![1; 16]));
    let frame = expect_close(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "frame rate quota exceeded");
}

#[tokio::test]
async fn small_byte_quota_trips_on_one_frame() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 64,
            max_frames_per_second: 0,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    ws.send(data(&[7; 100])).await.unwrap();
    let frame = expect_close(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "byte quota exceeded");
}

#[tokio::test]
async fn steady_rate_below_limit_is_not_tripped() {
    let server = spawn(ServerConfig {
        quota: QuotaLimits {
            max_bytes_per_connection: 0,
            max_frames_per_second: 10,
        },
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    for i in 0..10u8 {
        ws.send(data(&[i; 32])).await.unwrap();
        assert_eq!(next_wire(&mut ws).await, WireMessage::Data(vec![i; 32]));
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    close(ws).await;
}

#[tokio::test]
async fn text_message_is_a_protocol_error() {
    let server = spawn(base_config()).await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    ws.send(Message::Text("hello".into())).await.unwrap();
    let frame = expect_close(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert!(frame.reason.starts_with("protocol error"), "{}", frame.reason);
}

#[tokio::test]
async fn unknown_type_is_a_protocol_error() {
    let server = spawn(base_config()).await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    ws.send(Message::Binary(vec![0x7F, 0x00, 0x00].into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await.code, CloseCode::Policy);
}

#[tokio::test]
async fn keepalive_pings_arrive() {
    let server = spawn(ServerConfig {
        ping_interval: Some(Duration::from_millis(100)),
        ..base_config()
    })
    .await;
    let mut ws = connect(good_request(server.local_addr())).await.unwrap();

    let WireMessage::Control(payload) = next_wire(&mut ws).await else {
        panic!("expected keepalive");
    };
    assert!(matches!(ControlMessage::parse(&payload), Some(ControlMessage::Ping(_))));
    close(ws).await;
}

#[tokio::test]
async fn shutdown_closes_tunnels_and_refuses_upgrades() {
    let server = spawn(base_config()).await;
    let addr = server.local_addr();
    let mut ws = connect(good_request(addr)).await.unwrap();

    let ((), frame) = tokio::join!(server.shutdown(), expect_close(&mut ws));
    assert_eq!(frame.code, CloseCode::Away);
    assert_eq!(frame.reason, "shutting down");
    assert_eq!(server.admission().active_connections(), 0);

    // The listener is gone or answers 503.
    assert!(connect(good_request(addr)).await.is_err());
}

#[tokio::test]
async fn closing_releases_the_slot() {
    let server = spawn(base_config()).await;
    let ws = connect(good_request(server.local_addr())).await.unwrap();
    assert_eq!(server.admission().active_connections(), 1);
    close(ws).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.admission().active_connections() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn dropping_the_handle_stops_the_listener() {
    let server = spawn(base_config()).await;
    let addr = server.local_addr();
    close(connect(good_request(addr)).await.unwrap()).await;
    drop(server);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::net::TcpStream::connect(addr).await.is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "listener still accepting");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
