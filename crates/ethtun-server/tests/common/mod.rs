#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ethtun_core::codec::{self, WireMessage};
use ethtun_server::auth::AuthScheme;
use ethtun_server::origin::AllowedOrigins;
use ethtun_server::{start_server, LoopbackRelay, ServerConfig, ServerHandle};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALLOWED_ORIGIN: &str = "https://allowed.test";
pub const TOKEN: &str = "sekrit";

/// Token auth, one allowed origin, no limits, bound to an ephemeral port.
pub fn base_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        allowed_origins: AllowedOrigins::List(vec![ALLOWED_ORIGIN.into()]),
        auth: AuthScheme::Token {
            secret: TOKEN.into(),
        },
        ..ServerConfig::default()
    }
}

pub async fn spawn(config: ServerConfig) -> ServerHandle {
    start_server(config, Arc::new(LoopbackRelay)).await.unwrap()
}

/// Upgrade request for `path_and_query`, offering `protocols`, with headers.
pub fn request(addr: SocketAddr, path_and_query: &str, protocols: &[&str], headers: &[(&'static str, &str)]) -> Request {
    let mut req = format!("ws://{addr}{path_and_query}").into_client_request().unwrap();
    if !protocols.is_empty() {
        req.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(&protocols.join(", ")).unwrap(),
        );
    }
    for (name, value) in headers {
        req.headers_mut().append(*name, HeaderValue::from_str(value).unwrap());
    }
    req
}

/// The usual well-formed request: tunnel protocol, allowed origin, valid token.
pub fn good_request(addr: SocketAddr) -> Request {
    request(
        addr,
        &format!("/l2?token={TOKEN}"),
        &["ethtun-l2-v1"],
        &[("origin", ALLOWED_ORIGIN)],
    )
}

pub async fn connect(req: Request) -> Result<Client, WsError> {
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

pub fn status_of(result: Result<Client, WsError>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::SWITCHING_PROTOCOLS,
        Err(WsError::Http(resp)) => resp.status(),
        Err(other) => panic!("unexpected handshake error: {other}"),
    }
}

pub async fn assert_status(req: Request, expected: StatusCode) {
    assert_eq!(status_of(connect(req).await), expected);
}

/// Retry while the server still answers 429, for up to two seconds.
pub async fn connect_with_retry(make: impl Fn() -> Request) -> Client {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match connect(make()).await {
            Ok(ws) => return ws,
            Err(WsError::Http(resp)) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "still rejected with 429 after deadline"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(other) => panic!("unexpected handshake error: {other}"),
        }
    }
}

/// Close from the client side and wait for the server to finish the handshake.
pub async fn close(mut ws: Client) {
    let _ = ws.close(None).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

pub fn data(payload: &[u8]) -> Message {
    Message::Binary(codec::encode(&WireMessage::Data(payload.to_vec())).unwrap().into())
}

/// Next wire message from the server, skipping WebSocket pings and pongs.
pub async fn next_wire(ws: &mut Client) -> WireMessage {
    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(b))) => return b.to_vec(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected binary message, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for message");
    codec::decode(&msg).unwrap()
}

/// Read until the server's close frame, ignoring anything before it.
pub async fn expect_close(ws: &mut Client) -> CloseFrame<'static> {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}
