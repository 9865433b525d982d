//! One task per admitted tunnel: frames in, frames out, quotas enforced.

use std::borrow::Cow;
use std::time::Duration;

use ethtun_core::codec::{self, FrameKind, ProtocolViolation, WireMessage};
use ethtun_core::control::{truncate_utf8, ControlMessage, ERROR_CODE_PROTOCOL};
use ethtun_core::TunnelError;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc::error::TrySendError};
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace};

use crate::admission::{GlobalPermit, IpPermit, SessionPermit};
use crate::auth::SessionIdentity;
use crate::quota::{close_frame_len, QuotaEnforcer, QuotaExceeded, QuotaLimits};
use crate::relay::RelayLink;
use crate::upgrade::Admission;

/// Longest close reason a WebSocket close frame can carry.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    /// Period of keepalive `Ping` control messages; `None` disables them.
    pub ping_interval: Option<Duration>,
    /// A data or control send that takes longer counts as backpressure.
    pub send_timeout: Duration,
    /// Budget for each send on the way out (error message, close frame).
    pub close_send_timeout: Duration,
    /// How long to wait for the peer's close reply after we close.
    pub close_drain: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ping_interval: None,
            send_timeout: Duration::from_secs(1),
            close_send_timeout: Duration::from_millis(100),
            close_drain: Duration::from_secs(1),
        }
    }
}

/// Per-tunnel state. Dropping it returns the admission permits.
#[derive(Debug)]
pub struct ConnectionState {
    pub tunnel_id: u64,
    pub identity: Option<SessionIdentity>,
    pub quota: QuotaEnforcer,
    ip_permit: Option<IpPermit>,
    global_permit: GlobalPermit,
    session_permit: Option<SessionPermit>,
}

impl ConnectionState {
    pub fn new(admission: Admission, limits: QuotaLimits) -> Self {
        Self {
            tunnel_id: admission.tunnel_id,
            identity: admission.identity,
            quota: QuotaEnforcer::new(limits),
            ip_permit: admission.ip_permit,
            global_permit: admission.global_permit,
            session_permit: admission.session_permit,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.session_id.as_str())
    }

    /// Return every permit now instead of at drop.
    pub fn release_permits(&mut self) {
        if let Some(permit) = self.session_permit.as_mut() {
            permit.release();
        }
        self.global_permit.release();
        if let Some(permit) = self.ip_permit.as_mut() {
            permit.release();
        }
    }
}

/// Why a tunnel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEnd {
    /// The peer closed or went away.
    PeerClosed,
    /// Server shutdown, closed with 1001.
    Shutdown,
    /// A quota tripped, closed with 1008.
    Quota(QuotaExceeded),
    /// The peer broke the framing rules, closed with 1008.
    Protocol(ProtocolViolation),
    /// The relay dropped its side of the link, closed with 1000.
    RelayClosed,
    /// Reading or writing the socket failed.
    Transport(String),
}

impl TunnelEnd {
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            TunnelEnd::Shutdown => Some(CloseCode::Away),
            TunnelEnd::Quota(_) | TunnelEnd::Protocol(_) => Some(CloseCode::Policy),
            TunnelEnd::RelayClosed => Some(CloseCode::Normal),
            TunnelEnd::PeerClosed | TunnelEnd::Transport(_) => None,
        }
    }

    /// The failure behind this end, if it was one.
    pub fn error(&self) -> Option<TunnelError> {
        match self {
            TunnelEnd::Quota(q) => Some(TunnelError::QuotaExceeded(q.reason().to_string())),
            TunnelEnd::Protocol(v) => Some(TunnelError::ProtocolViolation(v.clone())),
            TunnelEnd::Transport(e) => Some(TunnelError::Transport(e.clone())),
            TunnelEnd::Shutdown => Some(TunnelError::ShuttingDown),
            TunnelEnd::PeerClosed | TunnelEnd::RelayClosed => None,
        }
    }
}

/// Length a message contributes to byte accounting.
pub fn ws_message_len(msg: &Message) -> usize {
    match msg {
        Message::Close(Some(frame)) => close_frame_len(&frame.reason),
        Message::Close(None) => 0,
        other => other.len(),
    }
}

/// Drive one tunnel until it ends, then close the socket.
///
/// `state` is consumed: the permits it holds are released when this returns,
/// or while unwinding if the task panics.
pub async fn run_tunnel<S>(
    mut ws: WebSocketStream<S>,
    mut state: ConnectionState,
    mut link: RelayLink,
    settings: TunnelSettings,
    mut shutdown: broadcast::Receiver<()>,
) -> TunnelEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(tunnel_id = state.tunnel_id, session_id = state.session_id(), "tunnel opened");

    let mut keepalive = settings.ping_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut ping_seq: u64 = 0;

    let end = loop {
        tokio::select! {
            _ = shutdown.recv() => {
                break TunnelEnd::Shutdown;
            }

            inbound = ws.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => break TunnelEnd::Transport(e.to_string()),
                    None => break TunnelEnd::PeerClosed,
                };
                if let Err(q) = state.quota.on_inbound(ws_message_len(&msg)) {
                    break TunnelEnd::Quota(q);
                }
                match handle_inbound(&mut ws, &mut state, &link, msg, settings.send_timeout).await {
                    Ok(None) => {}
                    Ok(Some(end)) => break end,
                    Err(end) => break end,
                }
            }

            from_network = link.from_network.recv() => {
                let Some(frame) = from_network else {
                    break TunnelEnd::RelayClosed;
                };
                let encoded = match codec::encode_parts(FrameKind::Data, &frame) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        debug!(error = %e, "dropping frame from network");
                        continue;
                    }
                };
                if let Err(end) = send_accounted(&mut ws, &mut state, encoded, settings.send_timeout).await {
                    break end;
                }
            }

            _ = tick(&mut keepalive) => {
                ping_seq += 1;
                let ping = ControlMessage::Ping(ping_seq.to_be_bytes().to_vec());
                let encoded = codec::encode_parts(FrameKind::Control, &ping.to_payload());
                if let Ok(encoded) = encoded {
                    trace!(seq = ping_seq, "sending keepalive ping");
                    if let Err(end) = send_accounted(&mut ws, &mut state, encoded, settings.send_timeout).await {
                        break end;
                    }
                }
            }
        }
    };

    // Stop feeding the relay before the close handshake.
    drop(link);
    close(&mut ws, &end, settings).await;

    info!(
        tunnel_id = state.tunnel_id,
        session_id = state.session_id(),
        rx_bytes = state.quota.rx_bytes(),
        tx_bytes = state.quota.tx_bytes(),
        end = ?end,
        error = end.error().map(|e| e.to_string()),
        "tunnel closed"
    );
    state.release_permits();
    end
}

/// Handle one inbound message that already passed quota accounting.
async fn handle_inbound<S>(
    ws: &mut WebSocketStream<S>,
    state: &mut ConnectionState,
    link: &RelayLink,
    msg: Message,
    send_timeout: Duration,
) -> Result<Option<TunnelEnd>, TunnelEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match msg {
        Message::Binary(data) => match codec::decode(&data)? {
            WireMessage::Data(frame) => {
                match link.to_network.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!("relay full, dropping frame"),
                    Err(TrySendError::Closed(_)) => return Ok(Some(TunnelEnd::RelayClosed)),
                }
                Ok(None)
            }
            WireMessage::Control(payload) => {
                match ControlMessage::parse(&payload) {
                    Some(ControlMessage::Ping(body)) => {
                        let encoded = ControlMessage::Pong(body).encode()?;
                        send_accounted(ws, state, encoded, send_timeout).await?;
                    }
                    Some(other) => trace!(msg = ?other, "ignoring control message"),
                    None => trace!("ignoring empty control message"),
                }
                Ok(None)
            }
        },
        Message::Text(_) => Err(TunnelEnd::Protocol(ProtocolViolation::UnexpectedText)),
        Message::Ping(payload) => {
            // tungstenite queues the Pong reply itself; count it as sent.
            state.quota.on_outbound(payload.len())?;
            Ok(None)
        }
        Message::Pong(_) => Ok(None),
        Message::Close(frame) => {
            debug!(frame = ?frame, "peer closed tunnel");
            Ok(Some(TunnelEnd::PeerClosed))
        }
        Message::Frame(_) => Ok(None),
    }
}

/// Account for and send one encoded wire message.
async fn send_accounted<S>(
    ws: &mut WebSocketStream<S>,
    state: &mut ConnectionState,
    encoded: Vec<u8>,
    send_timeout: Duration,
) -> Result<(), TunnelEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.quota.on_outbound(encoded.len())?;
    match timeout(send_timeout, ws.send(Message::Binary(encoded.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TunnelEnd::Transport(e.to_string())),
        Err(_) => Err(TunnelEnd::Quota(QuotaExceeded::Backpressure)),
    }
}

impl From<QuotaExceeded> for TunnelEnd {
    fn from(q: QuotaExceeded) -> Self {
        TunnelEnd::Quota(q)
    }
}

impl From<ProtocolViolation> for TunnelEnd {
    fn from(v: ProtocolViolation) -> Self {
        TunnelEnd::Protocol(v)
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Close the socket for `end` and wait briefly for the peer's reply.
async fn close<S>(ws: &mut WebSocketStream<S>, end: &TunnelEnd, settings: TunnelSettings)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (error, reason): (Option<ControlMessage>, Cow<'static, str>) = match end {
        TunnelEnd::Quota(q) => (
            Some(ControlMessage::Error {
                code: q.error_code(),
                message: q.reason().to_string(),
            }),
            Cow::Borrowed(q.reason()),
        ),
        TunnelEnd::Protocol(v) => {
            let reason = format!("protocol error: {v}");
            (
                Some(ControlMessage::Error {
                    code: ERROR_CODE_PROTOCOL,
                    message: reason.clone(),
                }),
                Cow::Owned(reason),
            )
        }
        TunnelEnd::Shutdown => (None, Cow::Borrowed("shutting down")),
        TunnelEnd::RelayClosed => (None, Cow::Borrowed("relay closed")),
        // The peer already closed, or the socket is gone.
        TunnelEnd::PeerClosed | TunnelEnd::Transport(_) => {
            if let TunnelEnd::Transport(e) = end {
                debug!(error = %e, "tunnel transport error");
            }
            let _ = timeout(settings.close_send_timeout, ws.flush()).await;
            return;
        }
    };
    let Some(code) = end.close_code() else {
        return;
    };

    if let Some(error) = error {
        if let Ok(encoded) = error.encode() {
            let _ = timeout(
                settings.close_send_timeout,
                ws.send(Message::Binary(encoded.into())),
            )
            .await;
        }
    }

    let frame = CloseFrame {
        code,
        reason: truncate_utf8(&reason, MAX_CLOSE_REASON).to_string().into(),
    };
    let _ = timeout(settings.close_send_timeout, ws.send(Message::Close(Some(frame)))).await;

    // Drain until the peer answers the close or the budget runs out.
    let _ = timeout(settings.close_drain, async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}
