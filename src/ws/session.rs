//! Per-connection send/receive tasks

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::rate_limit::SessionRateLimiter;
use crate::ws::protocol::{decode, encode, WsReq, WsResp};

/// Outbound messages buffered per session before the room starts dropping
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Inbound upsyncs buffered per session until the room tick drains them
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Cooperative cancellation shared by one session and its room
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Room side of a session: where to push downsyncs and where to drain upsyncs
pub struct SessionLink {
    pub outbound_tx: mpsc::Sender<WsResp>,
    pub inbound_rx: mpsc::Receiver<WsReq>,
    pub cancel: CancelSignal,
}

/// How the connection ended, as far as the peer told us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Transport side of a session
pub struct WsSession {
    pub id: Uuid,
    pub player_id: i32,
    cancel: CancelSignal,
    outbound_rx: mpsc::Receiver<WsResp>,
    inbound_tx: mpsc::Sender<WsReq>,
    rate_limiter: SessionRateLimiter,
}

impl WsSession {
    pub fn new(player_id: i32) -> (Self, SessionLink) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let cancel = CancelSignal::new();

        let session = Self {
            id: Uuid::new_v4(),
            player_id,
            cancel: cancel.clone(),
            outbound_rx,
            inbound_tx,
            rate_limiter: SessionRateLimiter::new(),
        };
        let link = SessionLink {
            outbound_tx,
            inbound_rx,
            cancel,
        };
        (session, link)
    }

    /// Sends `initial`, then runs the writer task and the reader loop until
    /// either ends or the session is cancelled.
    ///
    /// Returns the sink so the caller can close the connection once the room
    /// has been told about the disconnect.
    pub async fn run(self, socket: WebSocket, initial: WsResp) -> (Option<WsSink>, CloseInfo) {
        let Self {
            id,
            player_id,
            cancel,
            outbound_rx,
            inbound_tx,
            rate_limiter,
        } = self;
        let (mut ws_sink, ws_stream) = socket.split();

        if let Err(e) = send_resp(&mut ws_sink, &initial).await {
            warn!(session_id = %id, player_id, error = %e, "Failed to send initial downsync");
            cancel.cancel();
            return (Some(ws_sink), CloseInfo::default());
        }

        let writer = tokio::spawn(write_loop(id, player_id, ws_sink, outbound_rx, cancel.clone()));
        let close = read_loop(id, player_id, ws_stream, inbound_tx, &rate_limiter, &cancel).await;

        cancel.cancel();
        match writer.await {
            Ok(ws_sink) => (Some(ws_sink), close),
            Err(e) => {
                warn!(session_id = %id, player_id, error = %e, "Writer task failed");
                (None, close)
            }
        }
    }
}

/// Room downsyncs to the socket; pending messages are flushed before cancellation wins
async fn write_loop(
    id: Uuid,
    player_id: i32,
    mut ws_sink: WsSink,
    mut outbound_rx: mpsc::Receiver<WsResp>,
    cancel: CancelSignal,
) -> WsSink {
    loop {
        tokio::select! {
            biased;
            resp = outbound_rx.recv() => {
                let Some(resp) = resp else {
                    debug!(session_id = %id, player_id, "Outbound queue closed");
                    break;
                };
                if let Err(e) = send_resp(&mut ws_sink, &resp).await {
                    debug!(session_id = %id, player_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    cancel.cancel();
    ws_sink
}

/// Socket upsyncs to the room
async fn read_loop(
    id: Uuid,
    player_id: i32,
    mut ws_stream: WsStream,
    inbound_tx: mpsc::Sender<WsReq>,
    rate_limiter: &SessionRateLimiter,
    cancel: &CancelSignal,
) -> CloseInfo {
    let mut close = CloseInfo::default();
    loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = cancel.cancelled() => break,
        };
        match frame {
            Some(Ok(Message::Binary(bytes))) => {
                if !rate_limiter.check_upsync() {
                    warn!(session_id = %id, player_id, "Rate limited upsync");
                    continue;
                }
                let req: WsReq = match decode(&bytes) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(session_id = %id, player_id, error = %e, "Dropping malformed upsync");
                        continue;
                    }
                };
                if req.player_id != player_id {
                    warn!(session_id = %id, player_id, claimed = req.player_id, "Upsync for another player");
                    continue;
                }
                match inbound_tx.try_send(req) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session_id = %id, player_id, "Inbound queue full, dropping upsync");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(session_id = %id, player_id, "Room no longer reads upsyncs");
                    }
                }
            }
            Some(Ok(Message::Text(_))) => {
                warn!(session_id = %id, player_id, "Received text message, ignoring");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                info!(session_id = %id, player_id, "Client initiated close");
                if let Some(frame) = frame {
                    close.code = Some(frame.code);
                    close.reason = Some(frame.reason.into_owned());
                }
                break;
            }
            Some(Err(e)) => {
                warn!(session_id = %id, player_id, error = %e, "WebSocket error");
                break;
            }
            None => break,
        }
    }
    close
}

/// Best-effort close, errors mean the peer is already gone
pub async fn close_socket(mut ws_sink: WsSink, close: CloseInfo) {
    let frame = CloseFrame {
        code: close.code.unwrap_or(close_code::NORMAL),
        reason: Cow::Owned(close.reason.unwrap_or_default()),
    };
    let _ = ws_sink.send(Message::Close(Some(frame))).await;
    let _ = ws_sink.close().await;
}

async fn send_resp(ws_sink: &mut WsSink, resp: &WsResp) -> Result<(), String> {
    let bytes = encode(resp).map_err(|e| e.to_string())?;
    ws_sink
        .send(Message::Binary(bytes))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_every_clone() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!signal.is_cancelled());
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn cancelled_stays_pending_until_cancel() {
        let signal = CancelSignal::new();
        let mut waiter = tokio_test::task::spawn(signal.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        signal.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_after_cancel() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn link_queues_connect_both_sides() {
        let (mut session, mut link) = WsSession::new(7);
        link.outbound_tx
            .try_send(WsResp::error(crate::ws::protocol::ErrCode::RoomFull))
            .unwrap();
        assert_eq!(session.outbound_rx.recv().await.unwrap().ret, 4001);

        session.inbound_tx.try_send(WsReq::default()).unwrap();
        assert!(link.inbound_rx.recv().await.is_some());
    }
}
