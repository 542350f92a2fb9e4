//! Client-side WebSocket plumbing

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sigil_core::PeerManager;
use sigil_session::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{ClientError, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;
pub(crate) type WsReader = SplitStream<WsStream>;

/// Dial a ceremony endpoint, mapping HTTP rejections onto typed errors.
pub(crate) async fn connect(url: &str) -> Result<(SharedSink, WsReader)> {
    match connect_async(url).await {
        Ok((stream, _response)) => {
            let (sink, reader) = stream.split();
            Ok((Arc::new(Mutex::new(sink)), reader))
        }
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            Err(ClientError::from_status(response.status().as_u16()))
        }
        Err(err) => Err(ClientError::Transport(err.to_string())),
    }
}

pub(crate) async fn send_envelope(sink: &SharedSink, envelope: &Envelope) -> Result<()> {
    sink.lock()
        .await
        .send(Message::Text(envelope.to_json()))
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))
}

/// Next envelope; `None` when the hub closed the socket.
pub(crate) async fn recv_envelope(reader: &mut WsReader) -> Result<Option<Envelope>> {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return Envelope::from_json(&text).map(Some).map_err(Into::into)
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            Err(err) => return Err(ClientError::Transport(err.to_string())),
        }
    }
    Ok(None)
}

pub(crate) async fn close(sink: &SharedSink) {
    let _ = sink.lock().await.send(Message::Close(None)).await;
}

pub(crate) struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Drain every outbound frame onto the hub socket, regardless of target:
/// the hub routes frames addressed to other participants.
pub(crate) fn spawn_drain_all(
    pm: Arc<PeerManager>,
    sink: SharedSink,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(frame) = pm.next_outbound_any() {
                let Ok(envelope) = Envelope::tss(&frame) else {
                    return;
                };
                if send_envelope(&sink, &envelope).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = pm.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// Wait until every queued frame has been handed to the socket.
pub(crate) async fn flush_outbound(pm: &PeerManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pm.outbound_is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // grace for a frame popped but not yet written
    tokio::time::sleep(Duration::from_millis(100)).await;
}
