//! Per-session WebSocket plumbing
//!
//! Every ceremony session runs the same small task set: the handler's own
//! read loop, a drain task pulling the peer manager's outbound queue onto
//! the socket, and the ceremony service future, all sharing one
//! cancellation signal and the session deadline. The drain wakes on the
//! peer manager's notifier rather than polling a sleep loop.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sigil_core::PeerManager;
use sigil_session::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SvcError};

/// Write half of a session socket, shared by the drain task and the handler
pub(crate) type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub(crate) fn split_socket(socket: WebSocket) -> (SharedSink, SplitStream<WebSocket>) {
    let (sink, stream) = socket.split();
    (Arc::new(Mutex::new(sink)), stream)
}

pub(crate) async fn send_envelope(sink: &SharedSink, envelope: &Envelope) -> Result<()> {
    sink.lock()
        .await
        .send(Message::Text(envelope.to_json()))
        .await
        .map_err(|_| SvcError::TransportClosed)
}

/// Next envelope off the socket; `None` when the peer closed.
pub(crate) async fn recv_envelope(stream: &mut SplitStream<WebSocket>) -> Result<Option<Envelope>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return Envelope::from_json(&text).map(Some).map_err(Into::into)
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            Err(_) => return Err(SvcError::TransportClosed),
        }
    }
    Ok(None)
}

pub(crate) async fn close_normal(sink: &SharedSink) {
    let _ = sink
        .lock()
        .await
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;
}

pub(crate) async fn close_error(sink: &SharedSink) {
    let _ = sink
        .lock()
        .await
        .send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: "".into(),
        })))
        .await;
}

/// Session-wide cancellation: triggers on deadline, fatal error or drop.
pub(crate) struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Drain frames addressed to `target` onto the socket as `tss` envelopes.
pub(crate) fn spawn_drain(
    pm: Arc<PeerManager>,
    target: String,
    sink: SharedSink,
    mut cancel: watch::Receiver<bool>,
    errs: mpsc::Sender<SvcError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(frame) = pm.next_outbound(&target) {
                let envelope = match Envelope::tss(&frame) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        let _ = errs.send(err.into()).await;
                        return;
                    }
                };
                if send_envelope(&sink, &envelope).await.is_err() {
                    let _ = errs.send(SvcError::TransportClosed).await;
                    return;
                }
            }
            tokio::select! {
                _ = pm.notified() => {}
                // Two drain tasks can share one peer manager during
                // share-adding; the tick covers a wakeup claimed by the
                // other one.
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!(peer = %target, "drain task cancelled");
                        return;
                    }
                }
            }
        }
    })
}

/// Wait until the queue for `target` has been handed to the socket.
pub(crate) async fn flush_outbound(pm: &PeerManager, target: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while pm.has_outbound(target) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // grace for a frame popped but not yet written
    tokio::time::sleep(Duration::from_millis(100)).await;
}
