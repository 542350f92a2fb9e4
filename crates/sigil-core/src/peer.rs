//! Per-ceremony peer routing
//!
//! A `PeerManager` holds the local participant's identifier, the set of
//! remote peers, the FIFO outbound queue of framed primitive messages and the
//! single registered inbound handler. Primitives push outbound frames with
//! [`PeerManager::must_send`]; the session's drain task awaits
//! [`PeerManager::notified`] and pulls with the `next_outbound` variants, so
//! no task ever polls an empty queue.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::{Error, Result};

/// A primitive message framed with its source and destination participants.
///
/// The hub routes on `to`: frames addressed to it are consumed by its own
/// primitive, all others are re-queued towards the addressed peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub from: String,
    pub to: String,
    #[serde(with = "body_hex")]
    pub body: Vec<u8>,
}

mod body_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

type InboundHandler = Box<dyn Fn(&str, &[u8]) -> Result<()> + Send + Sync>;

/// Router for one ceremony's message traffic
pub struct PeerManager {
    id: String,
    peers: Mutex<BTreeSet<String>>,
    outbound: Mutex<VecDeque<RelayFrame>>,
    handler: Mutex<Option<InboundHandler>>,
    notify: Notify,
}

impl PeerManager {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peers: Mutex::new(BTreeSet::new()),
            outbound: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.id
    }

    /// Add a remote peer; idempotent.
    pub fn add_peer(&self, peer_id: impl Into<String>) {
        self.peers.lock().expect("peer set lock").insert(peer_id.into());
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("peer set lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn num_peers(&self) -> u32 {
        self.peers.lock().expect("peer set lock").len() as u32
    }

    /// Enqueue an outbound primitive message for a target peer.
    pub fn must_send(&self, to: impl Into<String>, body: Vec<u8>) {
        self.requeue(RelayFrame {
            from: self.id.clone(),
            to: to.into(),
            body,
        });
    }

    /// Re-queue a frame that is in transit through this participant.
    pub fn requeue(&self, frame: RelayFrame) {
        self.outbound.lock().expect("outbound lock").push_back(frame);
        // notify_one stores a permit, so a drain task that has not yet parked
        // still observes a send that raced ahead of it.
        self.notify.notify_one();
    }

    /// Dequeue the oldest outbound frame addressed to `to`, preserving the
    /// relative order of all other frames.
    pub fn next_outbound(&self, to: &str) -> Option<RelayFrame> {
        let mut queue = self.outbound.lock().expect("outbound lock");
        let position = queue.iter().position(|frame| frame.to == to)?;
        queue.remove(position)
    }

    /// Dequeue the oldest outbound frame regardless of target.
    pub fn next_outbound_any(&self) -> Option<RelayFrame> {
        self.outbound.lock().expect("outbound lock").pop_front()
    }

    /// Whether any frame is still queued.
    pub fn outbound_is_empty(&self) -> bool {
        self.outbound.lock().expect("outbound lock").is_empty()
    }

    /// Whether any frame is still queued for `to`.
    pub fn has_outbound(&self, to: &str) -> bool {
        self.outbound
            .lock()
            .expect("outbound lock")
            .iter()
            .any(|frame| frame.to == to)
    }

    /// Wait until new outbound frames may be available.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Install the inbound handler. Exactly one handler per ceremony.
    pub fn register_inbound<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let mut slot = self.handler.lock().expect("handler lock");
        if slot.is_some() {
            return Err(Error::InvalidConfig(
                "inbound handler already registered".into(),
            ));
        }
        *slot = Some(Box::new(handler));
        Ok(())
    }

    /// Deliver an inbound primitive message to the registered handler.
    pub fn handle_inbound(&self, from: &str, body: &[u8]) -> Result<()> {
        let slot = self.handler.lock().expect("handler lock");
        let handler = slot
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no inbound handler registered".into()))?;
        handler(from, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn outbound_is_fifo_per_target() {
        let pm = PeerManager::new("server");
        pm.add_peer("a");
        pm.add_peer("b");

        pm.must_send("a", vec![1]);
        pm.must_send("b", vec![2]);
        pm.must_send("a", vec![3]);

        assert_eq!(pm.next_outbound("a").unwrap().body, vec![1]);
        assert_eq!(pm.next_outbound("a").unwrap().body, vec![3]);
        assert!(pm.next_outbound("a").is_none());
        assert_eq!(pm.next_outbound("b").unwrap().body, vec![2]);
    }

    #[test]
    fn next_outbound_any_pops_oldest() {
        let pm = PeerManager::new("client");
        pm.must_send("server", vec![1]);
        pm.must_send("other", vec![2]);

        let first = pm.next_outbound_any().unwrap();
        assert_eq!((first.to.as_str(), first.body), ("server", vec![1]));
        let second = pm.next_outbound_any().unwrap();
        assert_eq!((second.to.as_str(), second.body), ("other", vec![2]));
        assert!(pm.next_outbound_any().is_none());
    }

    #[test]
    fn add_peer_is_idempotent() {
        let pm = PeerManager::new("server");
        pm.add_peer("client");
        pm.add_peer("client");
        assert_eq!(pm.num_peers(), 1);
    }

    #[test]
    fn single_handler_and_dispatch() {
        let pm = PeerManager::new("server");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        pm.register_inbound(move |from, body| {
            assert_eq!(from, "client");
            assert_eq!(body, [7u8]);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert!(pm.register_inbound(|_, _| Ok(())).is_err());

        pm.handle_inbound("client", &[7]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn must_send_wakes_drain_task() {
        let pm = Arc::new(PeerManager::new("server"));
        let drain = Arc::clone(&pm);
        let handle = tokio::spawn(async move {
            loop {
                if let Some(frame) = drain.next_outbound_any() {
                    return frame;
                }
                drain.notified().await;
            }
        });

        tokio::task::yield_now().await;
        pm.must_send("client", vec![42]);
        let frame = handle.await.unwrap();
        assert_eq!(frame.body, vec![42]);
    }

    #[test]
    fn concurrent_send_and_drain() {
        let pm = Arc::new(PeerManager::new("server"));
        let writer = Arc::clone(&pm);
        let producer = std::thread::spawn(move || {
            for i in 0..100u8 {
                writer.must_send("client", vec![i]);
            }
        });

        let mut drained = Vec::new();
        while drained.len() < 100 {
            if let Some(frame) = pm.next_outbound("client") {
                drained.push(frame.body[0]);
            }
        }
        producer.join().unwrap();
        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(drained, expected);
    }
}
