//! Outbound half of the chat relay, as seen by the call subsystem.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex, mpsc};

/// Sends one raw signal envelope through the chat transport.
///
/// The relay may deliver it to every participant of the room; addressing
/// by `target_id` is enforced by the receiving codec.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send_envelope(
        &self,
        room_id: &str,
        sender_id: &str,
        target_id: Option<&str>,
        raw: String,
    ) -> Result<(), anyhow::Error>;
}

struct Member {
    room_id: String,
    user_id: String,
    inbox: mpsc::UnboundedSender<String>,
}

/// In-memory room relay that broadcasts every envelope to all members of the
/// room, sender included, the way the chat relay does.
#[derive(Default)]
pub struct ChannelRelay {
    members: Mutex<Vec<Member>>,
}

impl ChannelRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `user_id` in `room_id` and get its inbound envelope stream.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.lock().await.push(Member {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            inbox: tx,
        });
        rx
    }

    pub async fn leave(&self, room_id: &str, user_id: &str) {
        self.members
            .lock()
            .await
            .retain(|m| !(m.room_id == room_id && m.user_id == user_id));
    }
}

#[async_trait]
impl SignalTransport for ChannelRelay {
    async fn send_envelope(
        &self,
        room_id: &str,
        sender_id: &str,
        _target_id: Option<&str>,
        raw: String,
    ) -> Result<(), anyhow::Error> {
        let mut members = self.members.lock().await;
        // Receivers that went away are pruned lazily.
        members.retain(|m| !m.inbox.is_closed());
        let mut delivered = 0;
        for member in members.iter().filter(|m| m.room_id == room_id) {
            if member.inbox.send(raw.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(
            "Relayed envelope from {} to {} member(s) of {}",
            sender_id, delivered, room_id
        );
        Ok(())
    }
}
