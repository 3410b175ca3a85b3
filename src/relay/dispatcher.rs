use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::rooms::RoomRegistry;
use super::types::{ConnectionId, RelayError, RelayMessage, RoomId, WriteFailure};

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failures: Vec<RelayError>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fans a message out to every other member of a room
#[derive(Debug, Clone)]
pub struct Dispatcher {
    rooms: Arc<RoomRegistry>,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }

    /// Best-effort delivery to `members(room) \ {sender}`. Sends never block:
    /// a full or closed queue is recorded as a failure for that member only.
    pub fn broadcast(
        &self,
        room: &RoomId,
        sender: ConnectionId,
        message: &RelayMessage,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        self.rooms.for_each_member(room, |member, tx| {
            if member == sender {
                return;
            }
            match tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    let reason = match e {
                        TrySendError::Full(_) => WriteFailure::Backpressure,
                        TrySendError::Closed(_) => WriteFailure::Closed,
                    };
                    let err = RelayError::TransportWrite {
                        peer: member,
                        reason,
                    };
                    warn!("{}", err);
                    report.failures.push(err);
                }
            }
        });

        debug!(
            "Relayed {} bytes from {} in room {} to {} peers",
            message.len(),
            sender,
            room,
            report.delivered
        );
        report
    }
}
