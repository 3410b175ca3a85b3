use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::{Bytes, Error as WsError, Message};
use tracing::{debug, info, warn};

use super::Relay;
use super::dispatcher::DeliveryReport;
use super::types::{ConnectionId, PeerSender, RelayError, RelayMessage, RoomId};

/// Where a session is in its lifetime. Connecting happens in the transport
/// before a `Session` exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joined,
    Receiving,
    Closing,
    Closed,
}

/// Server-initiated ping settings for one session
#[derive(Debug)]
pub struct Keepalive {
    /// Must be non-zero
    pub interval: Duration,
    pub timeout: Duration,
    /// Control frames for the connection's writer
    pub control: mpsc::UnboundedSender<Message>,
}

/// One participant, from room join to teardown
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    room: RoomId,
    relay: Relay,
    state: SessionState,
}

impl Session {
    /// Register a fresh connection and join it to `room`.
    pub fn establish(relay: &Relay, room: RoomId, outbound: PeerSender) -> Self {
        let id = loop {
            let id = ConnectionId::generate();
            if relay.connections().register(id) {
                break id;
            }
        };
        relay.rooms().join(&room, id, outbound);

        Self {
            id,
            room,
            relay: relay.clone(),
            state: SessionState::Joined,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relay `message` to the rest of this session's room. A closed session
    /// is no longer a member and delivers nothing.
    pub fn dispatch(&self, message: &RelayMessage) -> DeliveryReport {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            debug!("Dropping message from closed session {}", self.id);
            return DeliveryReport::default();
        }
        self.relay.dispatcher().broadcast(&self.room, self.id, message)
    }

    /// Pump `inbound` until the peer goes away, then clean up. A close frame
    /// or end of stream is a clean exit; anything else is a read failure.
    pub async fn run<S>(
        mut self,
        mut inbound: S,
        keepalive: Option<Keepalive>,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        self.state = SessionState::Receiving;
        let outcome = self.receive_loop(&mut inbound, keepalive).await;
        self.close();
        outcome
    }

    async fn receive_loop<S>(
        &self,
        inbound: &mut S,
        keepalive: Option<Keepalive>,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let (mut ticker, control, pong_timeout) = match keepalive {
            Some(k) => (
                Some(tokio::time::interval(k.interval)),
                Some(k.control),
                k.timeout,
            ),
            None => (None, None, Duration::ZERO),
        };
        let mut waiting_for_pong = false;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let pong_expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = next_tick(&mut ticker) => {
                    if waiting_for_pong {
                        warn!("No Pong received, disconnecting {}", self.id);
                        return Err(RelayError::TransportRead("keepalive timeout".to_string()));
                    }
                    let sent = control
                        .as_ref()
                        .is_some_and(|tx| tx.send(Message::Ping(Bytes::new())).is_ok());
                    if !sent {
                        return Err(RelayError::TransportRead("writer closed".to_string()));
                    }
                    waiting_for_pong = true;
                    pong_deadline = Some(Instant::now() + pong_timeout);
                    debug!("Ping sent to {}", self.id);
                }

                _ = pong_expired => {
                    warn!("Pong timeout, disconnecting {}", self.id);
                    return Err(RelayError::TransportRead("keepalive timeout".to_string()));
                }

                frame = inbound.next() => {
                    match frame {
                        Some(Ok(Message::Pong(_))) => {
                            waiting_for_pong = false;
                            pong_deadline = None;
                            debug!("Pong received from {}", self.id);
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Close received from {}", self.id);
                            return Ok(());
                        }
                        Some(Ok(frame)) => {
                            if let Some(message) = RelayMessage::from_frame(frame) {
                                self.dispatch(&message);
                            }
                        }
                        Some(Err(e)) => return Err(RelayError::TransportRead(e.to_string())),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Leave the room and deregister. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        // dropping the registry's sender lets the writer drain and close
        let left = self.relay.rooms().leave(&self.room, self.id);
        let deregistered = self.relay.connections().deregister(self.id);
        debug!(
            "Session {} closed (left room: {}, deregistered: {})",
            self.id, left, deregistered
        );

        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
