use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::Relay;
use super::session::{Keepalive, Session};
use super::types::{RelayError, RelayMessage, RoomId};
use crate::config::RelayConfig;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Pause after a failed accept (e.g. fd exhaustion) before retrying
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct RelayServer {
    listener: TcpListener,
    relay: Relay,
    config: Arc<RelayConfig>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            relay: Relay::new(),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the registries this server feeds
    pub fn relay(&self) -> Relay {
        self.relay.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let relay = self.relay.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, relay, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Relay,
    config: Arc<RelayConfig>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut room: Option<RoomId> = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match RoomId::from_query(req.uri().query()) {
            Ok(id) => {
                room = Some(id);
                Ok(resp)
            }
            Err(e) => Err(reject(&e)),
        }
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Rejected connection from {}: {}", addr, e);
            return Ok(());
        }
    };
    let Some(room) = room else {
        return Err(RelayError::EstablishmentRejected("missing room token").into());
    };
    let (ws_tx, ws_rx) = ws_stream.split();

    let (tx, rx) = mpsc::channel::<RelayMessage>(config.outbound_capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let send_timeout = config.send_timeout();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, ctrl_rx, send_timeout));

    let session = Session::establish(&relay, room, tx);
    let id = session.id();
    info!("WebSocket connection {} from {} in room {}", id, addr, session.room());

    let keepalive = config.ping_interval().map(|interval| Keepalive {
        interval,
        timeout: config.pong_timeout(),
        control: ctrl_tx,
    });

    match session.run(ws_rx, keepalive).await {
        Ok(()) => info!("WebSocket disconnected: {} ({})", id, addr),
        Err(e) => warn!("WebSocket {} ({}) closed: {}", id, addr, e),
    }

    // the writer exits once both of its queues are released
    if tokio::time::timeout(send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!("{:?}", relay.stats());

    Ok(())
}

async fn write_loop(
    mut ws_tx: WsSink,
    mut rx: mpsc::Receiver<RelayMessage>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
    send_timeout: Duration,
) {
    loop {
        let msg = tokio::select! {
            Some(msg) = rx.recv() => Message::from(msg),
            Some(ctrl_msg) = ctrl_rx.recv() => ctrl_msg,
            else => break,
        };

        match tokio::time::timeout(send_timeout, ws_tx.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("WebSocket write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("WebSocket write stalled for {:?}, dropping peer", send_timeout);
                break;
            }
        }
    }

    // closing the receiver makes later fan-out attempts fail fast
    rx.close();
    let _ = tokio::time::timeout(send_timeout, ws_tx.close()).await;
}

fn reject(err: &RelayError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
