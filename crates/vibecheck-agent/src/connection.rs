//! WebSocket connection supervisor.
//!
//! Owns the socket for its lifetime: on open it announces the session,
//! starts the keepalive timer, and routes inbound frames to the dispatcher;
//! on any close or error it tears down and reconnects after a fixed delay,
//! forever, until the process receives a termination signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vibecheck_shared::protocol::AgentMessage;

use crate::agent::Agent;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Fire-and-forget sender for outbound protocol messages.
///
/// Sends are best-effort: while the socket is down, messages are dropped
/// silently rather than queued.
#[derive(Clone, Default)]
pub struct Outbound {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outbound that is never attached to a socket; used by tests.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn send(&self, msg: &AgentMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "cannot serialize outbound message");
                return;
            }
        };
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => {
                let _ = tx.send(Message::Text(json));
            }
            None => debug!("socket closed, outbound message dropped"),
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.tx.lock().unwrap() = Some(tx);
    }

    fn detach(&self) {
        *self.tx.lock().unwrap() = None;
    }
}

/// Connect-and-dispatch loop. Returns only when `shutdown` fires.
pub async fn run(agent: Arc<Agent>, outbound: Outbound, shutdown: CancellationToken) {
    let url = agent.config().connect_url();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        debug!("connecting to relay");
        let connected = tokio::select! {
            r = time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())) => r,
            _ = shutdown.cancelled() => break,
        };

        let ws_stream = match connected {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "relay connection failed");
                if wait_reconnect(&shutdown).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                warn!("relay connection timed out ({}s)", CONNECT_TIMEOUT.as_secs());
                if wait_reconnect(&shutdown).await {
                    break;
                }
                continue;
            }
        };

        info!("connected to relay");
        let (mut write, mut read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        outbound.attach(send_tx);

        // Announce the working directory and any resumable session.
        outbound.send(&agent.session_sync_message());

        let write_task = async {
            while let Some(msg) = send_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        };

        let ping_outbound = outbound.clone();
        let ping_task = async {
            let mut interval = time::interval(PING_INTERVAL);
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                ping_outbound.send(&AgentMessage::Ping);
            }
        };

        let read_agent = agent.clone();
        let read_task = async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => read_agent.clone().handle_frame(&text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "socket read error");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = write_task => {},
            _ = read_task => {},
            _ = ping_task => {},
            _ = shutdown.cancelled() => {
                outbound.detach();
                break;
            }
        }

        outbound.detach();
        warn!("relay connection closed");

        if wait_reconnect(&shutdown).await {
            break;
        }
    }

    info!("connection loop stopped");
}

/// Sleep the reconnect delay; true means shutdown fired meanwhile.
async fn wait_reconnect(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = time::sleep(RECONNECT_DELAY) => false,
        _ = shutdown.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_outbound_drops_silently() {
        let outbound = Outbound::detached();
        outbound.send(&AgentMessage::Ping);
    }

    #[test]
    fn attached_outbound_delivers_serialized_frames() {
        let outbound = Outbound::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        outbound.attach(tx);
        outbound.send(&AgentMessage::Pong);
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text, r#"{"type":"pong"}"#),
            other => panic!("unexpected frame: {other:?}"),
        }
        outbound.detach();
        outbound.send(&AgentMessage::Pong);
        assert!(rx.try_recv().is_err());
    }
}
