//! Per-relay connection worker.
//!
//! Each relay URL gets one task that owns its websocket. The task connects
//! eagerly when opened, replays active subscriptions on every (re)connect,
//! and reconnects with exponential backoff while subscriptions remain. With
//! nothing to serve it idles until a command needs the socket again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nostr_sdk::Event;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::message::{ClientMessage, RelayMessage};
use crate::pool::{PoolConfig, SubscriptionId, SubscriptionShared};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;
type Ack = oneshot::Sender<std::result::Result<(), String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayStatus {
    Connecting,
    Connected,
    /// Lost or failed; reconnecting after a backoff.
    Disconnected,
    /// Not connected and nothing needs the connection.
    Idle,
    Stopped,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Connecting => "connecting",
            RelayStatus::Connected => "connected",
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Idle => "idle",
            RelayStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub(crate) enum RelayCommand {
    Subscribe(Arc<SubscriptionShared>),
    Unsubscribe(SubscriptionId),
    Publish { event: Box<Event>, ack: Ack },
    Shutdown,
}

pub(crate) struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
    status: watch::Receiver<RelayStatus>,
}

impl RelayHandle {
    pub(crate) fn send(&self, command: RelayCommand) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let RelayCommand::Publish { ack, .. } = command {
                let _ = ack.send(Err("relay worker stopped".to_string()));
            }
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub(crate) fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }
}

pub(crate) fn spawn(url: String, config: PoolConfig) -> RelayHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RelayStatus::Connecting);
    let worker = RelayWorker {
        url,
        config,
        commands: rx,
        subscriptions: HashMap::new(),
        outbox: Vec::new(),
        status: status_tx,
    };
    tokio::spawn(worker.run());
    RelayHandle {
        commands: tx,
        status: status_rx,
    }
}

/// Delay before reconnect attempt number `failures` (0 after a clean drop).
pub(crate) fn backoff_delay(config: &PoolConfig, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    config
        .reconnect_min
        .saturating_mul(factor)
        .min(config.reconnect_max)
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

enum Wake {
    Connect,
    Shutdown,
}

struct RelayWorker {
    url: String,
    config: PoolConfig,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    /// Keyed by wire subscription id.
    subscriptions: HashMap<String, Arc<SubscriptionShared>>,
    /// Publishes accepted while a connection attempt is pending.
    outbox: Vec<(Box<Event>, Ack)>,
    status: watch::Sender<RelayStatus>,
}

impl RelayWorker {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            let _ = self.status.send(RelayStatus::Connecting);
            match self.connect().await {
                Ok(ws) => {
                    failures = 0;
                    let _ = self.status.send(RelayStatus::Connected);
                    info!("connected to {}", self.url);
                    match self.session(ws).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => warn!("{} dropped: {reason}", self.url),
                    }
                }
                Err(reason) => {
                    failures = failures.saturating_add(1);
                    warn!("{} unreachable: {reason}", self.url);
                    self.fail_outbox(&reason);
                    // Nothing more will be replayed from here for now.
                    for sub in self.subscriptions.values() {
                        sub.end_of_stored(&self.url);
                    }
                }
            }

            self.subscriptions.retain(|_, sub| !sub.is_closed());
            if self.subscriptions.is_empty() {
                let _ = self.status.send(RelayStatus::Idle);
                match self.wait_for_work().await {
                    Wake::Connect => continue,
                    Wake::Shutdown => break,
                }
            }

            let _ = self.status.send(RelayStatus::Disconnected);
            let delay = backoff_delay(&self.config, failures);
            debug!("{}: reconnecting in {delay:?}", self.url);
            if !self.sleep_handling_commands(delay).await {
                break;
            }
        }

        self.fail_outbox("relay shut down");
        let _ = self.status.send(RelayStatus::Stopped);
        debug!("{} worker stopped", self.url);
    }

    async fn connect(&self) -> std::result::Result<WsStream, String> {
        match tokio::time::timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no handshake within {:?}", self.config.connect_timeout)),
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut pending: HashMap<String, Ack> = HashMap::new();
        let end = self.session_loop(&mut write, &mut read, &mut pending).await;

        let reason = match &end {
            SessionEnd::Shutdown => "relay shut down".to_string(),
            SessionEnd::Dropped(reason) => format!("connection lost: {reason}"),
        };
        for (_, ack) in pending.drain() {
            let _ = ack.send(Err(reason.clone()));
        }
        end
    }

    async fn session_loop(
        &mut self,
        write: &mut WsWrite,
        read: &mut WsRead,
        pending: &mut HashMap<String, Ack>,
    ) -> SessionEnd {
        self.subscriptions.retain(|_, sub| !sub.is_closed());
        let replay: Vec<_> = self.subscriptions.values().cloned().collect();
        for sub in replay {
            if let Err(reason) = send_req(write, &sub).await {
                return SessionEnd::Dropped(reason);
            }
        }
        for (event, ack) in std::mem::take(&mut self.outbox) {
            if let Err(reason) = send_event(write, &event).await {
                let _ = ack.send(Err(reason.clone()));
                return SessionEnd::Dropped(reason);
            }
            pending.insert(event.id.to_hex(), ack);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(RelayCommand::Shutdown) => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(RelayCommand::Subscribe(sub)) => {
                        let result = send_req(write, &sub).await;
                        self.subscriptions.insert(sub.id().to_string(), sub);
                        if let Err(reason) = result {
                            return SessionEnd::Dropped(reason);
                        }
                    }
                    Some(RelayCommand::Unsubscribe(id)) => {
                        let wire_id = id.to_string();
                        if self.subscriptions.remove(&wire_id).is_some() {
                            let frame = ClientMessage::Close { id: &wire_id }.to_json();
                            if let Err(reason) = send_frame(write, frame).await {
                                return SessionEnd::Dropped(reason);
                            }
                        }
                    }
                    Some(RelayCommand::Publish { event, ack }) => {
                        if let Err(reason) = send_event(write, &event).await {
                            let _ = ack.send(Err(reason.clone()));
                            return SessionEnd::Dropped(reason);
                        }
                        pending.insert(event.id.to_hex(), ack);
                    }
                },
                frame = read.next() => match frame {
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(text.as_str(), pending),
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await.ok();
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return SessionEnd::Dropped("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn handle_frame(&mut self, text: &str, pending: &mut HashMap<String, Ack>) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("{}: ignoring frame: {e}", self.url);
                return;
            }
        };

        match message {
            RelayMessage::Event { subscription_id, event } => {
                match self.subscriptions.get(&subscription_id) {
                    Some(sub) => sub.deliver(&self.url, event),
                    None => debug!("{}: event for unknown subscription {subscription_id}", self.url),
                }
            }
            RelayMessage::EndOfStoredEvents { subscription_id } => {
                if let Some(sub) = self.subscriptions.get(&subscription_id) {
                    sub.end_of_stored(&self.url);
                }
            }
            RelayMessage::Ok { event_id, accepted, message } => {
                if let Some(ack) = pending.remove(&event_id) {
                    let _ = ack.send(if accepted { Ok(()) } else { Err(message) });
                }
            }
            RelayMessage::Closed { subscription_id, message } => {
                warn!("{} closed {subscription_id}: {message}", self.url);
                if let Some(sub) = self.subscriptions.remove(&subscription_id) {
                    sub.end_of_stored(&self.url);
                }
            }
            RelayMessage::Notice { message } => warn!("{} notice: {message}", self.url),
            RelayMessage::Auth { .. } => debug!("{} requested auth, not supported", self.url),
        }
    }

    async fn wait_for_work(&mut self) -> Wake {
        while let Some(command) = self.commands.recv().await {
            match command {
                RelayCommand::Subscribe(sub) => {
                    self.subscriptions.insert(sub.id().to_string(), sub);
                    return Wake::Connect;
                }
                RelayCommand::Publish { event, ack } => {
                    self.outbox.push((event, ack));
                    return Wake::Connect;
                }
                RelayCommand::Unsubscribe(id) => {
                    self.subscriptions.remove(&id.to_string());
                }
                RelayCommand::Shutdown => return Wake::Shutdown,
            }
        }
        Wake::Shutdown
    }

    /// Returns `false` if shut down while sleeping.
    async fn sleep_handling_commands(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(RelayCommand::Shutdown) => return false,
                    Some(RelayCommand::Subscribe(sub)) => {
                        // Replayed by the next connection; until then it has
                        // nothing stored from here.
                        sub.end_of_stored(&self.url);
                        self.subscriptions.insert(sub.id().to_string(), sub);
                    }
                    Some(RelayCommand::Unsubscribe(id)) => {
                        self.subscriptions.remove(&id.to_string());
                    }
                    Some(RelayCommand::Publish { ack, .. }) => {
                        let _ = ack.send(Err("not connected".to_string()));
                    }
                },
            }
        }
    }

    fn fail_outbox(&mut self, reason: &str) {
        for (_, ack) in self.outbox.drain(..) {
            let _ = ack.send(Err(reason.to_string()));
        }
    }
}

async fn send_frame(write: &mut WsWrite, frame: crate::error::Result<String>) -> std::result::Result<(), String> {
    let text = frame.map_err(|e| e.to_string())?;
    write
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn send_req(write: &mut WsWrite, sub: &SubscriptionShared) -> std::result::Result<(), String> {
    let id = sub.id().to_string();
    send_frame(write, ClientMessage::Req { id: &id, filters: sub.filters() }.to_json()).await
}

async fn send_event(write: &mut WsWrite, event: &Event) -> std::result::Result<(), String> {
    send_frame(write, ClientMessage::Event(event).to_json()).await
}
