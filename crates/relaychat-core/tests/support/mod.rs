//! In-process relay for integration tests.
//!
//! Stores events, answers `REQ` with stored matches then `EOSE`, acks
//! `EVENT` with `OK` and fans new events out to open subscriptions. Each
//! behaviour can be switched off to simulate slow or broken relays.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relaychat_core::nostr_sdk::Event;
use relaychat_core::{Filter, PoolConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct Behavior {
    /// Send `EOSE` after replaying stored events.
    pub end_of_stored: bool,
    /// Answer `EVENT` with `OK`.
    pub ack_events: bool,
    /// Accept (rather than reject) published events.
    pub accept_events: bool,
    /// REQs containing any of these kinds get no replay and no `EOSE`;
    /// they still receive live events.
    pub withhold_kinds: Vec<u16>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            end_of_stored: true,
            ack_events: true,
            accept_events: true,
            withhold_kinds: Vec::new(),
        }
    }
}

struct LiveSubscription {
    connection: usize,
    id: String,
    filters: Vec<Filter>,
}

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    requests: Vec<Vec<Filter>>,
    live: Vec<LiveSubscription>,
    outboxes: HashMap<usize, mpsc::UnboundedSender<String>>,
    next_connection: usize,
    connections_accepted: usize,
}

pub struct MockRelay {
    pub url: String,
    behavior: Behavior,
    state: Arc<Mutex<RelayState>>,
    kill: broadcast::Sender<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::start_with(Behavior::default()).await
    }

    /// Accepts connections but never sends `EOSE` or `OK`.
    pub async fn silent() -> Self {
        Self::start_with(Behavior {
            end_of_stored: false,
            ack_events: false,
            ..Behavior::default()
        })
        .await
    }

    pub async fn start_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(RelayState::default()));
        let (kill, _) = broadcast::channel(4);

        let accept_state = state.clone();
        let accept_behavior = behavior.clone();
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let behavior = accept_behavior.clone();
                let kill = accept_kill.subscribe();
                tokio::spawn(serve_connection(stream, state, behavior, kill));
            }
        });

        Self {
            url,
            behavior,
            state,
            kill,
        }
    }

    pub fn store(&self, event: Event) {
        self.state.lock().events.push(event);
    }

    pub fn stored(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Filters of every `REQ` received so far.
    pub fn requests(&self) -> Vec<Vec<Filter>> {
        self.state.lock().requests.clone()
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.lock().connections_accepted
    }

    /// Drop every open connection.
    pub fn disconnect_all(&self) {
        let _ = self.kill.send(());
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<RelayState>>,
    behavior: Behavior,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let connection = {
        let mut state = state.lock();
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections_accepted += 1;
        state.outboxes.insert(id, tx.clone());
        id
    };

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle(text.as_str(), connection, &tx, &state, &behavior),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let mut state = state.lock();
    state.outboxes.remove(&connection);
    state.live.retain(|sub| sub.connection != connection);
}

fn handle(
    text: &str,
    connection: usize,
    tx: &mpsc::UnboundedSender<String>,
    state: &Arc<Mutex<RelayState>>,
    behavior: &Behavior,
) {
    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
        return;
    };
    match frame.first().and_then(Value::as_str) {
        Some("REQ") => {
            let id = frame[1].as_str().unwrap_or_default().to_string();
            let filters: Vec<Filter> = frame[2..]
                .iter()
                .filter_map(|f| serde_json::from_value(f.clone()).ok())
                .collect();
            let mut state = state.lock();
            state.requests.push(filters.clone());
            let withheld = filters
                .iter()
                .any(|f| f.kinds.iter().any(|k| behavior.withhold_kinds.contains(k)));
            if !withheld {
                for event in state.events.iter().filter(|e| filters.iter().any(|f| f.matches(e))) {
                    let _ = tx.send(json!(["EVENT", id, event]).to_string());
                }
                if behavior.end_of_stored {
                    let _ = tx.send(json!(["EOSE", id]).to_string());
                }
            }
            state.live.retain(|sub| !(sub.connection == connection && sub.id == id));
            state.live.push(LiveSubscription {
                connection,
                id,
                filters,
            });
        }
        Some("CLOSE") => {
            let id = frame[1].as_str().unwrap_or_default();
            state
                .lock()
                .live
                .retain(|sub| !(sub.connection == connection && sub.id == id));
        }
        Some("EVENT") => {
            let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else {
                return;
            };
            let mut state = state.lock();
            if behavior.ack_events {
                let message = if behavior.accept_events { "" } else { "blocked: test relay" };
                let _ = tx.send(json!(["OK", event.id.to_hex(), behavior.accept_events, message]).to_string());
            }
            if !behavior.accept_events {
                return;
            }
            for sub in state.live.iter().filter(|s| s.filters.iter().any(|f| f.matches(&event))) {
                if let Some(out) = state.outboxes.get(&sub.connection) {
                    let _ = out.send(json!(["EVENT", sub.id, event]).to_string());
                }
            }
            state.events.push(event);
        }
        _ => {}
    }
}

/// Pool timings short enough for tests.
pub fn fast_config() -> PoolConfig {
    PoolConfig {
        connect_timeout: Duration::from_secs(2),
        eose_timeout: Duration::from_millis(500),
        publish_timeout: Duration::from_secs(2),
        reconnect_min: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..PoolConfig::default()
    }
}

/// A relay URL nothing listens on.
pub fn unreachable_relay() -> String {
    "ws://127.0.0.1:1".to_string()
}
