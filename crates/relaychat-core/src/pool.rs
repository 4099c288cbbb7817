//! Multi-relay connection pool.
//!
//! One worker task per relay URL owns the websocket. Logical subscriptions are
//! multiplexed over those sockets; events for a subscription are merged from
//! every relay, verified, deduplicated per handle and delivered in arrival
//! order through a [`Subscription`] stream.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use nostr_sdk::{Event, EventId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::dedup::{SeenEvents, DEFAULT_DEDUP_CAPACITY};
use crate::error::{Error, Result};
use crate::event::verify;
use crate::filter::Filter;
use crate::relay::{self, RelayCommand, RelayHandle, RelayStatus};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on a single websocket handshake.
    pub connect_timeout: Duration,
    /// How long a subscription waits for every relay's end-of-stored-events.
    pub eose_timeout: Duration,
    /// How long `publish` waits for a first acknowledgement.
    pub publish_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Ids remembered per subscription for deduplication.
    pub dedup_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            eose_timeout: Duration::from_secs(8),
            publish_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Normalize a relay URL; only `ws://` and `wss://` are accepted.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if !trimmed.starts_with("wss://") && !trimmed.starts_with("ws://") {
        return Err(Error::connection(trimmed, "relay URL must start with ws:// or wss://"));
    }
    let normalized = trimmed.trim_end_matches('/');
    if normalized.ends_with("://") {
        return Err(Error::connection(trimmed, "relay URL has no host"));
    }
    Ok(normalized.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Event(Box<Event>),
    /// Every relay finished replaying stored events, or the wait timed out.
    /// Emitted at most once; later items are live events.
    EndOfStoredEvents,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutput {
    pub event_id: EventId,
    /// First relay that acknowledged the event.
    pub accepted_by: String,
}

struct SharedState {
    /// `None` once the subscription is closed.
    tx: Option<mpsc::UnboundedSender<SubscriptionItem>>,
    seen: SeenEvents,
    waiting_eose: HashSet<String>,
    eose_delivered: bool,
}

/// State shared between a subscription handle and the relay workers feeding it.
pub(crate) struct SubscriptionShared {
    id: SubscriptionId,
    filters: Vec<Filter>,
    state: Mutex<SharedState>,
}

impl SubscriptionShared {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().tx.is_none()
    }

    /// Admit an event received from `relay_url`.
    ///
    /// Filter mismatches, invalid signatures and duplicates are dropped
    /// before they reach the consumer.
    pub(crate) fn deliver(&self, relay_url: &str, event: Box<Event>) {
        if !self.filters.iter().any(|f| f.matches(&event)) {
            debug!("{relay_url}: event {} does not match {}, dropped", event.id, self.id);
            return;
        }
        {
            let state = self.state.lock();
            if state.tx.is_none() || state.seen.contains(&event.id) {
                return;
            }
        }
        if !verify(&event) {
            warn!("{relay_url}: {}", Error::Signature(event.id.to_hex()));
            return;
        }
        let mut state = self.state.lock();
        let Some(tx) = state.tx.clone() else {
            return;
        };
        if state.seen.admit(event.id) {
            let _ = tx.send(SubscriptionItem::Event(event));
        }
    }

    /// Record that `relay_url` has nothing more to replay (EOSE, CLOSED, or
    /// unreachable).
    pub(crate) fn end_of_stored(&self, relay_url: &str) {
        let mut state = self.state.lock();
        state.waiting_eose.remove(relay_url);
        if state.waiting_eose.is_empty() {
            Self::deliver_eose(&mut state);
        }
    }

    fn end_of_stored_timeout(&self) {
        let mut state = self.state.lock();
        if !state.eose_delivered && state.tx.is_some() {
            debug!(
                "{}: {} relay(s) never finished replay, continuing live-only",
                self.id,
                state.waiting_eose.len()
            );
            state.waiting_eose.clear();
            Self::deliver_eose(&mut state);
        }
    }

    fn deliver_eose(state: &mut SharedState) {
        if state.eose_delivered {
            return;
        }
        state.eose_delivered = true;
        if let Some(tx) = &state.tx {
            let _ = tx.send(SubscriptionItem::EndOfStoredEvents);
        }
    }

    /// Stop delivery. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        self.state.lock().tx.take().is_some()
    }
}

/// Cancellable stream of admitted events for one logical subscription.
///
/// Closing (explicitly or by dropping) stops delivery immediately: anything
/// still buffered or arriving later is discarded, and every relay is told to
/// close its side.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
    relays: Vec<String>,
    pool: Weak<PoolInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Next admitted item; `None` once closed.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        if self.shared.is_closed() {
            return None;
        }
        let item = self.rx.recv().await;
        if self.shared.is_closed() {
            return None;
        }
        item
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if !self.shared.close() {
            return;
        }
        self.rx.close();
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.shared.id, &self.relays);
        }
        debug!("{} closed", self.shared.id);
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.shared.is_closed() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if this.shared.is_closed() => Poll::Ready(None),
            other => other,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("relays", &self.relays)
            .finish()
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    relays: Mutex<HashMap<String, RelayHandle>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Weak<SubscriptionShared>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl PoolInner {
    fn release(&self, id: SubscriptionId, relays: &[String]) {
        self.subscriptions.lock().remove(&id);
        let handles = self.relays.lock();
        for url in relays {
            if let Some(handle) = handles.get(url) {
                handle.send(RelayCommand::Unsubscribe(id));
            }
        }
    }
}

/// Explicitly owned relay pool. Cheap to clone; clones share connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                relays: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start a worker for every URL not already connected. Invalid URLs are
    /// logged and skipped; the normalized, accepted URLs are returned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, urls: &[String]) -> Vec<String> {
        let mut accepted = Vec::with_capacity(urls.len());
        if self.inner.shut_down.load(Ordering::Acquire) {
            return accepted;
        }
        let mut relays = self.inner.relays.lock();
        for raw in urls {
            let url = match normalize_relay_url(raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!("skipping relay: {e}");
                    continue;
                }
            };
            let alive = relays.get(&url).is_some_and(RelayHandle::is_alive);
            if !alive {
                info!("opening relay {url}");
                relays.insert(url.clone(), relay::spawn(url.clone(), self.inner.config.clone()));
            }
            if !accepted.contains(&url) {
                accepted.push(url);
            }
        }
        accepted
    }

    /// Subscribe `filters` on every relay in `urls`.
    pub fn subscribe(&self, urls: &[String], filters: Vec<Filter>) -> Subscription {
        let relays = self.open(urls);
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SubscriptionShared {
            id,
            filters,
            state: Mutex::new(SharedState {
                tx: Some(tx),
                seen: SeenEvents::new(self.inner.config.dedup_capacity),
                waiting_eose: relays.iter().cloned().collect(),
                eose_delivered: false,
            }),
        });

        if relays.is_empty() {
            shared.end_of_stored_timeout();
        } else {
            self.inner
                .subscriptions
                .lock()
                .insert(id, Arc::downgrade(&shared));
            {
                let handles = self.inner.relays.lock();
                for url in &relays {
                    if let Some(handle) = handles.get(url) {
                        handle.send(RelayCommand::Subscribe(shared.clone()));
                    }
                }
            }

            let weak = Arc::downgrade(&shared);
            let timeout = self.inner.config.eose_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.end_of_stored_timeout();
                }
            });
        }

        debug!("{id} opened on {} relay(s)", relays.len());
        Subscription {
            shared,
            rx,
            relays,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Collect stored events matching `filters` until every relay signals
    /// end-of-stored-events (bounded by the EOSE timeout), then close.
    pub async fn fetch(&self, urls: &[String], filters: Vec<Filter>) -> Vec<Event> {
        let mut subscription = self.subscribe(urls, filters);
        let mut events = Vec::new();
        while let Some(item) = subscription.recv().await {
            match item {
                SubscriptionItem::Event(event) => events.push(*event),
                SubscriptionItem::EndOfStoredEvents => break,
            }
        }
        subscription.close();
        events
    }

    /// Send `event` to every relay in `urls`; resolves with the first
    /// acknowledgement. Fails only if no relay accepts it in time.
    pub async fn publish(&self, urls: &[String], event: &Event) -> Result<PublishOutput> {
        let relays = self.open(urls);
        let event_id = event.id;
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut waiting: BTreeSet<String> = BTreeSet::new();
        let mut acks = FuturesUnordered::new();

        {
            let handles = self.inner.relays.lock();
            for url in relays {
                let Some(handle) = handles.get(&url) else {
                    failures.insert(url, "relay not open".to_string());
                    continue;
                };
                let (ack, rx) = oneshot::channel();
                handle.send(RelayCommand::Publish {
                    event: Box::new(event.clone()),
                    ack,
                });
                waiting.insert(url.clone());
                acks.push(async move { (url, rx.await) });
            }
        }

        let accepted = tokio::time::timeout(self.inner.config.publish_timeout, async {
            while let Some((url, outcome)) = acks.next().await {
                waiting.remove(&url);
                match outcome {
                    Ok(Ok(())) => return Some(url),
                    Ok(Err(reason)) => {
                        debug!("{url} rejected {event_id}: {reason}");
                        failures.insert(url, reason);
                    }
                    Err(_) => {
                        failures.insert(url, "relay worker stopped".to_string());
                    }
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        if let Some(accepted_by) = accepted {
            info!("published {event_id} (first ack from {accepted_by})");
            return Ok(PublishOutput { event_id, accepted_by });
        }

        for url in waiting {
            failures.insert(url, "timed out waiting for acknowledgement".to_string());
        }
        warn!("publish of {event_id} failed on every relay");
        Err(Error::Publish {
            event_id: event_id.to_hex(),
            failures,
        })
    }

    pub fn relay_status(&self) -> Vec<(String, RelayStatus)> {
        let mut statuses: Vec<_> = self
            .inner
            .relays
            .lock()
            .iter()
            .map(|(url, handle)| (url.clone(), handle.status()))
            .collect();
        statuses.sort();
        statuses
    }

    /// Wait until `url` reports `status`, up to `timeout`.
    pub async fn wait_for_status(&self, url: &str, status: RelayStatus, timeout: Duration) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            return false;
        };
        let receiver = self.inner.relays.lock().get(&url).map(RelayHandle::watch);
        let Some(mut rx) = receiver else {
            return false;
        };
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == status))
            .await
            .is_ok_and(|r| r.is_ok());
        reached
    }

    /// Close every subscription and stop every relay worker.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions: Vec<_> = self.inner.subscriptions.lock().drain().collect();
        for (_, weak) in subscriptions {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        }
        for (url, handle) in self.inner.relays.lock().drain() {
            debug!("stopping relay {url}");
            handle.send(RelayCommand::Shutdown);
        }
        info!("relay pool shut down");
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
