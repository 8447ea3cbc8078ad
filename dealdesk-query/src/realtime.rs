//! Realtime bridge.
//!
//! Subscribes to the backend's row-change feed and turns matching change
//! payloads into invalidations. Payload rows are never merged into the cache;
//! the refetch that follows the invalidation is the only path for server data.
//!
//! Channels are reference counted by name. Subscribing to a live channel
//! reuses it, and the transport is told to unsubscribe exactly once, when the
//! last [`SubscriptionHandle`] goes away. A channel the transport dropped is
//! `Disconnected` until the next subscribe opens it again.

use async_trait::async_trait;
use dealdesk_core::{DealDeskResult, RealtimeError, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{KeyFilter, QueryCache};
use crate::events::CacheEvent;
use crate::invalidation::FanOut;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// One row change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub event: ChangeEvent,
    pub schema: String,
    pub table: TableName,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl ChangePayload {
    /// The row the change describes: `new`, or `old` for deletes.
    pub fn row(&self) -> Option<&Value> {
        match self.event {
            ChangeEvent::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }
}

/// Which change payloads a channel reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: TableName,
    /// `None` matches every event kind.
    pub event: Option<ChangeEvent>,
    /// Optional `column = value` condition on the changed row.
    pub column_eq: Option<(String, Value)>,
}

impl ChangeFilter {
    pub fn new(schema: impl Into<String>, table: TableName) -> Self {
        Self {
            schema: schema.into(),
            table,
            event: None,
            column_eq: None,
        }
    }

    pub fn on(mut self, event: ChangeEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.column_eq = Some((column.into(), value));
        self
    }

    pub fn matches(&self, payload: &ChangePayload) -> bool {
        if payload.schema != self.schema || payload.table != self.table {
            return false;
        }
        if self.event.is_some_and(|event| event != payload.event) {
            return false;
        }
        match &self.column_eq {
            None => true,
            Some((column, expected)) => payload
                .row()
                .and_then(|row| row.get(column))
                .is_some_and(|actual| actual == expected),
        }
    }
}

/// A named channel and the cache keys its changes invalidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub filter: ChangeFilter,
    pub invalidates: Vec<KeyFilter>,
    pub refetch_active: bool,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, filter: ChangeFilter) -> Self {
        Self {
            name: name.into(),
            filter,
            invalidates: Vec::new(),
            refetch_active: true,
        }
    }

    pub fn invalidates(mut self, filter: KeyFilter) -> Self {
        self.invalidates.push(filter);
        self
    }

    pub fn with_refetch_active(mut self, refetch_active: bool) -> Self {
        self.refetch_active = refetch_active;
        self
    }
}

/// Delivers row-change payloads for named channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open `channel`. Payloads arrive on the returned receiver until the
    /// transport closes it or `unsubscribe` is called.
    async fn subscribe(
        &self,
        channel: &str,
        filter: &ChangeFilter,
    ) -> DealDeskResult<mpsc::Receiver<ChangePayload>>;

    fn unsubscribe(&self, channel: &str);
}

/// Connection state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Subscribing,
    Subscribed,
}

/// Result of the transport subscribe that subscribers of a `Subscribing`
/// channel wait on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Opening {
    Pending,
    Open,
    Failed(String),
}

struct ChannelSlot {
    /// Identifies this slot; handles from a removed slot never touch a newer
    /// one with the same name.
    epoch: u64,
    refs: usize,
    state: ChannelState,
    listener: Option<JoinHandle<()>>,
    opening: watch::Receiver<Opening>,
}

enum Step {
    Join(watch::Receiver<Opening>),
    Open(watch::Sender<Opening>),
}

struct BridgeInner {
    cache: QueryCache,
    transport: Arc<dyn RealtimeTransport>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    next_epoch: AtomicU64,
}

impl BridgeInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelSlot>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, channel: &str, epoch: u64) {
        let finished = {
            let mut channels = self.lock();
            let Some(slot) = channels.get_mut(channel).filter(|slot| slot.epoch == epoch) else {
                debug!(channel = channel, epoch = epoch, "Released handle of a closed channel");
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs > 0 {
                debug!(channel = channel, refs = slot.refs, "Released channel handle");
                return;
            }
            channels.remove(channel)
        };
        let Some(slot) = finished else {
            return;
        };
        let was_connected = slot.state == ChannelState::Subscribed;
        if let Some(listener) = slot.listener {
            listener.abort();
            self.transport.unsubscribe(channel);
        }
        if was_connected {
            info!(channel = channel, "Realtime channel closed");
            self.cache.events().publish(CacheEvent::ChannelDisconnected {
                channel: channel.to_string(),
            });
        }
    }

    fn mark_disconnected(&self, channel: &str, epoch: u64) -> bool {
        match self.lock().get_mut(channel) {
            Some(slot) if slot.epoch == epoch && slot.state != ChannelState::Disconnected => {
                slot.state = ChannelState::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// A subscribe attempt ended without opening the channel.
    fn abandon_open(&self, channel: &str, epoch: u64) {
        if let Some(slot) = self.lock().get_mut(channel) {
            if slot.epoch == epoch && slot.state == ChannelState::Subscribing {
                slot.state = ChannelState::Disconnected;
            }
        }
    }
}

/// Resets a `Subscribing` slot if the subscribe future is dropped or fails.
struct OpenGuard<'a> {
    inner: &'a BridgeInner,
    channel: &'a str,
    epoch: u64,
    settled: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon_open(self.channel, self.epoch);
        }
    }
}

/// Connects realtime channels to cache invalidation.
#[derive(Clone)]
pub struct RealtimeBridge {
    inner: Arc<BridgeInner>,
}

impl RealtimeBridge {
    pub fn new(cache: QueryCache, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                cache,
                transport,
                channels: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to `spec.name`.
    ///
    /// An open channel is reused. While another caller's subscribe is in
    /// flight this waits for it and shares its outcome. A channel the
    /// transport dropped is subscribed again.
    pub async fn subscribe(&self, spec: ChannelSpec) -> DealDeskResult<SubscriptionHandle> {
        let name = spec.name.clone();
        let (handle, step) = {
            let mut channels = self.inner.lock();
            match channels.get_mut(&name) {
                Some(slot) => {
                    slot.refs += 1;
                    let handle = self.handle(name.clone(), slot.epoch);
                    match slot.state {
                        ChannelState::Subscribed => {
                            debug!(channel = %name, refs = slot.refs, "Reusing realtime channel");
                            return Ok(handle);
                        }
                        ChannelState::Subscribing => (handle, Step::Join(slot.opening.clone())),
                        ChannelState::Disconnected => {
                            let (ready, opening) = watch::channel(Opening::Pending);
                            if let Some(stale) = slot.listener.take() {
                                stale.abort();
                            }
                            slot.state = ChannelState::Subscribing;
                            slot.opening = opening;
                            (handle, Step::Open(ready))
                        }
                    }
                }
                None => {
                    let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let (ready, opening) = watch::channel(Opening::Pending);
                    channels.insert(
                        name.clone(),
                        ChannelSlot {
                            epoch,
                            refs: 1,
                            state: ChannelState::Subscribing,
                            listener: None,
                            opening,
                        },
                    );
                    (self.handle(name.clone(), epoch), Step::Open(ready))
                }
            }
        };

        match step {
            Step::Join(opening) => Self::join(handle, opening).await,
            Step::Open(ready) => self.open(spec, handle, ready).await,
        }
    }

    async fn join(
        handle: SubscriptionHandle,
        mut opening: watch::Receiver<Opening>,
    ) -> DealDeskResult<SubscriptionHandle> {
        debug!(channel = %handle.channel, "Waiting for in-flight subscribe");
        let outcome = opening
            .wait_for(|outcome| *outcome != Opening::Pending)
            .await
            .map(|outcome| (*outcome).clone());
        let channel = handle.channel.clone();
        match outcome {
            Ok(Opening::Open) => Ok(handle),
            Ok(Opening::Failed(reason)) => {
                Err(RealtimeError::SubscribeFailed { channel, reason }.into())
            }
            _ => Err(RealtimeError::ChannelClosed { channel }.into()),
        }
    }

    async fn open(
        &self,
        spec: ChannelSpec,
        handle: SubscriptionHandle,
        ready: watch::Sender<Opening>,
    ) -> DealDeskResult<SubscriptionHandle> {
        let name = spec.name.clone();
        let epoch = handle.epoch;
        let mut guard = OpenGuard {
            inner: &self.inner,
            channel: &name,
            epoch,
            settled: false,
        };

        info!(channel = %name, table = %spec.filter.table, "Subscribing to realtime channel");
        let rx = match self.inner.transport.subscribe(&name, &spec.filter).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(channel = %name, error = %err, "Realtime subscribe failed");
                drop(guard);
                ready.send_replace(Opening::Failed(err.to_string()));
                return Err(err);
            }
        };

        let listener = self.spawn_listener(spec, epoch, rx);
        let orphaned = {
            let mut channels = self.inner.lock();
            match channels.get_mut(&name).filter(|slot| slot.epoch == epoch) {
                Some(slot) => {
                    // The listener may already have seen the transport close.
                    if slot.state == ChannelState::Subscribing {
                        slot.state = ChannelState::Subscribed;
                    }
                    slot.listener = Some(listener);
                    None
                }
                None => Some(listener),
            }
        };
        if let Some(listener) = orphaned {
            listener.abort();
            self.inner.transport.unsubscribe(&name);
            drop(guard);
            ready.send_replace(Opening::Failed("channel released while subscribing".to_string()));
            return Err(RealtimeError::ChannelClosed { channel: name }.into());
        }
        guard.settled = true;
        drop(guard);
        ready.send_replace(Opening::Open);

        self.inner.cache.events().publish(CacheEvent::ChannelSubscribed {
            channel: name,
        });
        Ok(handle)
    }

    fn handle(&self, channel: String, epoch: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            bridge: Arc::clone(&self.inner),
            channel,
            epoch,
            released: false,
        }
    }

    fn spawn_listener(
        &self,
        spec: ChannelSpec,
        epoch: u64,
        mut rx: mpsc::Receiver<ChangePayload>,
    ) -> JoinHandle<()> {
        let cache = self.inner.cache.clone();
        let bridge: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let fan_out =
                FanOut::new(spec.invalidates.iter().cloned()).with_refetch_active(spec.refetch_active);
            while let Some(payload) = rx.recv().await {
                if !spec.filter.matches(&payload) {
                    debug!(channel = %spec.name, table = %payload.table, "Ignoring unrelated change");
                    continue;
                }
                let report = fan_out.run(&cache).await;
                debug!(
                    channel = %spec.name,
                    event = ?payload.event,
                    invalidated = report.invalidated.len(),
                    "Realtime change invalidated cache"
                );
                cache.events().publish(CacheEvent::RealtimeInvalidated {
                    channel: spec.name.clone(),
                    table: payload.table,
                    keys: report.invalidated.len(),
                });
            }

            let disconnected = bridge
                .upgrade()
                .is_some_and(|inner| inner.mark_disconnected(&spec.name, epoch));
            if disconnected {
                warn!(channel = %spec.name, "Realtime channel closed by transport");
                cache.events().publish(CacheEvent::ChannelDisconnected {
                    channel: spec.name.clone(),
                });
            }
        })
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.inner
            .lock()
            .get(channel)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Live handles on `channel`.
    pub fn ref_count(&self, channel: &str) -> usize {
        self.inner.lock().get(channel).map_or(0, |slot| slot.refs)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("channels", &self.channels())
            .finish_non_exhaustive()
    }
}

/// RAII handle on one realtime channel.
pub struct SubscriptionHandle {
    bridge: Arc<BridgeInner>,
    channel: String,
    epoch: u64,
    released: bool,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Release this handle now instead of on drop.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.bridge.release(&self.channel, self.epoch);
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel)
            .field("epoch", &self.epoch)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}
