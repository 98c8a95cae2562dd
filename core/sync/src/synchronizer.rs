//! Shared state synchronizer: one replica of [`SharedState`] per window.
//!
//! Local mutations are applied immediately and then broadcast; mutations
//! from sibling windows are applied with the same reducer. A newly opened
//! window asks its siblings for a snapshot so it does not start from the
//! empty session state.
//!
//! Every message carries its sender's sequence number. A snapshot carries the
//! highest sequence number the responder had applied from each window, so the
//! newcomer replays exactly the mutations the snapshot does not contain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_common::{Listeners, ResourceId, Result, Subscription, WindowId};

use crate::channel::BroadcastChannel;
use crate::message::{Envelope, Payload};
use crate::mutation::Mutation;
use crate::state::{ServiceEntry, SharedState};

/// A mutation applied before the replica was initialized.
struct Applied {
    sender: WindowId,
    seq: u64,
    mutation: Mutation,
}

/// Per-window replica of the shared session state.
///
/// Lock order: `pre_init`, then `state`, then `last_seen`.
pub struct SharedStateSync {
    window: WindowId,
    channel: Arc<dyn BroadcastChannel>,
    /// Also held for writing while a message is published, so sequence
    /// numbers leave this window in order.
    state: RwLock<SharedState>,
    listeners: Listeners<SharedState>,
    next_seq: AtomicU64,
    /// Highest sequence number applied per sibling window.
    last_seen: Mutex<HashMap<WindowId, u64>>,
    /// Set once this window holds the session state (snapshot adopted, or
    /// no sibling answered).
    initialized: AtomicBool,
    /// Local and remote mutations applied before initialization, in order.
    pre_init: Mutex<Vec<Applied>>,
    adopted: Notify,
}

impl SharedStateSync {
    /// Create a replica publishing on `channel`.
    ///
    /// The replica starts uninitialized; call [`SharedStateSync::join`] (or
    /// [`SharedStateSync::mark_initialized`] for a standalone window).
    pub fn new(channel: Arc<dyn BroadcastChannel>) -> Self {
        Self {
            window: WindowId::generate(),
            channel,
            state: RwLock::new(SharedState::new()),
            listeners: Listeners::new(),
            next_seq: AtomicU64::new(1),
            last_seen: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            pre_init: Mutex::new(Vec::new()),
            adopted: Notify::new(),
        }
    }

    /// This window's id.
    pub fn window_id(&self) -> WindowId {
        self.window
    }

    /// Name of the channel this replica publishes on.
    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Whether this replica holds the session state.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Treat this replica as the session's authoritative starting point.
    pub fn mark_initialized(&self) {
        self.finish_init(None);
    }

    /// Mark the replica initialized, adopting `snapshot` if given.
    ///
    /// Mutations applied before initialization are replayed on top of the
    /// snapshot unless `seen` shows the snapshot already contains them.
    ///
    /// Returns false if it was already initialized, in which case nothing
    /// changes.
    fn finish_init(&self, snapshot: Option<(SharedState, HashMap<WindowId, u64>)>) -> bool {
        let mut pre_init = lock(&self.pre_init);
        if self.initialized.swap(true, Ordering::SeqCst) {
            return false;
        }

        let Some((snapshot, seen)) = snapshot else {
            pre_init.clear();
            return true;
        };

        let mut replayed = 0usize;
        let updated = {
            let mut state = self.write_state();
            *state = snapshot;
            for applied in pre_init.drain(..) {
                let covered = seen.get(&applied.sender).copied().unwrap_or(0);
                if applied.seq > covered {
                    applied.mutation.apply(&mut state);
                    replayed += 1;
                }
            }

            let mut last_seen = lock(&self.last_seen);
            for (window, seq) in seen {
                if window != self.window {
                    let last = last_seen.entry(window).or_insert(0);
                    *last = (*last).max(seq);
                }
            }
            state.clone()
        };
        drop(pre_init);

        info!(window = %self.window, replayed, "Adopted session state from sibling window");
        self.listeners.notify(&updated);
        self.adopted.notify_waiters();
        true
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> SharedState {
        self.read_state().clone()
    }

    /// Run `f` against the current state without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&SharedState) -> R) -> R {
        f(&self.read_state())
    }

    /// Register a listener called after every applied mutation.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SharedState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SharedState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SharedState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `mutation` locally, broadcast it, then notify listeners.
    ///
    /// Listeners run after the message is queued and outside every lock, so
    /// a listener may mutate the state itself.
    ///
    /// # Postconditions
    /// - The local state reflects `mutation` even if publishing fails
    ///
    /// # Errors
    /// - `Error::Broadcast` if the channel rejected the message; siblings
    ///   will not see this mutation and no retry is attempted
    pub fn apply_local(&self, mutation: Mutation) -> Result<()> {
        let name = mutation.name();
        let (updated, published) = {
            let mut pre_init = lock(&self.pre_init);
            let mut state = self.write_state();
            mutation.apply(&mut state);
            let updated = state.clone();

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            if !self.is_initialized() {
                pre_init.push(Applied {
                    sender: self.window,
                    seq,
                    mutation: mutation.clone(),
                });
            }
            (updated, self.send(seq, Payload::Mutation(mutation)))
        };
        debug!(window = %self.window, mutation = name, "Applied local mutation");
        self.listeners.notify(&updated);

        published.map_err(|e| {
            warn!(window = %self.window, "Mutation not broadcast, siblings may diverge: {}", e);
            e
        })
    }

    /// Publish `payload` under the next sequence number.
    ///
    /// # Preconditions
    /// - The caller holds the state write lock
    fn publish(&self, payload: Payload) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.send(seq, payload)
    }

    fn send(&self, seq: u64, payload: Payload) -> Result<()> {
        let envelope = Envelope::new(self.window, seq, payload);
        self.channel.publish(envelope.encode()?)?;
        Ok(())
    }

    /// Record `seq` from `sender`; false if it was already applied.
    fn accept(&self, sender: WindowId, seq: u64) -> bool {
        let mut last_seen = lock(&self.last_seen);
        let last = last_seen.entry(sender).or_insert(0);
        if seq <= *last {
            debug!(window = %self.window, sender = %sender, seq, "Dropping duplicate message");
            return false;
        }
        *last = seq;
        true
    }

    /// Handle a raw message received from the channel.
    ///
    /// Own messages and redelivered messages are ignored.
    ///
    /// # Errors
    /// - `Error::Serialization` if the message cannot be decoded
    /// - `Error::Broadcast` if answering a sync request failed
    pub fn on_remote(&self, raw: &str) -> Result<()> {
        let envelope = Envelope::decode(raw)?;
        if envelope.sender == self.window {
            return Ok(());
        }

        debug!(
            window = %self.window,
            sender = %envelope.sender,
            message = envelope.describe(),
            "Received remote message"
        );

        let Envelope {
            sender,
            seq,
            payload,
            ..
        } = envelope;

        match payload {
            Payload::Mutation(mutation) => {
                let updated = {
                    let mut pre_init = lock(&self.pre_init);
                    let mut state = self.write_state();
                    if !self.accept(sender, seq) {
                        return Ok(());
                    }
                    mutation.apply(&mut state);
                    if !self.is_initialized() {
                        pre_init.push(Applied {
                            sender,
                            seq,
                            mutation,
                        });
                    }
                    state.clone()
                };
                self.listeners.notify(&updated);
                Ok(())
            }
            Payload::SyncRequest => {
                // The write lock keeps local mutations out while the
                // snapshot and its `seen` map are captured.
                let state = self.write_state();
                if !self.accept(sender, seq) || !self.is_initialized() {
                    return Ok(());
                }
                let mut seen = lock(&self.last_seen).clone();
                seen.insert(self.window, self.next_seq.load(Ordering::SeqCst) - 1);
                self.publish(Payload::Snapshot {
                    to: sender,
                    state: state.clone(),
                    seen,
                })
            }
            Payload::Snapshot { to, state, seen } => {
                if self.accept(sender, seq) && to == self.window {
                    self.finish_init(Some((state, seen)));
                }
                Ok(())
            }
        }
    }

    /// Ask sibling windows for their state and wait up to `wait` for one.
    ///
    /// # Returns
    /// - `Ok(true)` if a sibling's snapshot was adopted
    /// - `Ok(false)` if nobody answered; this window then starts the session
    ///
    /// The receive loop ([`SharedStateSync::spawn_listener`]) must be running.
    pub async fn join(&self, wait: Duration) -> Result<bool> {
        if self.is_initialized() {
            return Ok(false);
        }

        let adopted = self.adopted.notified();
        let requested = {
            let _state = self.write_state();
            self.publish(Payload::SyncRequest)
        };
        if let Err(e) = requested {
            // Nobody can answer anyway.
            debug!(window = %self.window, "Sync request not delivered: {}", e);
            self.mark_initialized();
            return Ok(false);
        }

        if tokio::time::timeout(wait, adopted).await.is_ok() {
            return Ok(true);
        }

        if !self.finish_init(None) {
            // A snapshot landed right at the deadline.
            return Ok(true);
        }
        info!(window = %self.window, "No sibling window answered, starting a new session");
        Ok(false)
    }

    /// Subscribe to the channel and apply incoming messages in a background task.
    ///
    /// The subscription is taken before this returns, so messages published
    /// afterwards are never missed. The task ends when the channel closes or
    /// this replica is dropped.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.channel.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let window = self.window;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => {
                        let Some(sync) = weak.upgrade() else { break };
                        if let Err(e) = sync.on_remote(&raw) {
                            warn!(window = %window, "Failed to handle remote message: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(window = %window, skipped, "Missed broadcast messages, state may diverge");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(window = %window, "Shared state listener stopped");
        })
    }

    pub fn set_first_window(&self, value: bool) -> Result<()> {
        self.apply_local(Mutation::SetFirstWindow(value))
    }

    pub fn set_backend_ready(&self, value: bool) -> Result<()> {
        self.apply_local(Mutation::SetBackendReady(value))
    }

    pub fn set_auth_token(&self, token: impl Into<String>) -> Result<()> {
        self.apply_local(Mutation::SetAuthToken(token.into()))
    }

    pub fn set_auth_header(&self, header: impl Into<String>) -> Result<()> {
        self.apply_local(Mutation::SetAuthHeader(header.into()))
    }

    pub fn add_service(&self, entry: ServiceEntry) -> Result<()> {
        self.apply_local(Mutation::AddService(entry))
    }

    pub fn remove_service(&self, process_id: u32) -> Result<()> {
        self.apply_local(Mutation::RemoveService(process_id))
    }

    pub fn replace_resources(&self, resources: Vec<ResourceId>) -> Result<()> {
        self.apply_local(Mutation::ReplaceResourceList(resources))
    }

    pub fn add_resource(&self, resource: ResourceId) -> Result<()> {
        self.apply_local(Mutation::AddResource(resource))
    }

    pub fn remove_resource(&self, resource: ResourceId) -> Result<()> {
        self.apply_local(Mutation::RemoveResource(resource))
    }

    pub fn mount_resource(&self, resource: ResourceId, mount_point: impl Into<PathBuf>) -> Result<()> {
        self.apply_local(Mutation::MountResource {
            resource_id: resource,
            mount_point: mount_point.into(),
        })
    }

    pub fn unmount_resource(&self, resource: ResourceId) -> Result<()> {
        self.apply_local(Mutation::UnmountResource(resource))
    }
}

impl std::fmt::Debug for SharedStateSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateSync")
            .field("window", &self.window)
            .field("channel", &self.channel.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
