//! Binding consumer slots to resources.
//!
//! Every consumer slot (e.g. a row of a recycled list view) owns a [`SlotBinding`]. Asking the
//! [`DownloadCoordinator`] to show a key in a slot either serves the resource from the cache
//! right away, or schedules a fetch on a background task. Fetches report back through
//! [`SlotEvents`], which the owner of the slots drains and routes back into
//! [`DownloadCoordinator::handle_event`] together with the slot the event names.
//!
//! A slot goes through `Idle → Queued → Fetching → {Delivered | Error | NoConnection}` for every
//! key it is bound to. Rebinding a slot cancels its in-flight fetch, and the events of a
//! cancelled fetch are discarded, so that a slot never receives a resource or status meant for
//! a key it no longer shows.
//!
//! ### Metrics
//!
//! - `coordinator.bind`: All binds, tagged with their [outcome](BindOutcome).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheError, Decoder, TwoTierCache};
use crate::config::Config;
use crate::download::{Progress, ResourceLoader};

mod in_flight;

use in_flight::InFlight;

/// Identifies a consumer slot.
pub type SlotId = usize;

/// The state of a slot with respect to its current key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Idle,
    Queued,
    Fetching,
    Delivered,
    Error,
    NoConnection,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Queued => "queued",
            Status::Fetching => "fetching",
            Status::Delivered => "delivered",
            Status::Error => "error",
            Status::NoConnection => "no connection",
        }
    }

    /// Whether a fetch for the current key is still outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Queued | Status::Fetching)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One in-flight fetch attempt of a slot.
///
/// The generation is unique per attempt, events carrying any other generation are stale.
#[derive(Debug)]
pub struct FetchHandle {
    slot_id: SlotId,
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl FetchHandle {
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The per-slot state, owned by the slot.
///
/// Dropping a binding cancels its in-flight fetch.
#[derive(Debug)]
pub struct SlotBinding {
    slot_id: SlotId,
    current_key: Option<String>,
    status: Status,
    active_fetch: Option<FetchHandle>,
}

impl SlotBinding {
    pub fn new(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            current_key: None,
            status: Status::Idle,
            active_fetch: None,
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn current_key(&self) -> Option<&str> {
        self.current_key.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn active_fetch(&self) -> Option<&FetchHandle> {
        self.active_fetch.as_ref()
    }

    fn cancel_fetch(&mut self) {
        if let Some(fetch) = self.active_fetch.take() {
            tracing::trace!(
                "Cancelling fetch of `{}` for slot {}",
                fetch.key,
                self.slot_id
            );
            fetch.cancel();
        }
    }
}

impl Drop for SlotBinding {
    fn drop(&mut self) {
        self.cancel_fetch();
    }
}

/// Receives the notifications of all slots.
///
/// Callbacks run on the context that calls [`DownloadCoordinator::bind`] and
/// [`DownloadCoordinator::handle_event`].
pub trait SlotListener<R>: Send + Sync {
    fn on_status_changed(&self, slot_id: SlotId, key: &str, status: Status);

    fn on_resource_available(&self, resource: Arc<R>, slot_id: SlotId);

    fn on_progress(&self, slot_id: SlotId, progress: Progress) {
        let _ = (slot_id, progress);
    }
}

/// What a background fetch reports.
pub enum SlotEventKind<R> {
    /// The fetch got past the concurrency limit and the connectivity check.
    Started,
    Progress(Progress),
    Finished(Result<Arc<R>, CacheError>),
}

/// A message from a background fetch to the slot it was started for.
pub struct SlotEvent<R> {
    pub slot_id: SlotId,
    pub generation: u64,
    pub kind: SlotEventKind<R>,
}

impl<R> std::fmt::Debug for SlotEvent<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            SlotEventKind::Started => "started",
            SlotEventKind::Progress(_) => "progress",
            SlotEventKind::Finished(Ok(_)) => "finished",
            SlotEventKind::Finished(Err(_)) => "failed",
        };
        f.debug_struct("SlotEvent")
            .field("slot_id", &self.slot_id)
            .field("generation", &self.generation)
            .field("kind", &kind)
            .finish()
    }
}

/// The stream of events of all background fetches, in the order they were sent.
#[derive(Debug)]
pub struct SlotEvents<R> {
    receiver: mpsc::UnboundedReceiver<SlotEvent<R>>,
}

impl<R> SlotEvents<R> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the coordinator and all of its fetches are gone.
    pub async fn recv(&mut self) -> Option<SlotEvent<R>> {
        self.receiver.recv().await
    }
}

/// The result of [`DownloadCoordinator::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The key was empty, the slot is in the `Error` state.
    Invalid,
    /// The slot already waits for this key.
    AlreadyPending,
    /// The resource was delivered from the cache.
    FromCache,
    /// A fetch was scheduled.
    Scheduled,
}

impl BindOutcome {
    /// Whether the bind did anything for the slot.
    pub fn is_handled(&self) -> bool {
        matches!(self, BindOutcome::FromCache | BindOutcome::Scheduled)
    }

    fn as_tag(&self) -> &'static str {
        match self {
            BindOutcome::Invalid => "invalid",
            BindOutcome::AlreadyPending => "pending",
            BindOutcome::FromCache => "cache",
            BindOutcome::Scheduled => "scheduled",
        }
    }
}

/// Options of the [`DownloadCoordinator`].
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    /// Look up the cache synchronously in [`bind`](DownloadCoordinator::bind).
    ///
    /// This may read from disk on the calling context, in exchange a cached resource is shown
    /// without ever passing through the `Queued` state.
    pub cache_first_sync: bool,
    /// The maximum number of transport fetches running at once.
    pub max_concurrent_fetches: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            cache_first_sync: true,
            max_concurrent_fetches: 6,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_first_sync: config.cache_first_sync,
            max_concurrent_fetches: config.max_concurrent_fetches,
        }
    }
}

/// Serves slots from the cache, and fetches what is not cached.
///
/// Binding schedules fetches with [`tokio::spawn`], so it must be called from within a Tokio
/// runtime.
pub struct DownloadCoordinator<D: Decoder> {
    in_flight: Arc<InFlight<D>>,
    listener: Arc<dyn SlotListener<D::Resource>>,
    events: mpsc::UnboundedSender<SlotEvent<D::Resource>>,
    cache_first_sync: bool,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl<D: Decoder> std::fmt::Debug for DownloadCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("cache", self.in_flight.cache())
            .field("cache_first_sync", &self.cache_first_sync)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<D: Decoder> DownloadCoordinator<D> {
    pub fn new(
        cache: Arc<TwoTierCache<D>>,
        loader: ResourceLoader,
        listener: Arc<dyn SlotListener<D::Resource>>,
        options: CoordinatorOptions,
    ) -> (Self, SlotEvents<D::Resource>) {
        let shutdown = CancellationToken::new();
        let (events, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            in_flight: Arc::new(InFlight::new(
                cache,
                loader,
                options.max_concurrent_fetches,
                shutdown.clone(),
            )),
            listener,
            events,
            cache_first_sync: options.cache_first_sync,
            next_generation: AtomicU64::new(1),
            shutdown,
        };
        (coordinator, SlotEvents { receiver })
    }

    pub fn cache(&self) -> &Arc<TwoTierCache<D>> {
        self.in_flight.cache()
    }

    fn set_status(&self, slot: &mut SlotBinding, status: Status) {
        slot.status = status;
        let key = slot.current_key.as_deref().unwrap_or_default();
        self.listener.on_status_changed(slot.slot_id, key, status);
    }

    /// Shows the resource of `key` in `slot`.
    ///
    /// A slot that already waits for `key` is left alone. A slot waiting for another key has
    /// that fetch cancelled first.
    pub fn bind(&self, slot: &mut SlotBinding, key: &str) -> BindOutcome {
        let outcome = self.bind_inner(slot, key);
        metric!(counter("coordinator.bind") += 1, "outcome" => outcome.as_tag());
        outcome
    }

    fn bind_inner(&self, slot: &mut SlotBinding, key: &str) -> BindOutcome {
        if key.is_empty() {
            slot.cancel_fetch();
            slot.current_key = None;
            self.set_status(slot, Status::Error);
            return BindOutcome::Invalid;
        }
        if slot.current_key() == Some(key) && slot.status.is_pending() {
            return BindOutcome::AlreadyPending;
        }

        slot.cancel_fetch();
        slot.current_key = Some(key.to_owned());

        if self.cache_first_sync {
            if let Some(resource) = self.cache().get(key) {
                tracing::trace!("Serving `{}` to slot {} from cache", key, slot.slot_id);
                self.listener.on_resource_available(resource, slot.slot_id);
                self.set_status(slot, Status::Delivered);
                return BindOutcome::FromCache;
            }
        }

        self.set_status(slot, Status::Queued);
        let fetch = FetchHandle {
            slot_id: slot.slot_id,
            key: key.to_owned(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: self.shutdown.child_token(),
        };
        let worker = Worker {
            in_flight: self.in_flight.clone(),
            events: self.events.clone(),
            check_cache: !self.cache_first_sync,
            slot_id: fetch.slot_id,
            generation: fetch.generation,
            key: fetch.key.clone(),
            token: fetch.token.clone(),
        };
        tokio::spawn(worker.run());
        slot.active_fetch = Some(fetch);

        BindOutcome::Scheduled
    }

    /// Applies an event of a background fetch to `slot`.
    ///
    /// Events for another slot, for a fetch the slot no longer waits for, or for a cancelled
    /// fetch are discarded. Returns whether the event was applied.
    pub fn handle_event(&self, slot: &mut SlotBinding, event: SlotEvent<D::Resource>) -> bool {
        let current = slot.active_fetch.as_ref().is_some_and(|fetch| {
            fetch.slot_id == event.slot_id
                && fetch.generation == event.generation
                && !fetch.is_cancelled()
        });
        if event.slot_id != slot.slot_id || !current {
            tracing::trace!("Discarding stale {:?}", event);
            return false;
        }

        match event.kind {
            SlotEventKind::Started => self.set_status(slot, Status::Fetching),
            SlotEventKind::Progress(progress) => {
                self.listener.on_progress(slot.slot_id, progress);
            }
            SlotEventKind::Finished(result) => {
                slot.active_fetch = None;
                match result {
                    Ok(resource) => {
                        self.listener.on_resource_available(resource, slot.slot_id);
                        self.set_status(slot, Status::Delivered);
                    }
                    Err(CacheError::NoConnection) => self.set_status(slot, Status::NoConnection),
                    Err(CacheError::Cancelled) => {
                        // the slot moved on without rebinding, e.g. after a shutdown
                        slot.status = Status::Idle;
                        return false;
                    }
                    Err(err) => {
                        tracing::debug!(
                            error = %err,
                            "Failed to load `{}` for slot {}",
                            slot.current_key().unwrap_or_default(),
                            slot.slot_id
                        );
                        self.set_status(slot, Status::Error);
                    }
                }
            }
        }
        true
    }

    /// Cancels the in-flight fetch of a slot that is going away, and resets it to `Idle`.
    pub fn release(&self, slot: &mut SlotBinding) {
        slot.cancel_fetch();
        slot.current_key = None;
        slot.status = Status::Idle;
    }

    /// Cancels every outstanding fetch.
    ///
    /// Slots bound afterwards are never served by a fetch.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down, cancelling {} fetches", self.in_flight.len());
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The background part of one fetch attempt of a slot.
struct Worker<D: Decoder> {
    in_flight: Arc<InFlight<D>>,
    events: mpsc::UnboundedSender<SlotEvent<D::Resource>>,
    check_cache: bool,
    slot_id: SlotId,
    generation: u64,
    key: String,
    token: CancellationToken,
}

impl<D: Decoder> Worker<D> {
    fn send(&self, kind: SlotEventKind<D::Resource>) {
        let event = SlotEvent {
            slot_id: self.slot_id,
            generation: self.generation,
            kind,
        };
        // A closed channel means nobody routes events anymore.
        let _ = self.events.send(event);
    }

    async fn run(self) {
        if self.check_cache {
            let cache = self.in_flight.cache().clone();
            let key = self.key.clone();
            if let Ok(Some(resource)) = tokio::task::spawn_blocking(move || cache.get(&key)).await
            {
                self.send(SlotEventKind::Finished(Ok(resource)));
                return;
            }
        }

        if self.token.is_cancelled() {
            return;
        }

        let on_started = || self.send(SlotEventKind::Started);
        let on_progress = |progress| self.send(SlotEventKind::Progress(progress));
        let result = self
            .in_flight
            .join(&self.key, on_started, on_progress, &self.token)
            .await;
        if !matches!(result, Err(CacheError::Cancelled)) {
            self.send(SlotEventKind::Finished(result));
        }
    }
}

#[cfg(test)]
mod tests;
