use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError, Decoder, TwoTierCache};
use crate::download::{Progress, ResourceLoader};
use crate::utils::defer::defer;

/// An update of a shared fetch, sent to each of its waiters.
enum FetchUpdate<R> {
    /// The fetch holds a permit and is about to contact the transport.
    Started,
    Progress(Progress),
    Done(CacheContents<Arc<R>>),
}

impl<R> Clone for FetchUpdate<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Started => Self::Started,
            Self::Progress(progress) => Self::Progress(*progress),
            Self::Done(result) => Self::Done(result.clone()),
        }
    }
}

/// A fetch in progress, shared by every slot waiting for the same key.
struct SharedFetch<R> {
    id: u64,
    started: bool,
    next_waiter: u64,
    waiters: Vec<(u64, mpsc::UnboundedSender<FetchUpdate<R>>)>,
    token: CancellationToken,
}

impl<R> SharedFetch<R> {
    fn send(&self, update: FetchUpdate<R>) {
        for (_, sender) in &self.waiters {
            // A closed receiver belongs to a waiter that is just leaving.
            let _ = sender.send(update.clone());
        }
    }
}

/// Coalesces concurrent fetches of the same key into a single transport fetch.
///
/// Each waiter can cancel independently. The shared fetch itself is only cancelled once its
/// last waiter left, at which point it is also removed from the registry. Every waiter receives
/// every progress report published after it joined.
pub(super) struct InFlight<D: Decoder> {
    cache: Arc<TwoTierCache<D>>,
    loader: ResourceLoader,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    fetches: Mutex<HashMap<Arc<str>, SharedFetch<D::Resource>>>,
}

impl<D: Decoder> InFlight<D> {
    pub fn new(
        cache: Arc<TwoTierCache<D>>,
        loader: ResourceLoader,
        max_concurrent_fetches: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            loader,
            permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
            shutdown,
            next_id: AtomicU64::new(0),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<TwoTierCache<D>> {
        &self.cache
    }

    fn fetches(&self) -> MutexGuard<'_, HashMap<Arc<str>, SharedFetch<D::Resource>>> {
        self.fetches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of shared fetches currently in progress.
    pub fn len(&self) -> usize {
        self.fetches().len()
    }

    /// Waits for the resource of `key`, starting a fetch unless one is already in progress.
    ///
    /// `on_started` is called once the shared fetch got past the concurrency limit and the
    /// connectivity check, and `on_progress` for every read after that. Returns
    /// [`CacheError::Cancelled`] as soon as `cancel` fires.
    pub async fn join<S, F>(
        self: &Arc<Self>,
        key: &str,
        mut on_started: S,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> CacheContents<Arc<D::Resource>>
    where
        S: FnMut(),
        F: FnMut(Progress),
    {
        let (id, waiter, mut updates) = {
            let mut fetches = self.fetches();
            let fetch = fetches
                .entry(Arc::from(key))
                .or_insert_with(|| self.start(Arc::from(key)));
            if !fetch.waiters.is_empty() {
                tracing::trace!("Joining in-flight fetch of `{}`", key);
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            if fetch.started {
                let _ = sender.send(FetchUpdate::Started);
            }
            let waiter = fetch.next_waiter;
            fetch.next_waiter += 1;
            fetch.waiters.push((waiter, sender));
            (fetch.id, waiter, receiver)
        };
        let _leave = defer(|| self.leave(key, id, waiter));

        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                update = updates.recv() => update,
            };
            match update {
                Some(FetchUpdate::Started) => on_started(),
                Some(FetchUpdate::Progress(progress)) => on_progress(progress),
                Some(FetchUpdate::Done(result)) => return result,
                None => {
                    tracing::error!("Fetch of `{}` ended without a result", key);
                    return Err(CacheError::InternalError);
                }
            }
        }
    }

    fn start(self: &Arc<Self>, key: Arc<str>) -> SharedFetch<D::Resource> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();

        tokio::spawn(self.clone().run(key, id, token.clone()));

        SharedFetch {
            id,
            started: false,
            next_waiter: 0,
            waiters: Vec::new(),
            token,
        }
    }

    /// Sends an update to the current waiters of the fetch `id`.
    fn publish(&self, key: &str, id: u64, update: FetchUpdate<D::Resource>) {
        let mut fetches = self.fetches();
        if let Some(fetch) = fetches.get_mut(key).filter(|fetch| fetch.id == id) {
            fetch.started |= matches!(update, FetchUpdate::Started);
            fetch.send(update);
        }
    }

    async fn run(self: Arc<Self>, key: Arc<str>, id: u64, token: CancellationToken) {
        let result = self.fetch(&key, id, &token).await;

        let mut fetches = self.fetches();
        if fetches.get(&key).is_some_and(|fetch| fetch.id == id) {
            if let Some(fetch) = fetches.remove(&key) {
                fetch.send(FetchUpdate::Done(result));
            }
        }
    }

    async fn fetch(
        &self,
        key: &str,
        id: u64,
        token: &CancellationToken,
    ) -> CacheContents<Arc<D::Resource>> {
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CacheError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| CacheError::Cancelled)?
            }
        };

        self.loader.check_connectivity(key)?;
        self.publish(key, id, FetchUpdate::Started);

        let on_progress = |progress| self.publish(key, id, FetchUpdate::Progress(progress));
        let raw = self.loader.fetch_online(key, on_progress, token).await?;
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let cache = self.cache.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || cache.put(&key, raw))
            .await
            .map_err(|e| {
                tracing::error!(error = &e as &dyn std::error::Error, "Cache write panicked");
                CacheError::InternalError
            })?
    }

    /// Unregisters a waiter of the fetch `id`, cancelling the fetch if it was the last one.
    fn leave(&self, key: &str, id: u64, waiter: u64) {
        let mut fetches = self.fetches();
        let Some(fetch) = fetches.get_mut(key).filter(|fetch| fetch.id == id) else {
            return;
        };
        fetch.waiters.retain(|(other, _)| *other != waiter);
        if fetch.waiters.is_empty() {
            tracing::debug!("Cancelling fetch of `{}` without waiters", key);
            fetch.token.cancel();
            fetches.remove(key);
        }
    }
}
