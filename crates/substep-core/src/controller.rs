//! Session cache controller
//!
//! Single source of truth for the step records of one active session. Every
//! read and write goes through [`SessionCacheController`]:
//! - Reads are synchronous and served from memory
//! - Writes for one step are queued to a per-step writer task, so each write
//!   merges from the result of the previous one (no lost updates)
//! - Writes for different steps run concurrently
//! - The in-memory map only changes after the remote store confirms
//!
//! Failures are returned to the caller and also recorded as the surfaced
//! error string read by [`SessionCacheController::error`].

use crate::error::{CacheError, CacheResult, RemoteError};
use crate::remote::{DocumentSource, RemoteStateClient};
use crate::resolver::{InputVersion, VersionResolver};
use crate::store::StepRecordStore;
use crate::types::{DocumentId, SessionId, StepName, StepRecord, StepStatus, StepUpdate};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};

/// Handle to a queued step write
///
/// The write is queued when the ticket is created, so dropping the ticket
/// does not cancel it. Await the ticket to observe the result.
#[derive(Debug)]
#[must_use = "the write is already queued; await the ticket or call `detach`"]
pub struct WriteTicket<T> {
    step: StepName,
    reply: oneshot::Receiver<CacheResult<T>>,
}

impl<T> WriteTicket<T> {
    fn ready(step: StepName, result: CacheResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { step, reply: rx }
    }

    /// Step the write targets
    #[inline]
    #[must_use]
    pub fn step(&self) -> &StepName {
        &self.step
    }

    /// Let the write complete in the background
    #[inline]
    pub fn detach(self) {}
}

impl<T> Future for WriteTicket<T> {
    type Output = CacheResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CacheError::Dropped {
                step: self.step.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum StepWrite {
    Save {
        update: StepUpdate,
        reply: oneshot::Sender<CacheResult<StepRecord>>,
    },
    Clear {
        reply: oneshot::Sender<CacheResult<()>>,
    },
    Reload {
        reply: oneshot::Sender<CacheResult<Option<StepRecord>>>,
    },
}

struct StepJob {
    session: SessionId,
    epoch: u64,
    write: StepWrite,
}

struct Inner {
    client: Arc<dyn RemoteStateClient>,
    store: StepRecordStore,
    /// Active session; the epoch only changes under its write lock
    session: RwLock<Option<SessionId>>,
    epoch: AtomicU64,
    load_generation: AtomicU64,
    loading: AtomicBool,
    last_error: RwLock<Option<String>>,
    init_gate: AsyncMutex<()>,
    /// Per-step writes share it; bulk load and clear-all take it exclusively
    session_gate: AsyncRwLock<()>,
    writers: DashMap<StepName, mpsc::UnboundedSender<StepJob>>,
    analysis_gates: DashMap<StepName, Arc<AsyncMutex<()>>>,
}

impl Inner {
    fn active_session(&self) -> Option<(SessionId, u64)> {
        let session = self.session.read();
        session
            .clone()
            .map(|id| (id, self.epoch.load(Ordering::SeqCst)))
    }

    fn report(&self, error: CacheError) -> CacheError {
        tracing::warn!(error = %error, "substep cache operation failed");
        *self.last_error.write() = Some(error.to_string());
        error
    }

    fn superseded(operation: String) -> CacheError {
        tracing::debug!(operation = %operation, "discarding result from a previous session");
        CacheError::superseded(operation)
    }

    /// Apply a store mutation only if no session change happened since `epoch`
    fn apply_if_current(&self, epoch: u64, apply: impl FnOnce(&StepRecordStore)) -> bool {
        let _session = self.session.read();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        apply(&self.store);
        true
    }

    async fn run_save(
        &self,
        session: &SessionId,
        epoch: u64,
        step: &StepName,
        update: StepUpdate,
    ) -> CacheResult<StepRecord> {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(Self::superseded(format!("save of step '{step}'")));
        }

        let existing = self.store.get(step.as_str());
        let request = update.merge_onto(session, step, existing.as_ref());

        match self.client.upsert(request).await {
            Ok(record) => {
                let applied = self.apply_if_current(epoch, |store| {
                    store.insert(step.clone(), record.clone());
                });
                if !applied {
                    return Err(Self::superseded(format!("save of step '{step}'")));
                }
                tracing::debug!(session = %session, step = %step, status = %record.status, "step saved");
                Ok(record)
            }
            Err(source) => Err(self.report(CacheError::Save {
                step: step.clone(),
                source,
            })),
        }
    }

    async fn run_clear(&self, session: &SessionId, epoch: u64, step: &StepName) -> CacheResult<()> {
        match self.client.delete_step(session, step).await {
            Ok(()) | Err(RemoteError::NotFound) => {
                let applied = self.apply_if_current(epoch, |store| {
                    store.remove(step.as_str());
                });
                if !applied {
                    return Err(Self::superseded(format!("clear of step '{step}'")));
                }
                tracing::debug!(session = %session, step = %step, "step cleared");
                Ok(())
            }
            Err(source) => Err(self.report(CacheError::Clear {
                step: step.clone(),
                source,
            })),
        }
    }

    async fn run_reload(
        &self,
        session: &SessionId,
        epoch: u64,
        step: &StepName,
    ) -> CacheResult<Option<StepRecord>> {
        let fetched = match self.client.load_step(session, step).await {
            Ok(record) => Some(record),
            Err(RemoteError::NotFound) => None,
            Err(source) => {
                return Err(self.report(CacheError::Reload {
                    step: step.clone(),
                    source,
                }))
            }
        };

        let applied = self.apply_if_current(epoch, |store| match &fetched {
            Some(record) => store.insert(step.clone(), record.clone()),
            None => {
                store.remove(step.as_str());
            }
        });
        if !applied {
            return Err(Self::superseded(format!("reload of step '{step}'")));
        }
        tracing::debug!(session = %session, step = %step, found = fetched.is_some(), "step reloaded");
        Ok(fetched)
    }
}

/// Per-step writer loop (one tokio task per step name)
async fn step_writer(
    weak: Weak<Inner>,
    step: StepName,
    mut jobs: mpsc::UnboundedReceiver<StepJob>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let _shared = inner.session_gate.read().await;
        let StepJob {
            session,
            epoch,
            write,
        } = job;

        match write {
            StepWrite::Save { update, reply } => {
                let _ = reply.send(inner.run_save(&session, epoch, &step, update).await);
            }
            StepWrite::Clear { reply } => {
                let _ = reply.send(inner.run_clear(&session, epoch, &step).await);
            }
            StepWrite::Reload { reply } => {
                let _ = reply.send(inner.run_reload(&session, epoch, &step).await);
            }
        }
    }
    tracing::trace!(step = %step, "step writer stopped");
}

/// Cache of step records for one active session
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct SessionCacheController {
    inner: Arc<Inner>,
}

impl SessionCacheController {
    /// Create controller over a remote store
    #[must_use]
    pub fn new(client: Arc<dyn RemoteStateClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                store: StepRecordStore::new(),
                session: RwLock::new(None),
                epoch: AtomicU64::new(0),
                load_generation: AtomicU64::new(0),
                loading: AtomicBool::new(false),
                last_error: RwLock::new(None),
                init_gate: AsyncMutex::new(()),
                session_gate: AsyncRwLock::new(()),
                writers: DashMap::new(),
                analysis_gates: DashMap::new(),
            }),
        }
    }

    /// Bulk-load every record of a session
    ///
    /// A no-op when this session is already active and has at least one
    /// record. A concurrent call for the same session waits for the load in
    /// flight instead of starting another. "Not found" means a fresh session.
    /// Loading a different session replaces the previous session's state.
    ///
    /// # Errors
    /// - `CacheError::Load` on transport/server failure; state is left as-is
    /// - `CacheError::Superseded` if `reset` ran while loading
    pub async fn init_session(&self, session_id: impl Into<SessionId>) -> CacheResult<()> {
        let session_id = session_id.into();
        let inner = &self.inner;

        if self.is_loaded(&session_id) {
            tracing::debug!(session = %session_id, "session already loaded");
            return Ok(());
        }

        let seen_generation = inner.load_generation.load(Ordering::SeqCst);
        let _init = inner.init_gate.lock().await;
        if inner.load_generation.load(Ordering::SeqCst) != seen_generation
            && self.session_id().as_ref() == Some(&session_id)
        {
            tracing::debug!(session = %session_id, "joined concurrent session load");
            return Ok(());
        }
        if self.is_loaded(&session_id) {
            return Ok(());
        }

        let _exclusive = inner.session_gate.write().await;
        let epoch = inner.epoch.load(Ordering::SeqCst);
        inner.loading.store(true, Ordering::SeqCst);
        tracing::info!(session = %session_id, "loading session state");
        let loaded = inner.client.load_session(&session_id).await;
        inner.loading.store(false, Ordering::SeqCst);

        let records = match loaded {
            Ok(records) => records,
            Err(RemoteError::NotFound) => HashMap::new(),
            Err(source) => {
                return Err(inner.report(CacheError::Load {
                    session: session_id,
                    source,
                }))
            }
        };

        {
            let mut active = inner.session.write();
            if inner.epoch.load(Ordering::SeqCst) != epoch {
                return Err(Inner::superseded(format!("load of session {session_id}")));
            }
            if active.as_ref() != Some(&session_id) {
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                inner.writers.clear();
                inner.analysis_gates.clear();
                *active = Some(session_id.clone());
            }

            inner
                .store
                .replace_all(records.into_iter().filter_map(|(step, mut record)| {
                    if record.session_id != session_id {
                        tracing::warn!(step = %step, owner = %record.session_id, "skipping record from another session");
                        return None;
                    }
                    record.step_name = step;
                    Some(record)
                }));
            *inner.last_error.write() = None;
        }

        inner.load_generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(session = %session_id, steps = inner.store.len(), "session state loaded");
        Ok(())
    }

    fn is_loaded(&self, session_id: &SessionId) -> bool {
        self.session_id().as_ref() == Some(session_id) && !self.inner.store.is_empty()
    }

    /// Active session id
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session.read().clone()
    }

    /// Check if a bulk load is in flight
    #[inline]
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    /// Most recent surfaced failure
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Dismiss the surfaced failure
    pub fn clear_error(&self) {
        *self.inner.last_error.write() = None;
    }

    /// Cached record of a step; never performs I/O
    #[must_use]
    pub fn get_state(&self, step: &str) -> Option<StepRecord> {
        self.inner.store.get(step)
    }

    /// True iff the step has a cached analysis result
    #[must_use]
    pub fn has_state(&self, step: &str) -> bool {
        self.inner.store.has_analysis(step)
    }

    /// Cached step names, sorted
    #[must_use]
    pub fn step_names(&self) -> Vec<StepName> {
        self.inner.store.step_names()
    }

    /// Number of cached records
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.store.len()
    }

    /// When a step was last synced from the remote store
    #[must_use]
    pub fn last_synced(&self, step: &str) -> Option<DateTime<Utc>> {
        self.inner.store.last_synced(step)
    }

    /// Merge `update` onto the step's current record and persist it
    ///
    /// On success the in-memory record becomes the store's authoritative
    /// response. On failure the record keeps its pre-save value.
    pub fn save(&self, step: &str, update: StepUpdate) -> WriteTicket<StepRecord> {
        self.enqueue(step, |reply| StepWrite::Save { update, reply })
    }

    /// Save the analysis result, keeping other fields
    pub fn save_analysis_result(&self, step: &str, result: Value) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().analysis_result(result))
    }

    /// Save user inputs, keeping other fields
    pub fn save_user_inputs(&self, step: &str, inputs: Value) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().user_inputs(inputs))
    }

    /// Save a new document version for the step, keeping other fields
    pub fn save_modified_text(&self, step: &str, text: impl Into<String>) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().modified_text(text))
    }

    /// Mark the step completed, keeping other fields
    pub fn mark_completed(&self, step: &str) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().status(StepStatus::Completed))
    }

    /// Mark the step skipped, keeping other fields
    pub fn mark_skipped(&self, step: &str) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().status(StepStatus::Skipped))
    }

    /// Re-open a step, keeping other fields
    pub fn reopen(&self, step: &str) -> WriteTicket<StepRecord> {
        self.save(step, StepUpdate::new().status(StepStatus::Pending))
    }

    /// Delete a step's record remotely and locally
    pub fn clear_state(&self, step: &str) -> WriteTicket<()> {
        self.enqueue(step, |reply| StepWrite::Clear { reply })
    }

    /// Re-fetch one step from the remote store
    ///
    /// "Not found" drops the cached entry and resolves to `None`.
    pub fn reload_state(&self, step: &str) -> WriteTicket<Option<StepRecord>> {
        self.enqueue(step, |reply| StepWrite::Reload { reply })
    }

    /// Delete every record of the active session
    ///
    /// # Errors
    /// - `CacheError::NoActiveSession` before a successful `init_session`
    /// - `CacheError::ClearAll` on remote failure; cached state is untouched
    pub async fn clear_all_states(&self) -> CacheResult<()> {
        let inner = &self.inner;
        let Some((session, epoch)) = inner.active_session() else {
            return Err(inner.report(CacheError::NoActiveSession));
        };

        let _exclusive = inner.session_gate.write().await;
        match inner.client.delete_session(&session).await {
            Ok(()) | Err(RemoteError::NotFound) => {
                if !inner.apply_if_current(epoch, StepRecordStore::clear) {
                    return Err(Inner::superseded(format!("clear of session {session}")));
                }
                tracing::info!(session = %session, "session state cleared");
                Ok(())
            }
            Err(source) => Err(inner.report(CacheError::ClearAll { session, source })),
        }
    }

    /// Drop all in-memory state and the active session
    ///
    /// Writes still in flight resolve to `CacheError::Superseded` and never
    /// touch the cleared state.
    pub fn reset(&self) {
        let inner = &self.inner;
        let mut session = inner.session.write();
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = session.take();
        inner.store.clear();
        inner.writers.clear();
        inner.analysis_gates.clear();
        inner.loading.store(false, Ordering::SeqCst);
        *inner.last_error.write() = None;
        tracing::info!(session = ?previous, "session cache reset");
    }

    /// Which version a step with these predecessors should operate on
    #[must_use]
    pub fn resolve_input_version<P: AsRef<str>>(&self, predecessors: &[P]) -> InputVersion {
        VersionResolver::new(&self.inner.store).locate(predecessors)
    }

    /// Resolve input text, falling back to `fallback` when no predecessor
    /// produced a modified version
    pub fn resolve_input_text<P, F>(&self, predecessors: &[P], fallback: F) -> String
    where
        P: AsRef<str>,
        F: FnOnce() -> String,
    {
        VersionResolver::new(&self.inner.store).resolve_input_text(predecessors, fallback)
    }

    /// Resolve input text, fetching the original document as the fallback
    ///
    /// # Errors
    /// - `CacheError::Document` if the original is needed and cannot be fetched
    pub async fn resolve_input_text_from<P: AsRef<str>>(
        &self,
        predecessors: &[P],
        source: &dyn DocumentSource,
        document: &DocumentId,
    ) -> CacheResult<String> {
        VersionResolver::new(&self.inner.store)
            .try_resolve_input_text(predecessors, || async {
                source
                    .original_text(document)
                    .await
                    .map_err(|source| CacheError::Document {
                        document: document.clone(),
                        source,
                    })
            })
            .await
            .map_err(|e| self.inner.report(e))
    }

    pub(crate) fn analysis_gate(&self, step: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .analysis_gates
            .entry(StepName::from(step))
            .or_default()
            .clone()
    }

    pub(crate) fn report(&self, error: CacheError) -> CacheError {
        self.inner.report(error)
    }

    fn enqueue<T>(
        &self,
        step: &str,
        make: impl FnOnce(oneshot::Sender<CacheResult<T>>) -> StepWrite,
    ) -> WriteTicket<T> {
        let step = StepName::from(step);
        let Some((session, epoch)) = self.inner.active_session() else {
            return WriteTicket::ready(step, Err(self.inner.report(CacheError::NoActiveSession)));
        };
        let writer = match self.writer(&step) {
            Ok(writer) => writer,
            Err(e) => return WriteTicket::ready(step, Err(self.inner.report(e))),
        };

        let (reply, rx) = oneshot::channel();
        let job = StepJob {
            session,
            epoch,
            write: make(reply),
        };
        if writer.send(job).is_err() {
            tracing::warn!(step = %step, "step writer closed before accepting write");
        }
        WriteTicket { step, reply: rx }
    }

    fn writer(&self, step: &StepName) -> CacheResult<mpsc::UnboundedSender<StepJob>> {
        let spawn = || -> CacheResult<mpsc::UnboundedSender<StepJob>> {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| CacheError::Runtime(e.to_string()))?;
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(step_writer(Arc::downgrade(&self.inner), step.clone(), rx));
            Ok(tx)
        };

        match self.inner.writers.entry(step.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let tx = spawn()?;
                    occupied.insert(tx.clone());
                    Ok(tx)
                } else {
                    Ok(occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                let tx = spawn()?;
                vacant.insert(tx.clone());
                Ok(tx)
            }
        }
    }
}

impl fmt::Debug for SessionCacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCacheController")
            .field("session", &*self.inner.session.read())
            .field("records", &self.inner.store.len())
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}
