//! Named scan queues.
//!
//! Every queue owns one execution slot and a worker task. The worker
//! activates pending entries in order whenever the slot is free and the queue
//! is running, runs the scan in its own task and retires the entry into the
//! queue's history. Queues are independent of each other; they only share
//! the device registry, the bus and the staging ledger.
//!
//! All bookkeeping lives behind one lock, and every change is published on
//! the bus while that lock is held so observers see transitions in the order
//! they happened.
//!
//! # Entry lifecycle
//!
//! ```text
//! PENDING ──► ACTIVE ◄──► PAUSED
//!    │          │            │
//!    ▼          ▼            ▼
//! ABORTED   COMPLETED / FAILED / ABORTED
//! ```
//!
//! A restarted entry ends ABORTED and its request comes back as a new
//! PENDING entry at the head of the queue. Every activated scan except a
//! plain move is numbered from the engine's [`ScanNumbers`](crate::ScanNumbers).

use crate::context::EngineContext;
use crate::control::{ScanControl, StopKind};
use crate::runner::{run_scan, ScanReport};
use crate::scan::Scan;
use beamline_core::{
    now_ns, BusMessage, EntryState, EntryTransition, ErrorInfo, MessageBus, QueueState,
    QueueStatus, RequestId, RequestResponse, ScanError, ScanRequest, ScanResult,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Repositioning of one pending entry. "Up" is towards activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "index", rename_all = "snake_case")]
pub enum OrderAction {
    /// One place earlier
    MoveUp,
    /// One place later
    MoveDown,
    /// Next to activate
    MoveTop,
    /// Last to activate
    MoveBottom,
    /// To this index, clamped to the last position
    MoveTo(usize),
}

impl OrderAction {
    fn target(self, index: usize, len: usize) -> usize {
        let last = len.saturating_sub(1);
        match self {
            OrderAction::MoveUp => index.saturating_sub(1),
            OrderAction::MoveDown => (index + 1).min(last),
            OrderAction::MoveTop => 0,
            OrderAction::MoveBottom => last,
            OrderAction::MoveTo(to) => to.min(last),
        }
    }
}

/// Snapshot of a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    /// Entry RID
    pub rid: RequestId,
    /// Queue holding the entry
    pub queue: String,
    /// The submitted request
    pub request: ScanRequest,
    /// Current state
    pub state: EntryState,
    /// When the request was accepted
    pub submitted_at: DateTime<Utc>,
    /// When the scan was activated
    pub started_at: Option<DateTime<Utc>>,
    /// When the entry reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Error of a FAILED entry
    pub error: Option<ErrorInfo>,
    /// Number handed out at activation
    pub scan_number: Option<u64>,
    /// Entry this one restarts
    pub restart_of: Option<RequestId>,
}

struct Slot {
    entry: QueueEntry,
    request: Arc<ScanRequest>,
    scan: Option<Box<dyn Scan>>,
    control: ScanControl,
    done: watch::Sender<Option<EntryState>>,
    report: Option<ScanReport>,
}

struct Queue {
    paused: bool,
    locks: BTreeMap<String, String>,
    pending: VecDeque<RequestId>,
    active: Option<RequestId>,
    history: Vec<RequestId>,
    wake: Arc<Notify>,
}

impl Queue {
    fn new() -> Self {
        Self {
            paused: false,
            locks: BTreeMap::new(),
            pending: VecDeque::new(),
            active: None,
            history: Vec::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> QueueState {
        if !self.locks.is_empty() {
            QueueState::Locked
        } else if self.paused {
            QueueState::Paused
        } else {
            QueueState::Running
        }
    }

    fn status(&self, name: &str) -> QueueStatus {
        QueueStatus {
            queue: name.to_string(),
            state: self.state(),
            active: self.active.clone(),
            pending: self.pending.iter().cloned().collect(),
            locks: self.locks.clone(),
        }
    }
}

#[derive(Default)]
struct QueueBook {
    queues: BTreeMap<String, Queue>,
    entries: HashMap<RequestId, Slot>,
}

fn unknown_queue(name: &str) -> ScanError {
    ScanError::InvalidRequest(format!("unknown queue '{name}'"))
}

impl QueueBook {
    fn queue_mut(&mut self, name: &str) -> ScanResult<&mut Queue> {
        self.queues.get_mut(name).ok_or_else(|| unknown_queue(name))
    }
}

struct Job {
    rid: RequestId,
    request: Arc<ScanRequest>,
    scan: Box<dyn Scan>,
    control: ScanControl,
    scan_number: Option<u64>,
}

struct Shared {
    engine: EngineContext,
    book: Mutex<QueueBook>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn publish_status(bus: &dyn MessageBus, name: &str, queue: &Queue) {
    bus.publish(BusMessage::QueueStatus(queue.status(name)));
}

fn publish_transition(
    bus: &dyn MessageBus,
    slot: &Slot,
    from: Option<EntryState>,
    to: EntryState,
) {
    debug!(rid = %slot.entry.rid, queue = %slot.entry.queue, ?from, %to, "entry transition");
    bus.publish(BusMessage::EntryTransition(EntryTransition {
        rid: slot.entry.rid.clone(),
        queue: slot.entry.queue.clone(),
        from,
        to,
        error: slot.entry.error.clone(),
        timestamp_ns: now_ns(),
    }));
}

fn pending_slot(rid: RequestId, request: ScanRequest, scan: Box<dyn Scan>) -> Slot {
    let (done, _) = watch::channel(None);
    Slot {
        entry: QueueEntry {
            rid,
            queue: request.queue.clone(),
            request: request.clone(),
            state: EntryState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            scan_number: None,
            restart_of: None,
        },
        request: Arc::new(request),
        scan: Some(scan),
        control: ScanControl::new(),
        done,
        report: None,
    }
}

/// Move `slot` into a terminal state and wake everyone waiting on it.
fn retire_slot(bus: &dyn MessageBus, slot: &mut Slot, state: EntryState, error: Option<ErrorInfo>) {
    let from = slot.entry.state;
    slot.entry.state = state;
    slot.entry.error = error;
    slot.entry.finished_at = Some(Utc::now());
    slot.scan = None;
    publish_transition(bus, slot, Some(from), state);
    slot.done.send_replace(Some(state));
}

impl Shared {
    fn bus(&self) -> &dyn MessageBus {
        self.engine.bus.as_ref()
    }

    /// Take the next pending entry if the slot is free and the queue runs.
    fn activate_next(&self, name: &str) -> Option<Job> {
        let mut guard = self.book.lock();
        let book = &mut *guard;
        let queue = book.queues.get_mut(name)?;
        if queue.active.is_some() || queue.state() != QueueState::Running {
            return None;
        }
        while let Some(rid) = queue.pending.pop_front() {
            let Some(slot) = book.entries.get_mut(&rid) else {
                warn!(%rid, queue = name, "pending entry without a slot");
                continue;
            };
            let Some(scan) = slot.scan.take() else {
                warn!(%rid, queue = name, "pending entry lost its scan");
                continue;
            };
            let scan_number = scan.numbered().then(|| self.engine.scan_numbers.assign());
            slot.entry.state = EntryState::Active;
            slot.entry.started_at = Some(Utc::now());
            slot.entry.scan_number = scan_number;
            queue.active = Some(rid.clone());
            publish_transition(self.bus(), slot, Some(EntryState::Pending), EntryState::Active);
            publish_status(self.bus(), name, queue);
            return Some(Job {
                rid,
                request: slot.request.clone(),
                scan,
                control: slot.control.clone(),
                scan_number,
            });
        }
        None
    }

    async fn execute(&self, name: &str, job: Job) {
        let Job {
            rid,
            request,
            scan,
            control,
            scan_number,
        } = job;
        info!(%rid, queue = name, scan_type = %request.scan_type, ?scan_number, "scan activated");
        let mut ctx = self.engine.scan_context(rid.clone(), request, control);
        ctx.scan_number = scan_number;
        let report = match tokio::spawn(run_scan(scan, ctx)).await {
            Ok(report) => report,
            Err(err) => {
                warn!(%rid, error = %err, "scan task ended abnormally");
                self.engine.ledger.release_all(&rid);
                self.engine.correlator.retire(&rid);
                ScanReport::rejected(
                    rid,
                    ScanError::EngineFault(format!("scan task ended abnormally: {err}")),
                )
            }
        };
        self.finish(name, report);
    }

    fn finish(&self, name: &str, report: ScanReport) {
        let state = report.outcome.entry_state();
        let error = report.outcome.error().map(ErrorInfo::from);
        let rid = report.rid.clone();

        let mut guard = self.book.lock();
        let book = &mut *guard;
        if let Some(slot) = book.entries.get_mut(&rid) {
            retire_slot(self.bus(), slot, state, error);
            slot.report = Some(report);
        }
        if let Some(queue) = book.queues.get_mut(name) {
            if queue.active.as_ref() == Some(&rid) {
                queue.active = None;
            }
            queue.history.push(rid.clone());
            publish_status(self.bus(), name, queue);
        }
        info!(%rid, queue = name, %state, "entry retired");
    }

    /// Mark the active entry PAUSED once its deferred pause took effect.
    fn mark_parked(&self, rid: &RequestId) {
        let mut book = self.book.lock();
        if let Some(slot) = book.entries.get_mut(rid) {
            if slot.entry.state == EntryState::Active && slot.control.is_paused() {
                slot.entry.state = EntryState::Paused;
                publish_transition(self.bus(), slot, Some(EntryState::Active), EntryState::Paused);
                info!(%rid, "deferred pause took effect");
            }
        }
    }

    async fn worker(self: Arc<Self>, name: String, wake: Arc<Notify>) {
        debug!(queue = %name, "queue worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.activate_next(&name) {
                Some(job) => self.execute(&name, job).await,
                None => {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(queue = %name, "queue worker stopped");
    }
}

/// The queues of one engine.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    /// Manager without queues. Queues are created by [`QueueManager::create_queue`]
    /// or on first use.
    pub fn new(engine: EngineContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                book: Mutex::new(QueueBook::default()),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The engine services the queues run scans with.
    pub fn engine(&self) -> &EngineContext {
        &self.shared.engine
    }

    /// Create `name` and start its worker; no-op if it exists.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// `InvalidRequest` for an empty name, `EngineFault` outside a runtime or
    /// after shutdown.
    pub fn create_queue(&self, name: &str) -> ScanResult<()> {
        let mut book = self.shared.book.lock();
        self.ensure_queue(&mut book, name)
    }

    fn ensure_queue(&self, book: &mut QueueBook, name: &str) -> ScanResult<()> {
        if book.queues.contains_key(name) {
            return Ok(());
        }
        if name.is_empty() {
            return Err(ScanError::InvalidRequest("queue name must not be empty".into()));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(ScanError::EngineFault("queue manager is shut down".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ScanError::EngineFault(format!("no runtime for queue worker: {e}")))?;

        let queue = Queue::new();
        let worker = self
            .shared
            .clone()
            .worker(name.to_string(), queue.wake.clone());
        self.shared.workers.lock().push(runtime.spawn(worker));
        publish_status(self.shared.bus(), name, &queue);
        book.queues.insert(name.to_string(), queue);
        info!(queue = name, "queue created");
        Ok(())
    }

    /// Validate `request` and append it to its queue.
    ///
    /// The outcome is published as a `RequestResponse` either way.
    ///
    /// # Errors
    /// `InvalidRequest` for unknown scan types, schema violations, unknown
    /// devices and arguments the scan type rejects; the request never enters
    /// a queue.
    #[instrument(skip_all, fields(scan_type = %request.scan_type, queue = %request.queue))]
    pub fn enqueue(&self, request: ScanRequest) -> ScanResult<RequestId> {
        let engine = &self.shared.engine;
        let built = engine
            .catalogue
            .validate(&request, &engine.registry)
            .and_then(|()| engine.catalogue.build(&request));
        let scan = match built {
            Ok(scan) => scan,
            Err(err) => {
                warn!(error = %err, "request rejected");
                self.respond(&request, None, false, err.to_string());
                return Err(err);
            }
        };

        let mut guard = self.shared.book.lock();
        let book = &mut *guard;
        if let Err(err) = self.ensure_queue(book, &request.queue) {
            self.respond(&request, None, false, err.to_string());
            return Err(err);
        }

        let rid = RequestId::new();
        let slot = pending_slot(rid.clone(), request, scan);
        self.respond(&slot.request, Some(rid.clone()), true, "accepted".into());
        publish_transition(self.shared.bus(), &slot, None, EntryState::Pending);

        let name = slot.entry.queue.clone();
        book.entries.insert(rid.clone(), slot);
        let queue = book.queue_mut(&name)?;
        queue.pending.push_back(rid.clone());
        publish_status(self.shared.bus(), &name, queue);
        queue.wake.notify_one();
        info!(%rid, "request queued");
        Ok(rid)
    }

    fn respond(&self, request: &ScanRequest, rid: Option<RequestId>, accepted: bool, message: String) {
        self.shared
            .bus()
            .publish(BusMessage::RequestResponse(RequestResponse {
                rid,
                accepted,
                message,
                queue: request.queue.clone(),
                metadata: request.metadata.clone(),
            }));
    }

    /// Stop an entry.
    ///
    /// A pending entry leaves its queue at once. An active or paused entry is
    /// cancelled at its next suspension point; the call returns once it has
    /// unwound. Stopping a finished entry returns its final state.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown RID.
    #[instrument(skip_all, fields(%rid))]
    pub async fn abort(&self, rid: &RequestId) -> ScanResult<EntryState> {
        self.stop(rid, StopKind::Abort).await
    }

    /// Like [`QueueManager::abort`], but motors stay where they are.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown RID.
    #[instrument(skip_all, fields(%rid))]
    pub async fn halt(&self, rid: &RequestId) -> ScanResult<EntryState> {
        self.stop(rid, StopKind::Halt).await
    }

    async fn stop(&self, rid: &RequestId, kind: StopKind) -> ScanResult<EntryState> {
        let done = {
            let mut guard = self.shared.book.lock();
            let book = &mut *guard;
            let slot = book
                .entries
                .get_mut(rid)
                .ok_or_else(|| ScanError::InvalidRequest(format!("unknown request '{rid}'")))?;
            match slot.entry.state {
                EntryState::Pending => {
                    retire_slot(self.shared.bus(), slot, EntryState::Aborted, None);
                    let name = slot.entry.queue.clone();
                    if let Some(queue) = book.queues.get_mut(&name) {
                        queue.pending.retain(|r| r != rid);
                        queue.history.push(rid.clone());
                        publish_status(self.shared.bus(), &name, queue);
                    }
                    info!(?kind, "pending entry removed");
                    return Ok(EntryState::Aborted);
                }
                EntryState::Active | EntryState::Paused => {
                    info!(?kind, "stopping active scan");
                    slot.control.request_stop(kind);
                    slot.done.subscribe()
                }
                state => return Ok(state),
            }
        };
        Self::await_terminal(done).await
    }

    async fn await_terminal(mut done: watch::Receiver<Option<EntryState>>) -> ScanResult<EntryState> {
        let state = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ScanError::EngineFault("queue entry dropped".into()))?;
        (*state).ok_or_else(|| ScanError::EngineFault("queue entry has no final state".into()))
    }

    /// Wait until `rid` reaches a terminal state.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown RID.
    pub async fn wait_for(&self, rid: &RequestId) -> ScanResult<EntryState> {
        let done = {
            let book = self.shared.book.lock();
            book.entries
                .get(rid)
                .map(|slot| slot.done.subscribe())
                .ok_or_else(|| ScanError::InvalidRequest(format!("unknown request '{rid}'")))?
        };
        Self::await_terminal(done).await
    }

    /// Stop activating entries and park the active scan at its next
    /// suspension point.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue.
    #[instrument(skip(self))]
    pub fn pause(&self, queue: &str) -> ScanResult<()> {
        let mut guard = self.shared.book.lock();
        let book = &mut *guard;
        let q = book.queues.get_mut(queue).ok_or_else(|| unknown_queue(queue))?;
        q.paused = true;
        if let Some(slot) = q.active.as_ref().and_then(|rid| book.entries.get_mut(rid)) {
            if slot.entry.state == EntryState::Active {
                slot.control.pause();
                slot.entry.state = EntryState::Paused;
                publish_transition(self.shared.bus(), slot, Some(EntryState::Active), EntryState::Paused);
            }
        }
        publish_status(self.shared.bus(), queue, q);
        info!("queue paused");
        Ok(())
    }

    /// Undo [`QueueManager::pause`].
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue.
    #[instrument(skip(self))]
    pub fn resume(&self, queue: &str) -> ScanResult<()> {
        let mut guard = self.shared.book.lock();
        let book = &mut *guard;
        let q = book.queues.get_mut(queue).ok_or_else(|| unknown_queue(queue))?;
        q.paused = false;
        if let Some(slot) = q.active.as_ref().and_then(|rid| book.entries.get_mut(rid)) {
            slot.control.resume();
            if slot.entry.state == EntryState::Paused {
                slot.entry.state = EntryState::Active;
                publish_transition(self.shared.bus(), slot, Some(EntryState::Paused), EntryState::Active);
            }
        }
        publish_status(self.shared.bus(), queue, q);
        q.wake.notify_one();
        info!("queue resumed");
        Ok(())
    }

    /// Stop activating entries and park the active scan once it finishes its
    /// current point. The entry stays ACTIVE until it parks.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue, `EngineFault` outside a runtime.
    #[instrument(skip(self))]
    pub fn defer_pause(&self, queue: &str) -> ScanResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ScanError::EngineFault(format!("no runtime for deferred pause: {e}")))?;
        let mut guard = self.shared.book.lock();
        let book = &mut *guard;
        let q = book.queues.get_mut(queue).ok_or_else(|| unknown_queue(queue))?;
        q.paused = true;
        if let Some(slot) = q.active.as_ref().and_then(|rid| book.entries.get(rid)) {
            if slot.entry.state == EntryState::Active {
                slot.control.defer_pause();
                let shared = self.shared.clone();
                let control = slot.control.clone();
                let rid = slot.entry.rid.clone();
                let mut done = slot.done.subscribe();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = control.parked() => shared.mark_parked(&rid),
                        _ = done.wait_for(Option::is_some) => {}
                    }
                });
            }
        }
        publish_status(self.shared.bus(), queue, q);
        info!("queue pause deferred");
        Ok(())
    }

    /// Abort the active scan of `queue` and put its request back at the
    /// head of the queue, returning the new RID. The call returns once the
    /// old entry has unwound. Without an active scan nothing happens.
    ///
    /// A paused queue stays paused; the restarted entry waits for resume.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue or if the request no longer
    /// validates.
    #[instrument(skip(self))]
    pub async fn restart(&self, queue: &str) -> ScanResult<Option<RequestId>> {
        let (old, new, done) = {
            let mut guard = self.shared.book.lock();
            let book = &mut *guard;
            let q = book.queues.get(queue).ok_or_else(|| unknown_queue(queue))?;
            let Some(old) = q.active.clone() else {
                debug!("nothing to restart");
                return Ok(None);
            };
            let Some(slot) = book.entries.get(&old) else {
                return Ok(None);
            };
            if !matches!(slot.entry.state, EntryState::Active | EntryState::Paused) {
                return Ok(None);
            }
            let request = slot.entry.request.clone();
            let control = slot.control.clone();
            let done = slot.done.subscribe();
            let engine = &self.shared.engine;
            let scan = engine
                .catalogue
                .validate(&request, &engine.registry)
                .and_then(|()| engine.catalogue.build(&request))?;

            let new = RequestId::new();
            let mut restarted = pending_slot(new.clone(), request, scan);
            restarted.entry.restart_of = Some(old.clone());
            publish_transition(self.shared.bus(), &restarted, None, EntryState::Pending);
            book.entries.insert(new.clone(), restarted);
            let q = book.queue_mut(queue)?;
            q.pending.push_front(new.clone());
            publish_status(self.shared.bus(), queue, q);
            control.request_stop(StopKind::Abort);
            (old, new, done)
        };
        let state = Self::await_terminal(done).await?;
        info!(%old, %new, %state, "scan restarted");
        Ok(Some(new))
    }

    /// Replace the pending order.
    ///
    /// # Errors
    /// `InvalidRequest` unless `order` is a permutation of the pending RIDs.
    #[instrument(skip(self, order))]
    pub fn reorder(&self, queue: &str, order: Vec<RequestId>) -> ScanResult<()> {
        let mut book = self.shared.book.lock();
        let q = book.queue_mut(queue)?;
        let mut current: Vec<&RequestId> = q.pending.iter().collect();
        let mut proposed: Vec<&RequestId> = order.iter().collect();
        current.sort();
        proposed.sort();
        if current != proposed {
            return Err(ScanError::InvalidRequest(format!(
                "new order must be a permutation of the {} pending entries of '{queue}'",
                q.pending.len()
            )));
        }
        q.pending = order.into();
        publish_status(self.shared.bus(), queue, q);
        Ok(())
    }

    /// Reposition one pending entry.
    ///
    /// # Errors
    /// `InvalidRequest` if `rid` is not pending in `queue`.
    #[instrument(skip(self, rid), fields(%rid))]
    pub fn move_entry(&self, queue: &str, rid: &RequestId, action: OrderAction) -> ScanResult<()> {
        let mut book = self.shared.book.lock();
        let q = book.queue_mut(queue)?;
        let index = q.pending.iter().position(|r| r == rid).ok_or_else(|| {
            ScanError::InvalidRequest(format!("'{rid}' is not pending in '{queue}'"))
        })?;
        let target = action.target(index, q.pending.len());
        if let Some(entry) = q.pending.remove(index) {
            q.pending.insert(target, entry);
        }
        debug!(from = index, to = target, "entry moved");
        publish_status(self.shared.bus(), queue, q);
        Ok(())
    }

    /// Hold the queue: nothing activates while any lock is held. The active
    /// scan keeps running. Re-adding an id replaces its reason.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue.
    #[instrument(skip(self, reason))]
    pub fn add_lock(&self, queue: &str, id: &str, reason: &str) -> ScanResult<()> {
        let mut book = self.shared.book.lock();
        let q = book.queue_mut(queue)?;
        q.locks.insert(id.to_string(), reason.to_string());
        publish_status(self.shared.bus(), queue, q);
        info!(reason, "queue locked");
        Ok(())
    }

    /// Release a lock; unknown ids are ignored.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue.
    #[instrument(skip(self))]
    pub fn remove_lock(&self, queue: &str, id: &str) -> ScanResult<()> {
        let mut book = self.shared.book.lock();
        let q = book.queue_mut(queue)?;
        if q.locks.remove(id).is_some() {
            publish_status(self.shared.bus(), queue, q);
            q.wake.notify_one();
            info!(state = ?q.state(), "queue lock released");
        }
        Ok(())
    }

    /// Abort every pending entry, returning their RIDs.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown queue.
    #[instrument(skip(self))]
    pub fn clear(&self, queue: &str) -> ScanResult<Vec<RequestId>> {
        let mut guard = self.shared.book.lock();
        let book = &mut *guard;
        let q = book.queue_mut(queue)?;
        let cleared: Vec<RequestId> = q.pending.drain(..).collect();
        for rid in &cleared {
            if let Some(slot) = book.entries.get_mut(rid) {
                retire_slot(self.shared.bus(), slot, EntryState::Aborted, None);
            }
        }
        let q = book.queue_mut(queue)?;
        q.history.extend(cleared.iter().cloned());
        publish_status(self.shared.bus(), queue, q);
        info!(cleared = cleared.len(), "queue cleared");
        Ok(cleared)
    }

    /// Terminal entries of `queue`, oldest first.
    pub fn history(&self, queue: &str) -> Vec<QueueEntry> {
        let book = self.shared.book.lock();
        book.queues
            .get(queue)
            .map(|q| {
                q.history
                    .iter()
                    .filter_map(|rid| book.entries.get(rid).map(|s| s.entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of one entry.
    pub fn entry(&self, rid: &RequestId) -> Option<QueueEntry> {
        self.shared.book.lock().entries.get(rid).map(|s| s.entry.clone())
    }

    /// Run report of a finished entry.
    pub fn report(&self, rid: &RequestId) -> Option<ScanReport> {
        self.shared
            .book
            .lock()
            .entries
            .get(rid)
            .and_then(|s| s.report.clone())
    }

    /// Snapshot of one queue.
    pub fn snapshot(&self, queue: &str) -> Option<QueueStatus> {
        self.shared.book.lock().queues.get(queue).map(|q| q.status(queue))
    }

    /// Names of all queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.shared.book.lock().queues.keys().cloned().collect()
    }

    /// Abort active scans, stop the workers and wait for them.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        {
            let book = self.shared.book.lock();
            for rid in book.queues.values().filter_map(|q| q.active.as_ref()) {
                if let Some(slot) = book.entries.get(rid) {
                    slot.control.request_stop(StopKind::Abort);
                }
            }
        }
        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        for result in join_all(workers).await {
            if let Err(err) = result {
                warn!(error = %err, "queue worker ended abnormally");
            }
        }
        info!("queue manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_actions_clamp() {
        assert_eq!(OrderAction::MoveUp.target(0, 3), 0);
        assert_eq!(OrderAction::MoveUp.target(2, 3), 1);
        assert_eq!(OrderAction::MoveDown.target(2, 3), 2);
        assert_eq!(OrderAction::MoveTop.target(2, 3), 0);
        assert_eq!(OrderAction::MoveBottom.target(0, 3), 2);
        assert_eq!(OrderAction::MoveTo(10).target(0, 3), 2);
        assert_eq!(OrderAction::MoveTo(1).target(0, 3), 1);
    }

    #[test]
    fn queue_state_prefers_locks() {
        let mut queue = Queue::new();
        assert_eq!(queue.state(), QueueState::Running);
        queue.paused = true;
        assert_eq!(queue.state(), QueueState::Paused);
        queue.locks.insert("beam".into(), "beam down".into());
        assert_eq!(queue.state(), QueueState::Locked);
        queue.locks.clear();
        assert_eq!(queue.state(), QueueState::Paused);
    }

    #[test]
    fn order_action_wire_format() {
        let json = serde_json::to_value(OrderAction::MoveTo(2)).unwrap();
        assert_eq!(json["action"], "move_to");
        assert_eq!(json["index"], 2);
        let back: OrderAction = serde_json::from_value(serde_json::json!({"action": "move_top"})).unwrap();
        assert_eq!(back, OrderAction::MoveTop);
    }
}
