mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{first_overlap, AvailabilityChecker, Conflict};
pub use conflict::parse_time;
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use mutations::allowed_actions;
pub use queries::ResourceOverview;
pub use store::{AppointmentStore, WalStore};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::AuthorizationGate;
use crate::limits::MAX_LOCK_ATTEMPTS;
use crate::model::*;
use crate::notify::{NotificationSink, Notice};
use crate::observability;

// ── Per-key locks ────────────────────────────────────────

type LockMap = Arc<DashMap<Ulid, Arc<Mutex<()>>>>;

/// One async mutex per appointment or resource id, created on first use.
#[derive(Default)]
struct LockTable {
    locks: LockMap,
}

impl LockTable {
    /// Acquire every key in sorted order so two callers can never wait on each other.
    async fn acquire(&self, mut keys: Vec<Ulid>) -> HeldLocks {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.locks.entry(*key).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        HeldLocks { table: self.locks.clone(), keys, guards }
    }
}

/// Guards for a sorted key set. Dropping releases them and forgets idle entries.
pub(crate) struct HeldLocks {
    table: LockMap,
    keys: Vec<Ulid>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn covers(&self, key: Ulid) -> bool {
        self.keys.binary_search(&key).is_ok()
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            // Entry creation clones under the same shard lock, so a count of one
            // means nobody holds or is about to wait on this mutex.
            self.table.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The appointment scheduler: state machine, authorization, conflict checks,
/// history and notification around an injected store.
pub struct Engine {
    store: Arc<dyn AppointmentStore>,
    checker: AvailabilityChecker,
    sink: Arc<dyn NotificationSink>,
    gate: Arc<dyn AuthorizationGate>,
    locks: LockTable,
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        sink: Arc<dyn NotificationSink>,
        gate: Arc<dyn AuthorizationGate>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            checker: AvailabilityChecker::new(store.clone()),
            store,
            sink,
            gate,
            locks: LockTable::default(),
            lock_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn AppointmentStore> {
        &self.store
    }

    pub fn checker(&self) -> &AvailabilityChecker {
        &self.checker
    }

    async fn lock(&self, keys: Vec<Ulid>) -> Result<HeldLocks, EngineError> {
        let started = Instant::now();
        let held = tokio::time::timeout(self.lock_timeout, self.locks.acquire(keys))
            .await
            .map_err(|_| EngineError::Storage("timed out waiting for appointment lock".into()))?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(held)
    }

    /// Lock the appointment, its assigned resources and `extra`, then re-read it.
    /// If the assignment moved while we waited, release and try again.
    pub(super) async fn lock_appointment(
        &self,
        id: Ulid,
        extra: &[Ulid],
    ) -> Result<(Appointment, HeldLocks), EngineError> {
        let mut current = self.store.get(id).await?;
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let keys: Vec<Ulid> = std::iter::once(id)
                .chain(current.resource_ids())
                .chain(extra.iter().copied())
                .collect();
            let held = self.lock(keys).await?;
            let fresh = self.store.get(id).await?;
            if fresh.resource_ids().all(|r| held.covers(r)) {
                return Ok((fresh, held));
            }
            debug!(appointment = %id, attempt, "assignment changed while locking, retrying");
            drop(held);
            current = fresh;
        }
        Err(EngineError::Storage(format!(
            "appointment {id} kept changing while waiting for locks"
        )))
    }

    pub(super) async fn lock_resources(&self, keys: Vec<Ulid>) -> Result<HeldLocks, EngineError> {
        self.lock(keys).await
    }

    /// Run the store write in its own task, releasing `held` only once it has landed.
    /// A caller dropped mid-commit can't free the locks early.
    pub(super) async fn commit<T, F, Fut>(&self, held: HeldLocks, write: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<dyn AppointmentStore>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = write(store).await;
            drop(held);
            result
        })
        .await
        .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }

    pub(super) fn authorize(
        &self,
        actor: &Actor,
        appointment: &Appointment,
        action: Action,
    ) -> Result<(), EngineError> {
        if self.gate.can_act(actor, appointment, action) {
            return Ok(());
        }
        Err(self.deny_access(actor, action, Some(appointment.id)))
    }

    pub(super) fn deny_access(&self, actor: &Actor, action: Action, target: Option<Ulid>) -> EngineError {
        metrics::counter!(observability::AUTH_DENIALS_TOTAL, "action" => action.as_str()).increment(1);
        warn!(actor = %actor.id, role = ?actor.role, %action, target = ?target, "authorization denied");
        EngineError::Unauthorized { actor: actor.id, action }
    }

    /// Check `resource_id` for the candidate interval; a hit becomes a `Conflict` error.
    pub(super) async fn ensure_free(
        &self,
        action: Action,
        resource_id: Ulid,
        start_time: Ms,
        duration_min: i64,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        match self
            .checker
            .find_conflict(resource_id, start_time, duration_min, exclude)
            .await?
        {
            None => Ok(()),
            Some(conflict) => {
                metrics::counter!(observability::CONFLICTS_TOTAL, "action" => action.as_str()).increment(1);
                Err(conflict.into_error(resource_id))
            }
        }
    }

    pub(super) fn committed(action: Action, appointment: &Appointment) {
        metrics::counter!(
            observability::TRANSITIONS_TOTAL,
            "action" => action.as_str(),
            "status" => appointment.status.as_str()
        )
        .increment(1);
        info!(
            appointment = %appointment.id,
            %action,
            status = %appointment.status,
            "transition committed"
        );
    }

    /// Tally and log a failed operation, then hand the result back untouched.
    pub(super) fn observe<T>(action: Action, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            metrics::counter!(
                observability::REJECTIONS_TOTAL,
                "action" => action.as_str(),
                "kind" => e.kind()
            )
            .increment(1);
            if e.is_retryable() {
                warn!(%action, "{e}");
            } else {
                debug!(%action, "rejected: {e}");
            }
        }
        result
    }

    /// Tell the requester about a provider decision. Failures are logged, never returned.
    pub(super) async fn notify_outcome(&self, actor: &Actor, appointment: &Appointment) {
        let actor_name = match self.store.get_resource(actor.id).await {
            Ok(Some(Resource { name: Some(name), .. })) => name,
            _ => actor.id.to_string(),
        };
        let notice = Notice {
            status: appointment.status,
            appointment: appointment.clone(),
            actor_name,
        };
        if let Err(e) = self.sink.notify(appointment.requester_id, notice).await {
            metrics::counter!(observability::NOTIFY_FAILURES_TOTAL).increment(1);
            warn!(appointment = %appointment.id, requester = %appointment.requester_id, "{e}");
        }
    }
}
