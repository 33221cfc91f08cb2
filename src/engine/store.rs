use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::conflict::{now_ms, validate_new, validate_patch};
use super::EngineError;

/// Durable appointment, resource and history state.
///
/// Implementations do not enforce status-transition legality; that is the
/// scheduler's job. When `audit` is given, the history entry must be persisted
/// atomically with the change it describes.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, record: NewAppointment, audit: Option<Audit>) -> Result<Appointment, EngineError>;
    async fn get(&self, id: Ulid) -> Result<Appointment, EngineError>;
    async fn update_fields(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
        audit: Option<Audit>,
    ) -> Result<Appointment, EngineError>;
    /// Hard delete. Returns the removed record.
    async fn delete(&self, id: Ulid, audit: Option<Audit>) -> Result<Appointment, EngineError>;

    async fn list_by_requester(&self, requester_id: Ulid) -> Result<Vec<Appointment>, EngineError>;
    /// Appointments with `resource_id` as provider or support, any status.
    async fn list_by_resource(&self, resource_id: Ulid) -> Result<Vec<Appointment>, EngineError>;
    async fn list_all(&self) -> Result<Vec<Appointment>, EngineError>;
    /// Active appointments on the resource starting in the UTC day containing `at`.
    async fn count_for_resource_on_date(&self, resource_id: Ulid, at: Ms) -> Result<usize, EngineError>;
    /// Active appointment counts per `bucket_ms` bucket, starting at `since`. Empty buckets are omitted.
    async fn group_by_interval_for_resource_since(
        &self,
        resource_id: Ulid,
        since: Ms,
        bucket_ms: Ms,
    ) -> Result<Vec<(Ms, usize)>, EngineError>;
    /// Active bookings on the resource whose start lies in `[from, to)`.
    async fn bookings_for_resource(&self, resource_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError>;

    /// Add a resource. An id that is already registered is a validation error.
    async fn register_resource(&self, resource: Resource) -> Result<(), EngineError>;
    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, EngineError>;
    async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<Resource, EngineError>;
    async fn list_resources(&self) -> Result<Vec<Resource>, EngineError>;

    async fn history(&self, appointment_id: Ulid) -> Result<Vec<HistoryEntry>, EngineError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends: block for the first append, drain whatever
/// else is already queued, then a single fsync answers the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── In-memory state + WAL ────────────────────────────────

struct StoreState {
    appointments: DashMap<Ulid, Appointment>,
    resources: DashMap<Ulid, Resource>,
    /// resource id → active bookings, for provider and support alike.
    bookings: DashMap<Ulid, ResourceBookings>,
    history: DashMap<Ulid, Vec<HistoryEntry>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every persist, exclusive while compacting, so a snapshot never
    /// misses an event that reached the log but not memory.
    compaction: RwLock<()>,
}

impl StoreState {
    fn apply(&self, event: &Event) {
        match event {
            Event::ResourceRegistered { resource } => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::ResourceAvailabilitySet { id, available } => {
                if let Some(mut r) = self.resources.get_mut(id) {
                    r.available = *available;
                }
            }
            Event::AppointmentCreated { appointment, history }
            | Event::AppointmentUpdated { appointment, history } => {
                if let Some(old) = self.appointments.insert(appointment.id, appointment.clone()) {
                    self.unindex(&old);
                }
                self.index(appointment);
                self.record(history);
            }
            Event::AppointmentDeleted { id, history } => {
                if let Some((_, old)) = self.appointments.remove(id) {
                    self.unindex(&old);
                }
                self.record(history);
            }
            Event::HistoryRecorded { entry } => {
                self.history.entry(entry.appointment_id).or_default().push(entry.clone());
            }
        }
    }

    fn index(&self, appt: &Appointment) {
        if !appt.status.is_active() {
            return;
        }
        for rid in appt.resource_ids() {
            self.bookings.entry(rid).or_default().insert(Booking {
                appointment_id: appt.id,
                start: appt.start_time,
                duration_min: appt.duration_min,
            });
        }
    }

    fn unindex(&self, appt: &Appointment) {
        for rid in appt.resource_ids() {
            if let Some(mut rb) = self.bookings.get_mut(&rid) {
                rb.remove(appt.id);
            }
        }
    }

    fn record(&self, entry: &Option<HistoryEntry>) {
        if let Some(entry) = entry {
            self.history.entry(entry.appointment_id).or_default().push(entry.clone());
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Minimal event sequence that recreates the current state.
    fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .resources
            .iter()
            .map(|r| Event::ResourceRegistered { resource: r.value().clone() })
            .collect();
        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|a| a.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentCreated { appointment, history: None }),
        );
        let mut history: Vec<HistoryEntry> = self
            .history
            .iter()
            .flat_map(|h| h.value().clone())
            .collect();
        history.sort_by_key(|h| (h.appointment_id, h.at));
        events.extend(history.into_iter().map(|entry| Event::HistoryRecorded { entry }));
        events
    }
}

/// Appointment store backed by in-memory maps and a group-committed WAL.
#[derive(Clone)]
pub struct WalStore {
    inner: Arc<StoreState>,
    path: PathBuf,
}

impl WalStore {
    /// Replay the log at `wal_path`, dropping any damaged tail, and start the background writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = StoreState {
            appointments: DashMap::new(),
            resources: DashMap::new(),
            bookings: DashMap::new(),
            history: DashMap::new(),
            wal_tx,
            compaction: RwLock::new(()),
        };
        for event in &events {
            inner.apply(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            appointments = inner.appointments.len(),
            resources = inner.resources.len(),
            "store replayed"
        );
        Ok(Self { inner: Arc::new(inner), path: wal_path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// WAL-append then apply, in a task of its own so a cancelled caller can't
    /// leave the log and memory disagreeing.
    async fn persist(&self, event: Event) -> Result<(), EngineError> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _shared = inner.compaction.read().await;
            inner.wal_append(&event).await?;
            inner.apply(&event);
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("persist task failed: {e}")))?
    }

    fn history_entry(appt: &Appointment, audit: Option<Audit>, at: Ms) -> Option<HistoryEntry> {
        audit.map(|a| HistoryEntry {
            appointment_id: appt.id,
            actor_id: a.actor_id,
            action: a.action,
            status: appt.status,
            at,
        })
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.inner.compaction.write().await;
        let events = self.inner.snapshot();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn collect<F>(&self, keep: F) -> Vec<Appointment>
    where
        F: Fn(&Appointment) -> bool,
    {
        let mut out: Vec<Appointment> = self
            .inner
            .appointments
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| (a.start_time, a.id));
        out
    }
}

#[async_trait]
impl AppointmentStore for WalStore {
    async fn create(&self, record: NewAppointment, audit: Option<Audit>) -> Result<Appointment, EngineError> {
        validate_new(&record)?;
        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            requester_id: record.requester_id,
            provider_id: record.provider_id,
            support_id: None,
            service: record.service,
            notes: record.notes,
            location: record.location,
            start_time: record.start_time,
            duration_min: record.duration_min,
            status: AppointmentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let history = Self::history_entry(&appointment, audit, now);
        self.persist(Event::AppointmentCreated { appointment: appointment.clone(), history })
            .await?;
        Ok(appointment)
    }

    async fn get(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.inner
            .appointments
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    async fn update_fields(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
        audit: Option<Audit>,
    ) -> Result<Appointment, EngineError> {
        validate_patch(&patch)?;
        let mut appointment = self.get(id).await?;
        patch.apply(&mut appointment);
        let now = now_ms();
        appointment.updated_at = now;
        let history = Self::history_entry(&appointment, audit, now);
        self.persist(Event::AppointmentUpdated { appointment: appointment.clone(), history })
            .await?;
        Ok(appointment)
    }

    async fn delete(&self, id: Ulid, audit: Option<Audit>) -> Result<Appointment, EngineError> {
        let appointment = self.get(id).await?;
        let history = Self::history_entry(&appointment, audit, now_ms());
        self.persist(Event::AppointmentDeleted { id, history }).await?;
        Ok(appointment)
    }

    async fn list_by_requester(&self, requester_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        Ok(self.collect(|a| a.requester_id == requester_id))
    }

    async fn list_by_resource(&self, resource_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        Ok(self.collect(|a| a.is_assigned_to(resource_id)))
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, EngineError> {
        Ok(self.collect(|_| true))
    }

    async fn count_for_resource_on_date(&self, resource_id: Ulid, at: Ms) -> Result<usize, EngineError> {
        let from = day_start(at);
        Ok(self.bookings_for_resource(resource_id, from, from + DAY_MS).await?.len())
    }

    async fn group_by_interval_for_resource_since(
        &self,
        resource_id: Ulid,
        since: Ms,
        bucket_ms: Ms,
    ) -> Result<Vec<(Ms, usize)>, EngineError> {
        if bucket_ms < MIN_BUCKET_MS {
            return Err(EngineError::validation("bucket too narrow"));
        }
        let bookings = self.bookings_for_resource(resource_id, since, Ms::MAX).await?;
        let mut buckets: BTreeMap<Ms, usize> = BTreeMap::new();
        for b in &bookings {
            let bucket_start = since + (b.start - since) / bucket_ms * bucket_ms;
            *buckets.entry(bucket_start).or_default() += 1;
            if buckets.len() > MAX_BUCKETS {
                return Err(EngineError::validation("too many buckets"));
            }
        }
        Ok(buckets.into_iter().collect())
    }

    async fn bookings_for_resource(&self, resource_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError> {
        Ok(self
            .inner
            .bookings
            .get(&resource_id)
            .map(|rb| rb.starting_in(from, to).to_vec())
            .unwrap_or_default())
    }

    async fn register_resource(&self, resource: Resource) -> Result<(), EngineError> {
        if resource.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::validation("resource name too long"));
        }
        if self.inner.resources.contains_key(&resource.id) {
            return Err(EngineError::Validation(format!(
                "resource {} is already registered",
                resource.id
            )));
        }
        self.persist(Event::ResourceRegistered { resource }).await
    }

    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, EngineError> {
        Ok(self.inner.resources.get(&id).map(|r| r.value().clone()))
    }

    async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<Resource, EngineError> {
        let mut resource = self.get_resource(id).await?.ok_or(EngineError::NotFound(id))?;
        self.persist(Event::ResourceAvailabilitySet { id, available }).await?;
        resource.available = available;
        Ok(resource)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, EngineError> {
        let mut out: Vec<Resource> = self.inner.resources.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn history(&self, appointment_id: Ulid) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self
            .inner
            .history
            .get(&appointment_id)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    /// 2024-01-10T00:00:00Z
    const JAN_10: Ms = 1_704_844_800_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn draft(requester: Ulid, start: Ms, duration_min: i64) -> NewAppointment {
        NewAppointment::new(requester, start, duration_min).with_service("Checkup")
    }

    #[tokio::test]
    async fn create_assigns_pending_and_id() {
        let store = WalStore::open(&test_wal_path("create.wal")).unwrap();
        let requester = Ulid::new();
        let appt = store.create(draft(requester, JAN_10 + 9 * H, 30), None).await.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Pending);
        assert_eq!(appt.requester_id, requester);
        assert_eq!(store.get(appt.id).await.unwrap(), appt);
    }

    #[tokio::test]
    async fn create_rejects_non_positive_duration() {
        let store = WalStore::open(&test_wal_path("create_zero.wal")).unwrap();
        for d in [0, -15] {
            let result = store.create(draft(Ulid::new(), JAN_10, d), None).await;
            assert!(matches!(result, Err(EngineError::Validation(_))), "duration {d}");
        }
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = WalStore::open(&test_wal_path("not_found.wal")).unwrap();
        let id = Ulid::new();
        assert_eq!(store.get(id).await, Err(EngineError::NotFound(id)));
        assert_eq!(
            store.update_fields(id, AppointmentPatch::default(), None).await,
            Err(EngineError::NotFound(id))
        );
        assert_eq!(store.delete(id, None).await, Err(EngineError::NotFound(id)));
    }

    #[tokio::test]
    async fn update_fields_reindexes_bookings() {
        let store = WalStore::open(&test_wal_path("reindex.wal")).unwrap();
        let provider = Ulid::new();
        let appt = store
            .create(draft(Ulid::new(), JAN_10 + 9 * H, 30).with_provider(provider), None)
            .await
            .unwrap();
        assert_eq!(store.bookings_for_resource(provider, JAN_10, JAN_10 + DAY_MS).await.unwrap().len(), 1);

        let moved = store
            .update_fields(
                appt.id,
                AppointmentPatch { start_time: Some(JAN_10 + 14 * H), ..Default::default() },
                None,
            )
            .await
            .unwrap();
        let bookings = store.bookings_for_resource(provider, JAN_10, JAN_10 + DAY_MS).await.unwrap();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].start, moved.start_time);

        store
            .update_fields(appt.id, AppointmentPatch::status(AppointmentStatus::Cancelled), None)
            .await
            .unwrap();
        assert!(store.bookings_for_resource(provider, JAN_10, JAN_10 + DAY_MS).await.unwrap().is_empty());
        // Still listed: listing is by assignment, not activity.
        assert_eq!(store.list_by_resource(provider).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_fields_rejects_non_positive_duration() {
        let store = WalStore::open(&test_wal_path("update_zero.wal")).unwrap();
        let appt = store.create(draft(Ulid::new(), JAN_10, 30), None).await.unwrap();
        let result = store
            .update_fields(appt.id, AppointmentPatch { duration_min: Some(0), ..Default::default() }, None)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(store.get(appt.id).await.unwrap().duration_min, 30);
    }

    #[tokio::test]
    async fn delete_keeps_history() {
        let store = WalStore::open(&test_wal_path("delete_history.wal")).unwrap();
        let requester = Ulid::new();
        let appt = store
            .create(draft(requester, JAN_10, 30), Some(Audit::new(requester, Action::Create)))
            .await
            .unwrap();
        store.delete(appt.id, Some(Audit::new(requester, Action::Delete))).await.unwrap();
        assert!(store.get(appt.id).await.is_err());
        let history = store.history(appt.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, Action::Delete);
    }

    #[tokio::test]
    async fn lists_by_requester_and_resource() {
        let store = WalStore::open(&test_wal_path("lists.wal")).unwrap();
        let (u1, u2, provider) = (Ulid::new(), Ulid::new(), Ulid::new());
        store.create(draft(u1, JAN_10 + 9 * H, 30).with_provider(provider), None).await.unwrap();
        store.create(draft(u1, JAN_10 + 11 * H, 30), None).await.unwrap();
        store.create(draft(u2, JAN_10 + 10 * H, 30).with_provider(provider), None).await.unwrap();

        let mine = store.list_by_requester(u1).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine[0].start_time < mine[1].start_time);
        assert_eq!(store.list_by_resource(provider).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn day_count_and_daily_groups() {
        let store = WalStore::open(&test_wal_path("groups.wal")).unwrap();
        let provider = Ulid::new();
        for start in [JAN_10 + 9 * H, JAN_10 + 10 * H, JAN_10 + DAY_MS + 9 * H, JAN_10 + 3 * DAY_MS] {
            store
                .create(draft(Ulid::new(), start, 30).with_provider(provider), None)
                .await
                .unwrap();
        }
        assert_eq!(store.count_for_resource_on_date(provider, JAN_10 + 15 * H).await.unwrap(), 2);
        assert_eq!(store.count_for_resource_on_date(provider, JAN_10 + 2 * DAY_MS).await.unwrap(), 0);

        let groups = store
            .group_by_interval_for_resource_since(provider, JAN_10, DAY_MS)
            .await
            .unwrap();
        assert_eq!(
            groups,
            vec![(JAN_10, 2), (JAN_10 + DAY_MS, 1), (JAN_10 + 3 * DAY_MS, 1)]
        );

        let narrow = store.group_by_interval_for_resource_since(provider, JAN_10, 1).await;
        assert!(matches!(narrow, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn resource_flag_round_trip() {
        let store = WalStore::open(&test_wal_path("resource_flag.wal")).unwrap();
        let r = Resource::new(Ulid::new(), ResourceKind::Support, Some("Interpreter".into()));
        store.register_resource(r.clone()).await.unwrap();
        let updated = store.set_resource_available(r.id, false).await.unwrap();
        assert!(!updated.available);
        assert!(!store.get_resource(r.id).await.unwrap().unwrap().available);

        let missing = Ulid::new();
        assert_eq!(
            store.set_resource_available(missing, true).await,
            Err(EngineError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn register_refuses_known_id() {
        let store = WalStore::open(&test_wal_path("register_twice.wal")).unwrap();
        let r = Resource::new(Ulid::new(), ResourceKind::Provider, Some("Dr. Ada".into()));
        store.register_resource(r.clone()).await.unwrap();
        store.set_resource_available(r.id, false).await.unwrap();

        let again = store
            .register_resource(Resource::new(r.id, ResourceKind::Support, None))
            .await;
        assert!(matches!(again, Err(EngineError::Validation(_))));
        assert_eq!(
            store.get_resource(r.id).await.unwrap(),
            Some(Resource { available: false, ..r })
        );
    }

    #[tokio::test]
    async fn replay_reconstructs_state() {
        let path = test_wal_path("replay.wal");
        let requester = Ulid::new();
        let provider = Resource::new(Ulid::new(), ResourceKind::Provider, Some("Dr. Ada".into()));
        let appt_id;
        {
            let store = WalStore::open(&path).unwrap();
            store.register_resource(provider.clone()).await.unwrap();
            let appt = store
                .create(
                    draft(requester, JAN_10 + 9 * H, 30).with_provider(provider.id),
                    Some(Audit::new(requester, Action::Create)),
                )
                .await
                .unwrap();
            store
                .update_fields(
                    appt.id,
                    AppointmentPatch::status(AppointmentStatus::Confirmed),
                    Some(Audit::new(provider.id, Action::Confirm)),
                )
                .await
                .unwrap();
            appt_id = appt.id;
        }

        let store = WalStore::open(&path).unwrap();
        let appt = store.get(appt_id).await.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
        assert_eq!(store.get_resource(provider.id).await.unwrap(), Some(provider.clone()));
        assert_eq!(store.history(appt_id).await.unwrap().len(), 2);
        assert_eq!(
            store.bookings_for_resource(provider.id, JAN_10, JAN_10 + DAY_MS).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let requester = Ulid::new();
        let support = Resource::new(Ulid::new(), ResourceKind::Support, None);
        let kept;
        let deleted;
        {
            let store = WalStore::open(&path).unwrap();
            store.register_resource(support.clone()).await.unwrap();
            for flag in [false, true, false] {
                store.set_resource_available(support.id, flag).await.unwrap();
            }
            let audit = Some(Audit::new(requester, Action::Create));
            kept = store.create(draft(requester, JAN_10 + 9 * H, 30), audit).await.unwrap();
            deleted = store.create(draft(requester, JAN_10 + 10 * H, 30), audit).await.unwrap();
            store
                .delete(deleted.id, Some(Audit::new(requester, Action::Delete)))
                .await
                .unwrap();
            assert_eq!(store.appends_since_compact().await, 7);

            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = WalStore::open(&path).unwrap();
        assert!(!store.get_resource(support.id).await.unwrap().unwrap().available);
        assert_eq!(store.get(kept.id).await.unwrap(), kept);
        assert!(store.get(deleted.id).await.is_err());
        assert_eq!(store.history(kept.id).await.unwrap().len(), 1);
        assert_eq!(store.history(deleted.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn group_commit_under_concurrency() {
        let path = test_wal_path("group_commit.wal");
        let store = WalStore::open(&path).unwrap();
        let requester = Ulid::new();
        let mut handles = Vec::new();
        for i in 0..20 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.create(draft(requester, JAN_10 + i * H, 30), None).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.list_by_requester(requester).await.unwrap().len(), 20);

        let replayed = WalStore::open(&path).unwrap();
        assert_eq!(replayed.list_by_requester(requester).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn appends_after_torn_tail_survive_restart() {
        use std::io::Write;

        let path = test_wal_path("torn_tail_restart.wal");
        let requester = Ulid::new();
        let first = {
            let store = WalStore::open(&path).unwrap();
            store.create(draft(requester, JAN_10 + 9 * H, 30), None).await.unwrap()
        };
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let second = {
            let store = WalStore::open(&path).unwrap();
            assert_eq!(store.get(first.id).await.unwrap(), first);
            let second = store.create(draft(requester, JAN_10 + 10 * H, 30), None).await.unwrap();
            assert_eq!(store.get(second.id).await.unwrap(), second);
            second
        };

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list_by_requester(requester).await.unwrap(), vec![first, second]);
    }
}
