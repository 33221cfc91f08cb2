use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;
pub const WEEK_MS: Ms = 7 * DAY_MS;

pub fn minutes_to_ms(minutes: i64) -> Ms {
    minutes.saturating_mul(MINUTE_MS)
}

/// True iff `[a_start, a_start + a_duration)` and `[b_start, b_start + b_duration)` intersect.
/// Durations are minutes. An interval ending exactly where the other starts does not overlap.
pub fn overlaps(a_start: Ms, a_duration_min: i64, b_start: Ms, b_duration_min: i64) -> bool {
    let a_end = a_start.saturating_add(minutes_to_ms(a_duration_min));
    let b_end = b_start.saturating_add(minutes_to_ms(b_duration_min));
    a_start < b_end && b_start < a_end
}

/// Start of the UTC day containing `t`.
pub fn day_start(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Start of the UTC week (Monday 00:00) containing `t`.
pub fn week_start(t: Ms) -> Ms {
    let days = t.div_euclid(DAY_MS);
    // 1970-01-01 was a Thursday.
    let since_monday = (days + 3).rem_euclid(7);
    (days - since_monday) * DAY_MS
}

/// Parse an RFC 3339 timestamp. Minute precision (`2024-01-10T09:00Z`) is accepted too.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_timestamp(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| t.to_string())
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_minutes(start: Ms, duration_min: i64) -> Self {
        Self::new(start, start.saturating_add(minutes_to_ms(duration_min)))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Denied,
    Cancelled,
    Rescheduled,
    Dispatched,
}

impl AppointmentStatus {
    /// Statuses that occupy their resources for double-booking purposes.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Confirmed | Self::Dispatched | Self::Rescheduled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Denied => "DENIED",
            Self::Cancelled => "CANCELLED",
            Self::Rescheduled => "RESCHEDULED",
            Self::Dispatched => "DISPATCHED",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Provider,
    Support,
    Admin,
}

/// Whoever is driving the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn requester(id: Ulid) -> Self {
        Self { id, role: Role::Requester }
    }

    pub fn provider(id: Ulid) -> Self {
        Self { id, role: Role::Provider }
    }

    pub fn support(id: Ulid) -> Self {
        Self { id, role: Role::Support }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Read,
    Confirm,
    Deny,
    Cancel,
    Reschedule,
    AssignSupport,
    Delete,
    /// Toggle a resource's bookability. Resource-scoped, not appointment-scoped.
    SetAvailability,
    /// Add a provider or support resource. Admin only.
    RegisterResource,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Confirm => "confirm",
            Self::Deny => "deny",
            Self::Cancel => "cancel",
            Self::Reschedule => "reschedule",
            Self::AssignSupport => "assign_support",
            Self::Delete => "delete",
            Self::SetAvailability => "set_availability",
            Self::RegisterResource => "register_resource",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Provider,
    Support,
}

/// A bookable provider or support resource. The id is the id of the user it represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub kind: ResourceKind,
    /// Display name, shown in notifications.
    pub name: Option<String>,
    /// Global bookability gate, independent of any interval.
    pub available: bool,
}

impl Resource {
    pub fn new(id: Ulid, kind: ResourceKind, name: Option<String>) -> Self {
        Self { id, kind, name, available: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub provider_id: Option<Ulid>,
    pub support_id: Option<Ulid>,
    pub service: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub start_time: Ms,
    /// Minutes, always positive once stored.
    pub duration_min: i64,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start_time, self.duration_min)
    }

    /// Provider and support ids, whichever are assigned.
    pub fn resource_ids(&self) -> impl Iterator<Item = Ulid> {
        self.provider_id.into_iter().chain(self.support_id)
    }

    pub fn is_assigned_to(&self, resource_id: Ulid) -> bool {
        self.provider_id == Some(resource_id) || self.support_id == Some(resource_id)
    }
}

/// Input for a new appointment; the store fills in id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub requester_id: Ulid,
    #[serde(default)]
    pub provider_id: Option<Ulid>,
    #[serde(default)]
    pub service: Option<String>,
    pub start_time: Ms,
    pub duration_min: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl NewAppointment {
    pub fn new(requester_id: Ulid, start_time: Ms, duration_min: i64) -> Self {
        Self {
            requester_id,
            provider_id: None,
            service: None,
            start_time,
            duration_min,
            notes: None,
            location: None,
        }
    }

    pub fn with_provider(mut self, provider_id: Ulid) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

/// New time (and optionally service) for an existing appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reschedule {
    pub start_time: Ms,
    pub duration_min: i64,
    #[serde(default)]
    pub service: Option<String>,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub provider_id: Option<Ulid>,
    pub support_id: Option<Ulid>,
    pub service: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub start_time: Option<Ms>,
    pub duration_min: Option<i64>,
    pub status: Option<AppointmentStatus>,
}

impl AppointmentPatch {
    pub fn status(status: AppointmentStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn apply(self, appt: &mut Appointment) {
        if let Some(p) = self.provider_id {
            appt.provider_id = Some(p);
        }
        if let Some(s) = self.support_id {
            appt.support_id = Some(s);
        }
        if self.service.is_some() {
            appt.service = self.service;
        }
        if self.notes.is_some() {
            appt.notes = self.notes;
        }
        if self.location.is_some() {
            appt.location = self.location;
        }
        if let Some(t) = self.start_time {
            appt.start_time = t;
        }
        if let Some(d) = self.duration_min {
            appt.duration_min = d;
        }
        if let Some(s) = self.status {
            appt.status = s;
        }
    }
}

/// Who committed a change and why; the store turns it into a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Audit {
    pub actor_id: Ulid,
    pub action: Action,
}

impl Audit {
    pub fn new(actor_id: Ulid, action: Action) -> Self {
        Self { actor_id, action }
    }
}

/// One committed status change. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub appointment_id: Ulid,
    pub actor_id: Ulid,
    pub action: Action,
    /// Status after the change (status at removal time for deletes).
    pub status: AppointmentStatus,
    pub at: Ms,
}

/// An active appointment as seen from one resource's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub appointment_id: Ulid,
    pub start: Ms,
    pub duration_min: i64,
}

/// Active bookings on one resource, sorted by start.
#[derive(Debug, Clone, Default)]
pub struct ResourceBookings {
    pub bookings: Vec<Booking>,
}

impl ResourceBookings {
    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<Booking> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.appointment_id == appointment_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose start lies in `[from, to)`.
    pub fn starting_in(&self, from: Ms, to: Ms) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.start < from);
        let hi = self.bookings.partition_point(|b| b.start < to);
        &self.bookings[lo..hi.max(lo)]
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        resource: Resource,
    },
    ResourceAvailabilitySet {
        id: Ulid,
        available: bool,
    },
    AppointmentCreated {
        appointment: Appointment,
        history: Option<HistoryEntry>,
    },
    AppointmentUpdated {
        appointment: Appointment,
        history: Option<HistoryEntry>,
    },
    AppointmentDeleted {
        id: Ulid,
        history: Option<HistoryEntry>,
    },
    /// Standalone history entry; only compaction snapshots emit these.
    HistoryRecorded {
        entry: HistoryEntry,
    },
}
