use std::sync::Arc;

use ulid::Ulid;

use crate::limits::MAX_DURATION_MINUTES;
use crate::model::*;

use super::store::AppointmentStore;
use super::EngineError;

// ── Availability Checker ──────────────────────────────────────────

/// Conflict detection for one resource over one candidate interval.
///
/// Fails closed: an unknown resource, or one whose `available` flag is off,
/// is never available. Not atomic on its own; callers that commit on the
/// answer must hold the resource's lock across check and commit.
#[derive(Clone)]
pub struct AvailabilityChecker {
    store: Arc<dyn AppointmentStore>,
}

impl AvailabilityChecker {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    pub async fn is_available(
        &self,
        resource_id: Ulid,
        start_time: Ms,
        duration_min: i64,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .find_conflict(resource_id, start_time, duration_min, exclude)
            .await?
            .is_none())
    }

    /// `Some(Conflict::Unavailable)` for missing/disabled resources, otherwise the first
    /// active booking that overlaps the candidate.
    pub async fn find_conflict(
        &self,
        resource_id: Ulid,
        start_time: Ms,
        duration_min: i64,
        exclude: Option<Ulid>,
    ) -> Result<Option<Conflict>, EngineError> {
        match self.store.get_resource(resource_id).await? {
            Some(r) if r.available => {}
            _ => return Ok(Some(Conflict::Unavailable)),
        }

        // Anything starting more than the longest allowed duration earlier has ended.
        let from = start_time.saturating_sub(minutes_to_ms(MAX_DURATION_MINUTES));
        let to = start_time.saturating_add(minutes_to_ms(duration_min));
        let bookings = self.store.bookings_for_resource(resource_id, from, to).await?;

        Ok(first_overlap(&bookings, start_time, duration_min, exclude).map(Conflict::Booked))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Resource missing or switched off.
    Unavailable,
    /// Overlaps this active appointment.
    Booked(Ulid),
}

impl Conflict {
    pub fn into_error(self, resource_id: Ulid) -> EngineError {
        EngineError::Conflict {
            resource_id,
            appointment_id: match self {
                Conflict::Unavailable => None,
                Conflict::Booked(id) => Some(id),
            },
        }
    }
}

/// First booking (other than `exclude`) overlapping `[start, start + duration)`.
pub fn first_overlap(
    bookings: &[Booking],
    start_time: Ms,
    duration_min: i64,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    bookings
        .iter()
        .filter(|b| Some(b.appointment_id) != exclude)
        .find(|b| overlaps(b.start, b.duration_min, start_time, duration_min))
        .map(|b| b.appointment_id)
}
