use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Booking load for one resource: today, and each day of the current week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverview {
    pub resource: Resource,
    pub today: usize,
    /// Seven `(day_start, active_count)` pairs, Monday first.
    pub week: Vec<(Ms, usize)>,
}

impl Engine {
    pub async fn get(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::observe(Action::Read, self.read(actor, id).await)
    }

    /// Everything the actor can see: own appointments for requesters, assigned
    /// ones for providers and support, all of them for admins.
    pub async fn list_for_actor(&self, actor: &Actor) -> Result<Vec<Appointment>, EngineError> {
        match actor.role {
            Role::Admin => self.store.list_all().await,
            Role::Requester => self.store.list_by_requester(actor.id).await,
            Role::Provider | Role::Support => self.store.list_by_resource(actor.id).await,
        }
    }

    /// History outlives the appointment. Once it is deleted, admins and the actors
    /// named in the history can still read it.
    pub async fn history(&self, actor: &Actor, id: Ulid) -> Result<Vec<HistoryEntry>, EngineError> {
        Self::observe(Action::Read, self.read_history(actor, id).await)
    }

    pub async fn resource_overview(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        now: Ms,
    ) -> Result<ResourceOverview, EngineError> {
        Self::observe(Action::Read, self.overview(actor, resource_id, now).await)
    }

    async fn read(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let appt = self.store.get(id).await?;
        self.authorize(actor, &appt, Action::Read)?;
        Ok(appt)
    }

    async fn read_history(&self, actor: &Actor, id: Ulid) -> Result<Vec<HistoryEntry>, EngineError> {
        match self.store.get(id).await {
            Ok(appt) => {
                self.authorize(actor, &appt, Action::Read)?;
                self.store.history(id).await
            }
            Err(EngineError::NotFound(_)) => {
                let entries = self.store.history(id).await?;
                if entries.is_empty() {
                    return Err(EngineError::NotFound(id));
                }
                if !actor.is_admin() && !entries.iter().any(|e| e.actor_id == actor.id) {
                    return Err(self.deny_access(actor, Action::Read, Some(id)));
                }
                Ok(entries)
            }
            Err(e) => Err(e),
        }
    }

    async fn overview(&self, actor: &Actor, resource_id: Ulid, now: Ms) -> Result<ResourceOverview, EngineError> {
        let resource = self
            .store
            .get_resource(resource_id)
            .await?
            .ok_or(EngineError::NotFound(resource_id))?;
        if !actor.is_admin() && actor.id != resource_id {
            return Err(self.deny_access(actor, Action::Read, Some(resource_id)));
        }

        let today = self.store.count_for_resource_on_date(resource_id, now).await?;
        let monday = week_start(now);
        let bookings = self
            .store
            .bookings_for_resource(resource_id, monday, monday + WEEK_MS)
            .await?;
        let week = (0..7)
            .map(|d| {
                let day = monday + d * DAY_MS;
                let count = bookings.iter().filter(|b| day_start(b.start) == day).count();
                (day, count)
            })
            .collect();

        Ok(ResourceOverview { resource, today, week })
    }
}
