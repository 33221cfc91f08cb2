use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{validate_new, validate_patch};
use super::{Engine, EngineError};

/// Actions the state machine accepts from `status`.
pub fn allowed_actions(status: AppointmentStatus) -> Vec<Action> {
    use AppointmentStatus::*;
    match status {
        Pending | Rescheduled => vec![
            Action::Confirm,
            Action::Deny,
            Action::Cancel,
            Action::Reschedule,
            Action::AssignSupport,
            Action::Delete,
        ],
        Confirmed => vec![Action::Cancel, Action::Reschedule, Action::AssignSupport, Action::Delete],
        Denied | Cancelled | Dispatched => vec![Action::Delete],
    }
}

fn guard_transition(from: AppointmentStatus, action: Action) -> Result<(), EngineError> {
    let allowed = allowed_actions(from);
    if allowed.contains(&action) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, action, allowed })
    }
}

/// The provider an actor would become by acting on an unassigned appointment.
fn claimant(actor: &Actor) -> Option<Ulid> {
    (actor.role == Role::Provider).then_some(actor.id)
}

/// What the record would look like once created, for the ownership check.
fn provisional(record: &NewAppointment) -> Appointment {
    Appointment {
        id: Ulid::nil(),
        requester_id: record.requester_id,
        provider_id: record.provider_id,
        support_id: None,
        service: record.service.clone(),
        notes: record.notes.clone(),
        location: record.location.clone(),
        start_time: record.start_time,
        duration_min: record.duration_min,
        status: AppointmentStatus::Pending,
        created_at: 0,
        updated_at: 0,
    }
}

impl Engine {
    pub async fn create(&self, actor: &Actor, record: NewAppointment) -> Result<Appointment, EngineError> {
        Self::observe(Action::Create, self.try_create(actor, record).await)
    }

    pub async fn confirm(
        &self,
        actor: &Actor,
        id: Ulid,
        support_id: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        Self::observe(Action::Confirm, self.try_confirm(actor, id, support_id).await)
    }

    pub async fn deny(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::observe(Action::Deny, self.try_deny(actor, id).await)
    }

    pub async fn cancel(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::observe(Action::Cancel, self.try_cancel(actor, id).await)
    }

    pub async fn reschedule(
        &self,
        actor: &Actor,
        id: Ulid,
        change: Reschedule,
    ) -> Result<Appointment, EngineError> {
        Self::observe(Action::Reschedule, self.try_reschedule(actor, id, change).await)
    }

    /// Attach a support resource. `support_id` is required; `None` is a validation error.
    pub async fn assign_support(
        &self,
        actor: &Actor,
        id: Ulid,
        support_id: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        Self::observe(Action::AssignSupport, self.try_assign_support(actor, id, support_id).await)
    }

    /// Hard delete. History is kept.
    pub async fn delete(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::observe(Action::Delete, self.try_delete(actor, id).await)
    }

    /// Make a provider or support bookable. Admin only; an id registers once.
    pub async fn register_resource(&self, actor: &Actor, resource: Resource) -> Result<(), EngineError> {
        Self::observe(
            Action::RegisterResource,
            self.try_register_resource(actor, resource).await,
        )
    }

    /// Open or close a resource for booking. Only the resource itself or an admin may.
    pub async fn set_resource_availability(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        available: bool,
    ) -> Result<Resource, EngineError> {
        Self::observe(
            Action::SetAvailability,
            self.try_set_resource_availability(actor, resource_id, available).await,
        )
    }

    // ── Transitions ──────────────────────────────────────

    async fn try_create(&self, actor: &Actor, record: NewAppointment) -> Result<Appointment, EngineError> {
        self.authorize(actor, &provisional(&record), Action::Create)?;
        validate_new(&record)?;

        let held = self.lock_resources(record.provider_id.into_iter().collect()).await?;
        if let Some(provider) = record.provider_id {
            self.require_kind(provider, ResourceKind::Provider).await?;
            self.ensure_free(Action::Create, provider, record.start_time, record.duration_min, None)
                .await?;
        }

        let audit = Audit::new(actor.id, Action::Create);
        let created = self
            .commit(held, move |store| async move { store.create(record, Some(audit)).await })
            .await?;
        Self::committed(Action::Create, &created);
        Ok(created)
    }

    async fn try_confirm(
        &self,
        actor: &Actor,
        id: Ulid,
        support_id: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        let extra: Vec<Ulid> = claimant(actor).into_iter().chain(support_id).collect();
        let (appt, held) = self.lock_appointment(id, &extra).await?;
        self.authorize(actor, &appt, Action::Confirm)?;
        guard_transition(appt.status, Action::Confirm)?;
        if let Some(support) = support_id {
            self.require_kind(support, ResourceKind::Support).await?;
        }

        let claimed = appt.provider_id.is_none().then(|| claimant(actor)).flatten();
        if let Some(provider) = appt.provider_id.or(claimed) {
            self.ensure_free(Action::Confirm, provider, appt.start_time, appt.duration_min, Some(id))
                .await?;
        }
        if let Some(support) = support_id {
            self.ensure_free(Action::Confirm, support, appt.start_time, appt.duration_min, Some(id))
                .await?;
        }

        let patch = AppointmentPatch {
            provider_id: claimed,
            support_id,
            status: Some(AppointmentStatus::Confirmed),
            ..Default::default()
        };
        let confirmed = self.commit_patch(held, id, patch, Audit::new(actor.id, Action::Confirm)).await?;
        Self::committed(Action::Confirm, &confirmed);
        self.notify_outcome(actor, &confirmed).await;
        Ok(confirmed)
    }

    async fn try_deny(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let (appt, held) = self.lock_appointment(id, &[]).await?;
        self.authorize(actor, &appt, Action::Deny)?;
        guard_transition(appt.status, Action::Deny)?;

        let patch = AppointmentPatch {
            provider_id: appt.provider_id.is_none().then(|| claimant(actor)).flatten(),
            status: Some(AppointmentStatus::Denied),
            ..Default::default()
        };
        let denied = self.commit_patch(held, id, patch, Audit::new(actor.id, Action::Deny)).await?;
        Self::committed(Action::Deny, &denied);
        self.notify_outcome(actor, &denied).await;
        Ok(denied)
    }

    async fn try_cancel(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let (appt, held) = self.lock_appointment(id, &[]).await?;
        self.authorize(actor, &appt, Action::Cancel)?;
        guard_transition(appt.status, Action::Cancel)?;

        let patch = AppointmentPatch::status(AppointmentStatus::Cancelled);
        let cancelled = self.commit_patch(held, id, patch, Audit::new(actor.id, Action::Cancel)).await?;
        Self::committed(Action::Cancel, &cancelled);
        Ok(cancelled)
    }

    async fn try_reschedule(
        &self,
        actor: &Actor,
        id: Ulid,
        change: Reschedule,
    ) -> Result<Appointment, EngineError> {
        let (appt, held) = self.lock_appointment(id, &[]).await?;
        self.authorize(actor, &appt, Action::Reschedule)?;
        guard_transition(appt.status, Action::Reschedule)?;

        let patch = AppointmentPatch {
            start_time: Some(change.start_time),
            duration_min: Some(change.duration_min),
            service: change.service,
            status: Some(AppointmentStatus::Rescheduled),
            ..Default::default()
        };
        validate_patch(&patch)?;
        for resource in appt.resource_ids() {
            self.ensure_free(Action::Reschedule, resource, change.start_time, change.duration_min, Some(id))
                .await?;
        }

        let moved = self.commit_patch(held, id, patch, Audit::new(actor.id, Action::Reschedule)).await?;
        Self::committed(Action::Reschedule, &moved);
        Ok(moved)
    }

    async fn try_assign_support(
        &self,
        actor: &Actor,
        id: Ulid,
        support_id: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        let extra: Vec<Ulid> = support_id.into_iter().collect();
        let (appt, held) = self.lock_appointment(id, &extra).await?;
        self.authorize(actor, &appt, Action::AssignSupport)?;
        if !actor.is_admin() && !self.is_registered(actor.id, ResourceKind::Provider).await? {
            return Err(self.deny_access(actor, Action::AssignSupport, Some(id)));
        }
        guard_transition(appt.status, Action::AssignSupport)?;

        let support = support_id.ok_or_else(|| EngineError::validation("support_id is required"))?;
        self.require_kind(support, ResourceKind::Support).await?;
        self.ensure_free(Action::AssignSupport, support, appt.start_time, appt.duration_min, Some(id))
            .await?;

        let patch = AppointmentPatch { support_id: Some(support), ..Default::default() };
        let assigned = self
            .commit_patch(held, id, patch, Audit::new(actor.id, Action::AssignSupport))
            .await?;
        Self::committed(Action::AssignSupport, &assigned);
        Ok(assigned)
    }

    async fn try_delete(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let (appt, held) = self.lock_appointment(id, &[]).await?;
        self.authorize(actor, &appt, Action::Delete)?;
        guard_transition(appt.status, Action::Delete)?;

        let audit = Audit::new(actor.id, Action::Delete);
        let removed = self
            .commit(held, move |store| async move { store.delete(id, Some(audit)).await })
            .await?;
        Self::committed(Action::Delete, &removed);
        Ok(removed)
    }

    async fn try_register_resource(&self, actor: &Actor, resource: Resource) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(self.deny_access(actor, Action::RegisterResource, Some(resource.id)));
        }
        let held = self.lock_resources(vec![resource.id]).await?;
        let (id, kind) = (resource.id, resource.kind);
        self.commit(held, move |store| async move { store.register_resource(resource).await })
            .await?;
        info!(resource = %id, ?kind, "resource registered");
        Ok(())
    }

    async fn try_set_resource_availability(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        available: bool,
    ) -> Result<Resource, EngineError> {
        self.store
            .get_resource(resource_id)
            .await?
            .ok_or(EngineError::NotFound(resource_id))?;
        if !actor.is_admin() && actor.id != resource_id {
            return Err(self.deny_access(actor, Action::SetAvailability, Some(resource_id)));
        }
        let held = self.lock_resources(vec![resource_id]).await?;
        let resource = self
            .commit(held, move |store| async move {
                store.set_resource_available(resource_id, available).await
            })
            .await?;
        info!(resource = %resource_id, available, "resource availability set");
        Ok(resource)
    }

    // ── Helpers ──────────────────────────────────────────

    async fn commit_patch(
        &self,
        held: super::HeldLocks,
        id: Ulid,
        patch: AppointmentPatch,
        audit: Audit,
    ) -> Result<Appointment, EngineError> {
        self.commit(held, move |store| async move { store.update_fields(id, patch, Some(audit)).await })
            .await
    }

    /// A registered resource of the other kind is a caller mistake. Unknown ids fall
    /// through to the availability check, which refuses them.
    async fn require_kind(&self, resource_id: Ulid, kind: ResourceKind) -> Result<(), EngineError> {
        match self.store.get_resource(resource_id).await? {
            Some(r) if r.kind != kind => Err(EngineError::Validation(format!(
                "resource {resource_id} is {:?}, expected {kind:?}",
                r.kind
            ))),
            _ => Ok(()),
        }
    }

    async fn is_registered(&self, resource_id: Ulid, kind: ResourceKind) -> Result<bool, EngineError> {
        Ok(matches!(
            self.store.get_resource(resource_id).await?,
            Some(r) if r.kind == kind
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_rescheduled_accept_the_same_actions() {
        assert_eq!(
            allowed_actions(AppointmentStatus::Pending),
            allowed_actions(AppointmentStatus::Rescheduled)
        );
    }

    #[test]
    fn confirmed_cannot_be_confirmed_or_denied_again() {
        for action in [Action::Confirm, Action::Deny] {
            let err = guard_transition(AppointmentStatus::Confirmed, action).unwrap_err();
            match err {
                EngineError::InvalidTransition { from, allowed, .. } => {
                    assert_eq!(from, AppointmentStatus::Confirmed);
                    assert!(allowed.contains(&Action::Cancel));
                }
                other => panic!("expected invalid transition, got {other:?}"),
            }
        }
    }

    #[test]
    fn closed_statuses_only_allow_delete() {
        for status in [
            AppointmentStatus::Denied,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Dispatched,
        ] {
            assert_eq!(allowed_actions(status), vec![Action::Delete], "{status}");
            assert!(guard_transition(status, Action::Delete).is_ok());
            assert!(guard_transition(status, Action::Reschedule).is_err());
        }
    }

    #[test]
    fn only_provider_role_claims() {
        let id = Ulid::new();
        assert_eq!(claimant(&Actor::provider(id)), Some(id));
        assert_eq!(claimant(&Actor::admin(id)), None);
        assert_eq!(claimant(&Actor::requester(id)), None);
    }
}
