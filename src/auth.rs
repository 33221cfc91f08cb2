use crate::model::{Action, Actor, Appointment, Role};

/// Role/ownership predicate consulted before any scheduler guard runs.
pub trait AuthorizationGate: Send + Sync {
    fn can_act(&self, actor: &Actor, appointment: &Appointment, action: Action) -> bool;
}

/// Default policy.
///
/// - Admins pass every check.
/// - Provider actions need the provider to be the one assigned. Confirm and deny may
///   claim an unassigned appointment, but never one bound to a different provider.
/// - Requester actions need ownership.
/// - Reads are open to the owner and to whoever is assigned as provider or support.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleGate;

impl AuthorizationGate for RoleGate {
    fn can_act(&self, actor: &Actor, appointment: &Appointment, action: Action) -> bool {
        if actor.is_admin() {
            return true;
        }
        match action {
            Action::Confirm | Action::Deny => {
                actor.role == Role::Provider
                    && appointment.provider_id.is_none_or(|p| p == actor.id)
            }
            Action::AssignSupport => {
                actor.role == Role::Provider && appointment.provider_id == Some(actor.id)
            }
            Action::Create | Action::Cancel | Action::Reschedule | Action::Delete => {
                appointment.requester_id == actor.id
            }
            Action::Read => {
                appointment.requester_id == actor.id || appointment.is_assigned_to(actor.id)
            }
            Action::SetAvailability | Action::RegisterResource => false,
        }
    }
}
