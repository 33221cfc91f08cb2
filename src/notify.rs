use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{format_timestamp, Appointment, AppointmentStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Outcome message sent to a requester after a provider decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub status: AppointmentStatus,
    pub appointment: Appointment,
    /// Display name of the provider who acted.
    pub actor_name: String,
}

impl Notice {
    pub fn message(&self) -> String {
        let service = self.appointment.service.as_deref().unwrap_or("appointment");
        let when = format_timestamp(self.appointment.start_time);
        match self.status {
            AppointmentStatus::Confirmed => {
                format!("Your {service} on {when} was confirmed by {}", self.actor_name)
            }
            AppointmentStatus::Denied => {
                format!("Your {service} on {when} was declined by {}", self.actor_name)
            }
            other => format!("Your {service} on {when} is now {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Where committed outcomes are announced. Delivery is best-effort: the scheduler
/// logs failures and never rolls a transition back because of one.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, target_user: Ulid, notice: Notice) -> Result<(), NotifyError>;
}

/// Per-user broadcast channels for real-time push.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to a user's notices. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, user_id: Ulid, notice: &Notice) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a user's channel once every subscriber is gone.
    pub fn prune(&self, user_id: &Ulid) {
        self.channels.remove_if(user_id, |_, tx| tx.receiver_count() == 0);
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn notify(&self, target_user: Ulid, notice: Notice) -> Result<(), NotifyError> {
        self.send(target_user, &notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(status: AppointmentStatus) -> Notice {
        Notice {
            status,
            appointment: Appointment {
                id: Ulid::new(),
                requester_id: Ulid::new(),
                provider_id: None,
                support_id: None,
                service: Some("Checkup".into()),
                notes: None,
                location: None,
                start_time: 1_704_877_200_000, // 2024-01-10T09:00:00Z
                duration_min: 30,
                status,
                created_at: 0,
                updated_at: 0,
            },
            actor_name: "Dr. Ada".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let n = notice(AppointmentStatus::Confirmed);
        hub.notify(user, n.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.notify(Ulid::new(), notice(AppointmentStatus::Denied)).await.unwrap();
    }

    #[tokio::test]
    async fn other_users_do_not_receive() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_b = hub.subscribe(b);
        hub.send(a, &notice(AppointmentStatus::Confirmed));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn prune_keeps_live_channels() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let rx = hub.subscribe(user);
        hub.prune(&user);
        assert!(hub.channels.contains_key(&user));
        drop(rx);
        hub.prune(&user);
        assert!(!hub.channels.contains_key(&user));
    }

    #[test]
    fn message_mentions_outcome_date_and_provider() {
        let msg = notice(AppointmentStatus::Confirmed).message();
        assert_eq!(msg, "Your Checkup on 2024-01-10T09:00:00Z was confirmed by Dr. Ada");
        assert!(notice(AppointmentStatus::Denied).message().contains("declined"));
    }
}
