//! JSON-lines command driver: one tagged request per line in, one reply per line out.
//!
//! ```text
//! {"op":"create","actor":{"id":"…","role":"requester"},"appointment":{"requester_id":"…","start_time":"2024-01-10T09:00Z","duration_min":30}}
//! {"ok":{"id":"…","status":"PENDING",…}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

use crate::engine::{parse_time, Engine, EngineError};
use crate::model::*;

/// Appointment fields as they arrive on the wire, with a textual start time.
#[derive(Debug, Deserialize)]
pub struct AppointmentInput {
    pub requester_id: Ulid,
    #[serde(default)]
    pub provider_id: Option<Ulid>,
    #[serde(default)]
    pub service: Option<String>,
    pub start_time: String,
    pub duration_min: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl AppointmentInput {
    fn into_record(self) -> Result<NewAppointment, EngineError> {
        Ok(NewAppointment {
            requester_id: self.requester_id,
            provider_id: self.provider_id,
            service: self.service,
            start_time: parse_time(&self.start_time)?,
            duration_min: self.duration_min,
            notes: self.notes,
            location: self.location,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterResource {
        actor: Actor,
        resource: Resource,
    },
    SetAvailability {
        actor: Actor,
        resource_id: Ulid,
        available: bool,
    },
    Create {
        actor: Actor,
        appointment: AppointmentInput,
    },
    Confirm {
        actor: Actor,
        id: Ulid,
        #[serde(default)]
        support_id: Option<Ulid>,
    },
    Deny {
        actor: Actor,
        id: Ulid,
    },
    Cancel {
        actor: Actor,
        id: Ulid,
    },
    Reschedule {
        actor: Actor,
        id: Ulid,
        start_time: String,
        duration_min: i64,
        #[serde(default)]
        service: Option<String>,
    },
    AssignSupport {
        actor: Actor,
        id: Ulid,
        #[serde(default)]
        support_id: Option<Ulid>,
    },
    Delete {
        actor: Actor,
        id: Ulid,
    },
    Get {
        actor: Actor,
        id: Ulid,
    },
    List {
        actor: Actor,
    },
    History {
        actor: Actor,
        id: Ulid,
    },
    Overview {
        actor: Actor,
        resource_id: Ulid,
        #[serde(default)]
        now: Option<String>,
    },
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(format!("encode reply: {e}")))
}

fn error_reply(kind: &str, message: String) -> Value {
    json!({ "error": { "kind": kind, "message": message } })
}

pub async fn execute(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    match request {
        Request::RegisterResource { actor, resource } => {
            let id = resource.id;
            engine.register_resource(&actor, resource).await?;
            to_value(json!({ "id": id }))
        }
        Request::SetAvailability { actor, resource_id, available } => {
            to_value(engine.set_resource_availability(&actor, resource_id, available).await?)
        }
        Request::Create { actor, appointment } => {
            to_value(engine.create(&actor, appointment.into_record()?).await?)
        }
        Request::Confirm { actor, id, support_id } => to_value(engine.confirm(&actor, id, support_id).await?),
        Request::Deny { actor, id } => to_value(engine.deny(&actor, id).await?),
        Request::Cancel { actor, id } => to_value(engine.cancel(&actor, id).await?),
        Request::Reschedule { actor, id, start_time, duration_min, service } => {
            let change = Reschedule { start_time: parse_time(&start_time)?, duration_min, service };
            to_value(engine.reschedule(&actor, id, change).await?)
        }
        Request::AssignSupport { actor, id, support_id } => {
            to_value(engine.assign_support(&actor, id, support_id).await?)
        }
        Request::Delete { actor, id } => to_value(engine.delete(&actor, id).await?),
        Request::Get { actor, id } => to_value(engine.get(&actor, id).await?),
        Request::List { actor } => to_value(engine.list_for_actor(&actor).await?),
        Request::History { actor, id } => to_value(engine.history(&actor, id).await?),
        Request::Overview { actor, resource_id, now } => {
            let now = match now {
                Some(s) => parse_time(&s)?,
                None => crate::engine::now_ms(),
            };
            to_value(engine.resource_overview(&actor, resource_id, now).await?)
        }
    }
}

/// Decode, run and encode one line. Never fails: problems become `{"error":…}`.
pub async fn handle_line(engine: &Engine, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return error_reply("validation", format!("invalid input: {e}")),
    };
    match execute(engine, request).await {
        Ok(value) => json!({ "ok": value }),
        Err(e) => error_reply(e.kind(), e.to_string()),
    }
}
