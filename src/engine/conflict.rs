use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_duration(duration_min: i64) -> Result<(), EngineError> {
    if duration_min <= 0 {
        return Err(EngineError::validation("duration must be a positive number of minutes"));
    }
    if duration_min > MAX_DURATION_MINUTES {
        return Err(EngineError::validation("duration too long"));
    }
    Ok(())
}

fn validate_start(start_time: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start_time) {
        return Err(EngineError::validation("start time out of range"));
    }
    Ok(())
}

/// Start must be in range and duration positive and bounded.
pub(crate) fn validate_schedule(start_time: Ms, duration_min: i64) -> Result<(), EngineError> {
    validate_duration(duration_min)?;
    validate_start(start_time)
}

fn validate_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::Validation(format!("{what} too long"))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_new(record: &NewAppointment) -> Result<(), EngineError> {
    validate_schedule(record.start_time, record.duration_min)?;
    validate_text(record.service.as_deref(), MAX_LABEL_LEN, "service")?;
    validate_text(record.location.as_deref(), MAX_LABEL_LEN, "location")?;
    validate_text(record.notes.as_deref(), MAX_NOTES_LEN, "notes")
}

pub(crate) fn validate_patch(patch: &AppointmentPatch) -> Result<(), EngineError> {
    if let Some(d) = patch.duration_min {
        validate_duration(d)?;
    }
    if let Some(t) = patch.start_time {
        validate_start(t)?;
    }
    validate_text(patch.service.as_deref(), MAX_LABEL_LEN, "service")?;
    validate_text(patch.location.as_deref(), MAX_LABEL_LEN, "location")?;
    validate_text(patch.notes.as_deref(), MAX_NOTES_LEN, "notes")
}

pub fn parse_time(s: &str) -> Result<Ms, EngineError> {
    parse_timestamp(s).ok_or_else(|| EngineError::Validation(format!("unparseable timestamp: {s:?}")))
}
