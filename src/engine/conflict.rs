use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Turn caller-supplied bounds into a span: ordering first, then service limits.
pub(crate) fn validate_request(req: &BookingRequest) -> Result<Span, EngineError> {
    let span = req.span().ok_or(EngineError::InvalidInterval {
        start: req.start,
        end: req.end,
    })?;
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First committed reservation in `rs` that collides with `span`, ignoring
/// `exclude` (the reservation being updated).
pub(crate) fn find_conflict(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.candidates(span)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.span.conflicts_with(span))
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                room_id = %rs.id,
                %existing,
                start = span.start,
                end = span.end,
                "booking rejected: scheduling conflict"
            );
            Err(EngineError::SchedulingConflict(existing))
        }
        None => Ok(()),
    }
}
