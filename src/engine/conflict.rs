use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Window checks shared by admission and rescheduling, in rejection order:
/// shape, past start, duration, then timestamp range.
pub(crate) fn validate_window(
    start: Ms,
    end: Ms,
    now: Ms,
    policy: &BookingPolicy,
) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
    if span.start < now {
        return Err(EngineError::PastBooking { start, now });
    }
    if span.duration_ms() > policy.max_duration_ms {
        return Err(EngineError::DurationExceeded {
            duration: span.duration_ms(),
            max: policy.max_duration_ms,
        });
    }
    validate_range(&span)?;
    Ok(span)
}

/// Read queries accept past windows but still bound their width.
pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
    validate_range(&span)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

fn validate_range(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_details(purpose: &str, participants: &[Ulid]) -> Result<(), EngineError> {
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    if participants.len() > MAX_PARTICIPANTS {
        return Err(EngineError::LimitExceeded("too many participants"));
    }
    Ok(())
}

/// First pending or confirmed booking overlapping `span`, skipping `exclude`.
pub(crate) fn find_conflict<'a>(
    rs: &'a RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    rs.overlapping(span)
        .find(|b| b.is_active() && Some(b.id) != exclude)
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(b) => Err(EngineError::SlotConflict {
            booking_id: b.id,
            span: b.span,
        }),
        None => Ok(()),
    }
}
