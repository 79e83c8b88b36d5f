use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_conflict, validate_details, validate_window};
use super::{Engine, EngineError};

/// What a requested status change does to a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    /// Status unchanged; the window may still move.
    Keep,
    Confirm,
    Cancel,
}

fn plan(from: BookingStatus, to: BookingStatus) -> Result<Edge, EngineError> {
    use BookingStatus::*;
    match (from, to) {
        (Cancelled, Cancelled) => Ok(Edge::Keep),
        (Cancelled, _) | (Confirmed, Pending) => Err(EngineError::InvalidTransition { from, to }),
        (Pending, Confirmed) => Ok(Edge::Confirm),
        (Pending | Confirmed, Cancelled) => Ok(Edge::Cancel),
        (Pending, Pending) | (Confirmed, Confirmed) => Ok(Edge::Keep),
    }
}

fn authorize_owner(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.is_admin() || actor.id == booking.user_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the owner or an administrator may change this booking"))
    }
}

/// Changes to an existing booking. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChange {
    pub status: Option<BookingStatus>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub purpose: Option<String>,
    pub participants: Option<Vec<Ulid>>,
}

impl BookingChange {
    fn edits_details(&self) -> bool {
        self.purpose.is_some() || self.participants.is_some()
    }

    fn window(&self, current: Span) -> Option<(Ms, Ms)> {
        (self.start.is_some() || self.end.is_some()).then(|| {
            (
                self.start.unwrap_or(current.start),
                self.end.unwrap_or(current.end),
            )
        })
    }
}

impl Engine {
    /// Move a booking to `new_status`, optionally rescheduling it.
    ///
    /// Cancelling ignores any window. Cancelling an already cancelled booking
    /// succeeds without writing anything.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        new_status: BookingStatus,
        new_window: Option<(Ms, Ms)>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let change = BookingChange {
            status: Some(new_status),
            start: new_window.map(|(start, _)| start),
            end: new_window.map(|(_, end)| end),
            ..BookingChange::default()
        };
        self.update_booking(booking_id, actor, change, now).await
    }

    /// Apply status, window and details changes as one write.
    ///
    /// Everything is resolved against the booking as it stands under the room
    /// lock; an absent status keeps the current one. Either every change is
    /// persisted in a single event or none is.
    pub async fn update_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        change: BookingChange,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let rs = self.resolve_booking(&booking_id)?;
        let mut guard = rs.write().await;
        let current = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        authorize_owner(actor, &current)?;
        let new_status = change.status.unwrap_or(current.status);
        let edge = plan(current.status, new_status)?;
        if current.status == BookingStatus::Cancelled {
            if change.edits_details() {
                return Err(EngineError::InvalidInput("cancelled bookings cannot be edited"));
            }
            return Ok(current);
        }
        if edge == Edge::Confirm && !actor.is_admin() {
            return Err(EngineError::Forbidden("only an administrator may confirm a booking"));
        }

        let span = match (edge, change.window(current.span)) {
            (Edge::Cancel, _) | (_, None) => current.span,
            (_, Some((start, end))) => {
                let span = validate_window(start, end, now, &self.options.policy)?;
                check_no_conflict(&guard, &span, Some(booking_id))?;
                span
            }
        };
        let edits_details = change.edits_details();
        let purpose = change.purpose.unwrap_or_else(|| current.purpose.clone());
        let participants = change
            .participants
            .unwrap_or_else(|| current.participants.clone());
        if edits_details {
            validate_details(&purpose, &participants)?;
        }

        let transitioned = span != current.span || new_status != current.status;
        let details_changed = purpose != current.purpose || participants != current.participants;
        let event = match (transitioned, details_changed) {
            (false, false) => return Ok(current),
            (true, false) => Event::BookingTransitioned {
                id: booking_id,
                room_id: current.room_id,
                status: new_status,
                span,
            },
            (false, true) => Event::BookingDetailsUpdated {
                id: booking_id,
                room_id: current.room_id,
                purpose,
                participants,
            },
            (true, true) => Event::BookingRevised {
                id: booking_id,
                room_id: current.room_id,
                status: new_status,
                span,
                purpose,
                participants,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if transitioned {
            if current.occupies(now) || updated.occupies(now) {
                self.reconcile_locked(&mut guard, now);
            }
            metrics::counter!(
                crate::observability::BOOKING_TRANSITIONS_TOTAL,
                "to" => new_status.as_str()
            )
            .increment(1);
            info!(
                "booking {booking_id}: {} {} -> {} {}",
                current.status, current.span, updated.status, updated.span
            );
        }
        Ok(updated)
    }

    /// Shorthand for a transition to `cancelled`.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.transition(booking_id, actor, BookingStatus::Cancelled, None, now)
            .await
    }

    /// Replace a live booking's purpose and/or participants.
    pub async fn update_booking_details(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        purpose: Option<String>,
        participants: Option<Vec<Ulid>>,
    ) -> Result<Booking, EngineError> {
        let rs = self.resolve_booking(&booking_id)?;
        let mut guard = rs.write().await;
        let current = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        authorize_owner(actor, &current)?;
        if !current.is_active() {
            return Err(EngineError::InvalidInput("cancelled bookings cannot be edited"));
        }

        let purpose = purpose.unwrap_or(current.purpose);
        let participants = participants.unwrap_or(current.participants);
        validate_details(&purpose, &participants)?;

        let event = Event::BookingDetailsUpdated {
            id: booking_id,
            room_id: current.room_id,
            purpose,
            participants,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }
}
