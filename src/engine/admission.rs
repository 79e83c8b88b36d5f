use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_details, validate_window};
use super::{Engine, EngineError};

/// A request to reserve a room for `[start, end)`.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: String,
    pub participants: Vec<Ulid>,
}

/// Claims a booking id in the index until the booking is stored.
/// Dropping it without `keep` releases the id again.
struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    kept: bool,
}

impl<'a> IdClaim<'a> {
    fn take(index: &'a DashMap<Ulid, Ulid>, id: Ulid, room_id: Ulid) -> Result<Self, EngineError> {
        match index.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(room_id);
            }
        }
        Ok(Self {
            index,
            id,
            kept: false,
        })
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.index.remove(&self.id);
        }
    }
}

impl Engine {
    /// Admit a booking if the room is free for the whole window.
    ///
    /// The overlap check and the insert happen under the room's write lock,
    /// so two concurrent requests for intersecting windows cannot both win.
    pub async fn request_booking(
        &self,
        req: BookingRequest,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let room_id = req.room_id;
        let result = self.admit(req, now).await;
        match &result {
            Ok(b) => {
                metrics::counter!(
                    crate::observability::BOOKINGS_ADMITTED_TOTAL,
                    "status" => b.status.as_str()
                )
                .increment(1);
                info!("booking {} admitted on room {room_id} {}", b.id, b.span);
            }
            Err(e) => {
                metrics::counter!(
                    crate::observability::BOOKINGS_REJECTED_TOTAL,
                    "reason" => e.kind()
                )
                .increment(1);
                debug!("booking request on room {room_id} rejected: {e}");
            }
        }
        result
    }

    async fn admit(&self, req: BookingRequest, now: Ms) -> Result<Booking, EngineError> {
        let policy = &self.options.policy;
        let span = validate_window(req.start, req.end, now, policy)?;
        validate_details(&req.purpose, &req.participants)?;

        if !self.users.contains_key(&req.user_id) {
            return Err(EngineError::NotFound(req.user_id));
        }
        // Held across the lock wait so a concurrent request with the same id fails here.
        let claim = IdClaim::take(&self.booking_index, req.id, req.room_id)?;
        let rs = self
            .get_room_state(&req.room_id)
            .ok_or(EngineError::RoomNotFound(req.room_id))?;
        if rs.read().await.status() == RoomStatus::Maintenance {
            return Err(EngineError::RoomUnavailable(req.room_id));
        }
        // Scans other rooms, so it runs before this room's lock is taken.
        if policy.prevent_user_overlap
            && let Some(b) = self
                .check_user_overlap(req.user_id, span.start, span.end)
                .await?
                .into_iter()
                .next()
        {
            return Err(EngineError::UserOverlap {
                booking_id: b.id,
                span: b.span,
            });
        }

        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(req.room_id));
        }
        if guard.status() == RoomStatus::Maintenance {
            return Err(EngineError::RoomUnavailable(req.room_id));
        }
        // The owner may have been deleted while we waited for the lock.
        if !self.users.contains_key(&req.user_id) {
            return Err(EngineError::NotFound(req.user_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        check_no_conflict(&guard, &span, None)?;

        let event = Event::BookingCreated {
            id: req.id,
            room_id: req.room_id,
            user_id: req.user_id,
            span,
            purpose: req.purpose,
            participants: req.participants,
            status: policy.initial_status(),
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.keep();

        let booking = guard
            .booking(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))?;
        if booking.occupies(now) {
            self.reconcile_locked(&mut guard, now);
        }
        Ok(booking)
    }
}
