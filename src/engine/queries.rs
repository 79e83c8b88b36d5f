use ulid::Ulid;

use crate::model::*;

use super::availability::free_slots;
use super::conflict::validate_query_window;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_room(&self, id: &Ulid) -> Result<Room, EngineError> {
        let rs = self
            .get_room_state(id)
            .ok_or(EngineError::RoomNotFound(*id))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    /// Every live room, ordered by name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_states(false) {
            let guard = rs.read().await;
            if !guard.retired {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Rooms with no pending or confirmed booking overlapping `[start, end)`,
    /// excluding rooms under maintenance. Ordered by name.
    pub async fn find_available_rooms(&self, start: Ms, end: Ms) -> Result<Vec<Room>, EngineError> {
        let window = validate_query_window(start, end)?;
        let mut free = Vec::new();
        for rs in self.room_states(false) {
            let guard = rs.read().await;
            if guard.retired || guard.status() == RoomStatus::Maintenance {
                continue;
            }
            if guard.overlapping(&window).any(|b| b.is_active()) {
                continue;
            }
            free.push(guard.room.clone());
        }
        free.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(free)
    }

    /// The room, the confirmed booking covering `now`, and the next few
    /// confirmed bookings that start after `now`.
    pub async fn get_room_status(&self, room_id: Ulid, now: Ms) -> Result<RoomStatusReport, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        let current_booking = guard.current_booking(now).cloned();
        let first_upcoming = guard.bookings.partition_point(|b| b.span.start <= now);
        let upcoming_bookings = guard.bookings[first_upcoming..]
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .take(self.options.policy.upcoming_limit)
            .cloned()
            .collect();
        Ok(RoomStatusReport {
            room: guard.room.clone(),
            current_booking,
            upcoming_bookings,
        })
    }

    /// Pending or confirmed bookings of `user_id`, in any room, overlapping
    /// `[start, end)`. Ordered by start.
    pub async fn check_user_overlap(
        &self,
        user_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let window = Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
        let mut found = Vec::new();
        for rs in self.room_states(false) {
            let guard = rs.read().await;
            found.extend(
                guard
                    .overlapping(&window)
                    .filter(|b| b.is_active() && b.user_id == user_id)
                    .cloned(),
            );
        }
        found.sort_by_key(|b| (b.span.start, b.id));
        Ok(found)
    }

    /// Owner or administrator only.
    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let rs = self.resolve_booking(&id)?;
        let guard = rs.read().await;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !actor.is_admin() && actor.id != booking.user_id {
            return Err(EngineError::Forbidden("only the owner or an administrator may view this booking"));
        }
        Ok(booking)
    }

    /// Every booking of a user, cancelled ones and deleted rooms included.
    /// Users may list only their own bookings.
    pub async fn list_user_bookings(
        &self,
        actor: &Actor,
        user_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        if !actor.is_admin() && actor.id != user_id {
            return Err(EngineError::Forbidden("users may only list their own bookings"));
        }
        Ok(self.collect_bookings(|b| b.user_id == user_id).await)
    }

    /// Every booking in the system. Admin only.
    pub async fn list_bookings(&self, actor: &Actor) -> Result<Vec<Booking>, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only an administrator may list all bookings"));
        }
        Ok(self.collect_bookings(|_| true).await)
    }

    async fn collect_bookings(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut found = Vec::new();
        for rs in self.room_states(true) {
            let guard = rs.read().await;
            found.extend(guard.bookings.iter().filter(|b| pred(b)).cloned());
        }
        found.sort_by_key(|b| (b.span.start, b.id));
        found
    }

    /// Pending and confirmed bookings of a room inside a window, plus the gaps.
    pub async fn room_schedule(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<RoomSchedule, EngineError> {
        let window = validate_query_window(start, end)?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        let booked: Vec<Booking> = guard
            .overlapping(&window)
            .filter(|b| b.is_active())
            .cloned()
            .collect();
        let free = free_slots(window, booked.iter().map(|b| b.span));
        Ok(RoomSchedule {
            room_id,
            window,
            booked,
            free,
        })
    }
}
