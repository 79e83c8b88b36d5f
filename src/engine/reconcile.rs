use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Status a room should show at `now`. Maintenance is sticky; otherwise a
/// confirmed booking covering `now` makes the room booked.
pub fn derive_status(rs: &RoomState, now: Ms) -> RoomStatus {
    if rs.status() == RoomStatus::Maintenance {
        RoomStatus::Maintenance
    } else if rs.current_booking(now).is_some() {
        RoomStatus::Booked
    } else {
        RoomStatus::Available
    }
}

/// Bring the stored status in line with the bookings. Returns the new status
/// if it changed. Running it twice at the same `now` changes nothing.
pub fn reconcile_state(rs: &mut RoomState, now: Ms) -> Option<RoomStatus> {
    if rs.retired {
        return None;
    }
    let derived = derive_status(rs, now);
    if derived == rs.status() {
        return None;
    }
    rs.room.status = derived;
    Some(derived)
}

/// Outcome of one pass over every room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

impl Engine {
    /// Reconcile with the room's write lock already held.
    pub(super) fn reconcile_locked(&self, rs: &mut RoomState, now: Ms) -> Option<RoomStatus> {
        let changed = reconcile_state(rs, now)?;
        metrics::counter!(
            crate::observability::ROOM_STATUS_CHANGES_TOTAL,
            "status" => changed.as_str()
        )
        .increment(1);
        info!("room {} is now {}", rs.id(), changed.as_str());
        Some(changed)
    }

    /// Re-derive one room's status from its bookings. Returns the status after
    /// reconciliation.
    pub async fn reconcile(&self, room_id: Ulid, now: Ms) -> Result<RoomStatus, EngineError> {
        self.reconcile_tracked(room_id, now).await.map(|(status, _)| status)
    }

    async fn reconcile_tracked(
        &self,
        room_id: Ulid,
        now: Ms,
    ) -> Result<(RoomStatus, Option<RoomStatus>), EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let changed = self.reconcile_locked(&mut guard, now);
        Ok((guard.status(), changed))
    }

    /// Reconcile every room. A room that fails is counted and skipped.
    pub async fn sweep(&self, now: Ms) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for room_id in self.sorted_room_ids() {
            match self.reconcile_tracked(room_id, now).await {
                Ok((_, changed)) => {
                    report.checked += 1;
                    if changed.is_some() {
                        report.changed += 1;
                    }
                }
                // Deleted after the id list was taken.
                Err(EngineError::RoomNotFound(_)) => {}
                Err(e) => {
                    report.checked += 1;
                    report.failed += 1;
                    metrics::counter!(crate::observability::SWEEP_FAILURES_TOTAL).increment(1);
                    warn!("sweep: reconciling room {room_id} failed: {e}");
                }
            }
        }

        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(
            "sweep checked {} rooms, changed {}, failed {}",
            report.checked, report.changed, report.failed
        );
        report
    }

    /// Put a room into maintenance or take it out. Admin only.
    pub async fn set_maintenance(
        &self,
        actor: &Actor,
        room_id: Ulid,
        maintenance: bool,
        now: Ms,
    ) -> Result<Room, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only an administrator may change room status"));
        }
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(room_id));
        }

        let in_maintenance = guard.status() == RoomStatus::Maintenance;
        if in_maintenance != maintenance {
            let event = Event::RoomMaintenanceSet {
                id: room_id,
                maintenance,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!(
                "room {room_id} {} maintenance",
                if maintenance { "entered" } else { "left" }
            );
        }
        if !maintenance {
            self.reconcile_locked(&mut guard, now);
        }
        Ok(guard.room.clone())
    }
}
