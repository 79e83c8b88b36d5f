use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::model::now_ms;

/// Periodically re-derive every room's status from its bookings, so rooms
/// flip to booked when a booking starts and back when it ends even if no
/// request touches them. The first pass runs immediately, which settles
/// state restored from the WAL.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = engine.sweep(now_ms()).await;
        if report.changed > 0 || report.failed > 0 {
            info!(
                "sweep: {} rooms checked, {} changed, {} failed",
                report.checked, report.changed, report.failed
            );
        } else {
            debug!("sweep: {} rooms checked, no changes", report.checked);
        }
    }
}

/// Rewrite the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::engine::{BookingRequest, NewRoom};
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_room(path: PathBuf) -> (Arc<Engine>, Actor, Ulid, Ulid) {
        let engine = Arc::new(Engine::new(path, EngineOptions::default()).unwrap());
        let admin = Actor::admin(Ulid::new());
        engine.register_user(admin.id, "root", Role::Admin).await.unwrap();
        let user = Ulid::new();
        engine.register_user(user, "ann", Role::User).await.unwrap();
        let room_id = Ulid::new();
        engine
            .create_room(
                &admin,
                NewRoom {
                    id: room_id,
                    name: "Juniper".into(),
                    capacity: 4,
                    location: None,
                    amenities: vec![],
                },
            )
            .await
            .unwrap();
        (engine, admin, user, room_id)
    }

    #[tokio::test]
    async fn sweeper_marks_room_booked_when_booking_starts() {
        let (engine, _admin, user, room_id) =
            engine_with_room(test_wal_path("sweeper_booked.wal")).await;

        let start = now_ms() + 50;
        engine
            .request_booking(
                BookingRequest {
                    id: Ulid::new(),
                    room_id,
                    user_id: user,
                    start,
                    end: start + 3_600_000,
                    purpose: "standup".into(),
                    participants: vec![],
                },
                now_ms(),
            )
            .await
            .unwrap();
        assert_eq!(engine.get_room(&room_id).await.unwrap().status, RoomStatus::Available);

        let handle = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        assert_eq!(engine.get_room(&room_id).await.unwrap().status, RoomStatus::Booked);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let path = test_wal_path("compactor_threshold.wal");
        let (engine, admin, _user, room_id) = engine_with_room(path.clone()).await;
        for on in [true, false, true, false] {
            engine.set_maintenance(&admin, room_id, on, now_ms()).await.unwrap();
        }
        assert!(engine.wal_appends_since_compact().await >= 7);

        let handle = tokio::spawn(run_compactor(engine.clone(), 5, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::new(path, EngineOptions::default()).unwrap();
        let room = reopened.get_room(&room_id).await.unwrap();
        assert_eq!(room.name, "Juniper");
        assert_eq!(room.status, RoomStatus::Available);
        assert_eq!(reopened.list_users().len(), 2);
    }
}
