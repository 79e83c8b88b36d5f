use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{apply_to_room, Engine, EngineError};

/// Fields for a new room.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub amenities: Vec<String>,
}

/// Partial room edit; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    /// `Some(None)` clears the location.
    pub location: Option<Option<String>>,
    pub amenities: Option<Vec<String>>,
}

impl RoomUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.capacity.is_none()
            && self.location.is_none()
            && self.amenities.is_none()
    }
}

fn require_admin(actor: &Actor, what: &'static str) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(what))
    }
}

fn clean_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

/// Validated room fields, amenities deduplicated and sorted.
fn clean_room_fields(
    name: &str,
    capacity: u32,
    location: Option<String>,
    amenities: Vec<String>,
) -> Result<(String, u32, Option<String>, Vec<String>), EngineError> {
    let name = clean_name(name)?;
    if capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be positive"));
    }
    let location = location
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());
    if location.as_ref().is_some_and(|l| l.len() > MAX_LOCATION_LEN) {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    let amenities: BTreeSet<String> = amenities
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    if amenities.len() > MAX_AMENITIES {
        return Err(EngineError::LimitExceeded("too many amenities"));
    }
    if amenities.iter().any(|a| a.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("amenity too long"));
    }
    Ok((name, capacity, location, amenities.into_iter().collect()))
}

impl Engine {
    pub async fn register_user(&self, id: Ulid, name: &str, role: Role) -> Result<User, EngineError> {
        let name = clean_name(name)?;
        let _directory = self.directory.lock().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            role,
        };
        self.wal_append(&event).await?;
        let user = User { id, name, role };
        self.users.insert(id, user.clone());
        info!("registered {} {id}", role.as_str());
        Ok(user)
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Remove a user and cancel every pending or confirmed booking they own.
    /// Returns how many bookings were cancelled.
    pub async fn delete_user(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<usize, EngineError> {
        require_admin(actor, "only an administrator may delete users")?;
        let _directory = self.directory.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        // Every room, in ascending id order, so no admission for this user
        // can land between the cascade and the removal.
        let mut guards = Vec::new();
        for rs in self.room_states(false) {
            guards.push(rs.write_owned().await);
        }

        let event = Event::UserDeleted { id };
        self.wal_append(&event).await?;
        self.users.remove(&id);
        let mut cancelled = 0;
        for guard in guards.iter_mut() {
            let n = apply_to_room(guard, &event, &self.booking_index);
            if n > 0 {
                cancelled += n;
                self.reconcile_locked(guard, now);
            }
        }
        info!("deleted user {id}, cancelled {cancelled} bookings");
        Ok(cancelled)
    }

    pub async fn create_room(&self, actor: &Actor, new: NewRoom) -> Result<Room, EngineError> {
        require_admin(actor, "only an administrator may create rooms")?;
        let (name, capacity, location, amenities) =
            clean_room_fields(&new.name, new.capacity, new.location, new.amenities)?;

        let _directory = self.directory.lock().await;
        if self.rooms.contains_key(&new.id) || self.archived.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if self.room_names.contains_key(&name) {
            return Err(EngineError::NameTaken(name));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let event = Event::RoomCreated {
            id: new.id,
            name: name.clone(),
            capacity,
            location: location.clone(),
            amenities: amenities.clone(),
        };
        self.wal_append(&event).await?;
        let room = Room {
            id: new.id,
            name: name.clone(),
            capacity,
            location,
            amenities: amenities.into_iter().collect(),
            status: RoomStatus::Available,
        };
        self.rooms
            .insert(new.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        self.room_names.insert(name, new.id);
        info!("created room {} ({})", room.id, room.name);
        Ok(room)
    }

    /// Edit room attributes. Status is not an attribute; see `set_maintenance`.
    pub async fn update_room(
        &self,
        actor: &Actor,
        id: Ulid,
        update: RoomUpdate,
    ) -> Result<Room, EngineError> {
        require_admin(actor, "only an administrator may update rooms")?;
        let _directory = self.directory.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::RoomNotFound(id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(id));
        }
        if update.is_empty() {
            return Ok(guard.room.clone());
        }

        let room = &guard.room;
        let (name, capacity, location, amenities) = clean_room_fields(
            update.name.as_deref().unwrap_or(&room.name),
            update.capacity.unwrap_or(room.capacity),
            update.location.unwrap_or_else(|| room.location.clone()),
            update
                .amenities
                .unwrap_or_else(|| room.amenities.iter().cloned().collect()),
        )?;
        let old_name = room.name.clone();
        if name != old_name && self.room_names.contains_key(&name) {
            return Err(EngineError::NameTaken(name));
        }

        let event = Event::RoomUpdated {
            id,
            name: name.clone(),
            capacity,
            location,
            amenities,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if name != old_name {
            self.room_names.remove(&old_name);
            self.room_names.insert(name, id);
        }
        Ok(guard.room.clone())
    }

    /// Delete a room, cancelling its pending and confirmed bookings. The
    /// cancelled bookings stay readable. Returns how many were cancelled.
    pub async fn delete_room(&self, actor: &Actor, id: Ulid) -> Result<usize, EngineError> {
        require_admin(actor, "only an administrator may delete rooms")?;
        let _directory = self.directory.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::RoomNotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::RoomDeleted { id };
        let cancelled = self.persist_and_apply(&mut guard, &event).await?;
        self.room_names.remove(&guard.room.name);
        drop(guard);
        if let Some((_, rs)) = self.rooms.remove(&id) {
            self.archived.insert(id, rs);
        }
        info!("deleted room {id}, cancelled {cancelled} bookings");
        Ok(cancelled)
    }
}
