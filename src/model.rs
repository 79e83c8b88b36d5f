use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Wall-clock now. Only host layers (wire, sweeper) read the clock; the
/// engine always receives `now` as an argument.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open overlap: `[a_start, a_end)` and `[b_start, b_end)` intersect.
/// Touching intervals (`a_end == b_start`) do not overlap.
#[inline]
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Authenticated caller, supplied by whoever sits in front of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn user(id: Ulid) -> Self {
        Self { id, role: Role::User }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Available,
    Booked,
    Maintenance,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Booked => "booked",
            RoomStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Some(RoomStatus::Available),
            "booked" => Some(RoomStatus::Booked),
            "maintenance" => Some(RoomStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub amenities: BTreeSet<String>,
    pub status: RoomStatus,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub purpose: String,
    pub participants: Vec<Ulid>,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    /// Counts against the room's timeline (pending or confirmed).
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Confirmed and covering `now`: the room is in use.
    pub fn occupies(&self, now: Ms) -> bool {
        self.status == BookingStatus::Confirmed && self.span.contains_instant(now)
    }
}

/// A room and every booking ever made for it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Vec<Booking>,
    /// Set once the room is deleted; its bookings stay as cancelled history.
    pub retired: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
            retired: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.room.id
    }

    pub fn status(&self) -> RoomStatus {
        self.room.status
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Remove and re-insert a booking after its window moved.
    pub fn move_booking(&mut self, id: &Ulid, span: Span) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == *id) {
            let mut booking = self.bookings.remove(pos);
            booking.span = span;
            self.insert_booking(booking);
        }
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let query = *query;
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.overlaps(&query))
    }

    /// The confirmed booking covering `now`, if any.
    pub fn current_booking(&self, now: Ms) -> Option<&Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start <= now);
        self.bookings[..right_bound].iter().find(|b| b.occupies(now))
    }

    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_active()).count()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        role: Role,
    },
    /// Implies cancelling every active booking owned by the user.
    UserDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        amenities: Vec<String>,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        amenities: Vec<String>,
    },
    RoomMaintenanceSet {
        id: Ulid,
        maintenance: bool,
    },
    /// Implies cancelling every active booking of the room.
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        room_id: Ulid,
        user_id: Ulid,
        span: Span,
        purpose: String,
        participants: Vec<Ulid>,
        status: BookingStatus,
        created_at: Ms,
    },
    BookingTransitioned {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        span: Span,
    },
    BookingDetailsUpdated {
        id: Ulid,
        room_id: Ulid,
        purpose: String,
        participants: Vec<Ulid>,
    },
    /// Status or window change together with a details edit.
    BookingRevised {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        span: Span,
        purpose: String,
        participants: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStatusReport {
    pub room: Room,
    pub current_booking: Option<Booking>,
    pub upcoming_bookings: Vec<Booking>,
}

/// Booked and free parts of one room inside a query window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSchedule {
    pub room_id: Ulid,
    pub window: Span,
    pub booked: Vec<Booking>,
    pub free: Vec<Span>,
}
