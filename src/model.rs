use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds UTC — the only instant type.
pub type Ms = i64;

/// Integer cents — the only money type.
pub type Cents = i64;

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

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Client,
    Employee,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "CLIENT" => Some(Role::Client),
            "EMPLOYEE" => Some(Role::Employee),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Client => "CLIENT",
            Role::Employee => "EMPLOYEE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn parse(s: &str) -> Option<BookingStatus> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(BookingStatus::Pending),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "COMPLETED" => Some(BookingStatus::Completed),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// The full transition graph. Forward: PENDING → CONFIRMED → COMPLETED.
    /// Cancellation: PENDING/CONFIRMED → CANCELLED. Terminal states have no exits.
    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

/// Weekday index per the schedule table convention: 0 = Sunday … 6 = Saturday.
pub fn weekday_name(day: u8) -> &'static str {
    match day {
        0 => "Sunday",
        1 => "Monday",
        2 => "Tuesday",
        3 => "Wednesday",
        4 => "Thursday",
        5 => "Friday",
        6 => "Saturday",
        _ => "?",
    }
}

/// One open window of a business's weekly schedule. Wall-clock local times,
/// `from < to`, whole-minute precision on the wire ("HH:MM").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub id: Ulid,
    pub weekday: u8,
    pub from: NaiveTime,
    pub to: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct Business {
    pub id: Ulid,
    pub owner_id: Option<Ulid>,
    pub name: String,
    /// The documented default zone for bookings that don't carry their own.
    pub timezone: Tz,
    /// Weekly windows, in creation order. Non-overlap per weekday is enforced
    /// at mutation time.
    pub windows: Vec<ScheduleWindow>,
}

#[derive(Debug, Clone)]
pub struct Service {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_min: i64,
    pub price: Cents,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    /// Set iff role is EMPLOYEE.
    pub business_id: Option<Ulid>,
}

/// The central entity. `span.end` is always recomputed from the service
/// duration; `price` is a snapshot taken at creation and never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Option<Ulid>,
    pub service_id: Ulid,
    pub business_id: Ulid,
    pub employee_id: Ulid,
    pub span: Span,
    pub timezone: Tz,
    pub price: Cents,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// Who is asking. Resolved from the session by the wire layer, or built
/// directly by embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

/// Everything a booking creation needs. `start` is the UTC instant; the end is
/// never accepted from the caller. A missing `timezone` falls back to the
/// business's configured zone; a missing `price` snapshots the service price.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub service_id: Ulid,
    pub business_id: Ulid,
    pub start: Ms,
    pub employee_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub timezone: Option<String>,
    pub price: Option<Cents>,
}

/// Admin listing filter. All fields optional; absent means "don't filter".
#[derive(Debug, Clone, Copy, Default)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub client_id: Option<Ulid>,
    pub business_id: Option<Ulid>,
}

/// One occupied slot on an employee's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub booking_id: Ulid,
    pub span: Span,
}

/// An employee's active (non-cancelled) bookings, sorted by `span.start`.
/// Cancellation removes the slot — a cancelled booking frees the time.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    pub slots: Vec<Slot>,
}

impl Calendar {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<Slot> {
        if let Some(pos) = self.slots.iter().position(|s| s.booking_id == booking_id) {
            Some(self.slots.remove(pos))
        } else {
            None
        }
    }

    /// Slots whose span overlaps the query window. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// First booking colliding with `query`, skipping `exclude` (a booking
    /// being rescheduled does not conflict with itself).
    pub fn conflict(&self, query: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
        self.overlapping(query)
            .find(|s| exclude != Some(s.booking_id))
            .map(|s| s.booking_id)
    }

    pub fn is_free(&self, query: &Span, exclude: Option<Ulid>) -> bool {
        self.conflict(query, exclude).is_none()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessCreated {
        id: Ulid,
        owner_id: Option<Ulid>,
        name: String,
        timezone: Tz,
    },
    ServiceCreated {
        id: Ulid,
        business_id: Ulid,
        name: String,
        duration_min: i64,
        price: Cents,
    },
    ServiceDeleted {
        id: Ulid,
        business_id: Ulid,
    },
    ScheduleAdded {
        id: Ulid,
        business_id: Ulid,
        weekday: u8,
        from: NaiveTime,
        to: NaiveTime,
    },
    ScheduleUpdated {
        id: Ulid,
        business_id: Ulid,
        from: NaiveTime,
        to: NaiveTime,
    },
    ScheduleRemoved {
        id: Ulid,
        business_id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        role: Role,
        business_id: Option<Ulid>,
    },
    BookingCreated {
        id: Ulid,
        client_id: Option<Ulid>,
        service_id: Ulid,
        business_id: Ulid,
        employee_id: Ulid,
        span: Span,
        timezone: Tz,
        price: Cents,
        created_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        business_id: Ulid,
        employee_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        business_id: Ulid,
        old_employee_id: Ulid,
        employee_id: Ulid,
        span: Span,
    },
}

impl Event {
    /// Business channel an event is published on, if any. Catalog events are
    /// not broadcast; booking events go to the owning business's channel.
    pub fn notify_business(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { business_id, .. }
            | Event::BookingStatusChanged { business_id, .. }
            | Event::BookingRescheduled { business_id, .. } => Some(*business_id),
            _ => None,
        }
    }
}
