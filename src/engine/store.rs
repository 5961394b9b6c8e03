use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;

/// All tenant state. Catalog rows live in sharded maps; each employee's
/// active bookings additionally live in a calendar behind its own RwLock —
/// that lock is the serialization point for the write path.
pub struct Store {
    pub businesses: DashMap<Ulid, Business>,
    pub users: DashMap<Ulid, User>,
    pub services: DashMap<Ulid, Service>,
    pub bookings: DashMap<Ulid, Booking>,
    /// Per-business employee ids in registration order. This order is the
    /// first-fit scan order and must survive replay and compaction.
    pub employees: DashMap<Ulid, Vec<Ulid>>,
    /// Per-business service ids in creation order.
    pub business_services: DashMap<Ulid, Vec<Ulid>>,
    /// Schedule window id → owning business id.
    pub window_index: DashMap<Ulid, Ulid>,
    /// Per-employee calendars of non-cancelled bookings.
    pub calendars: DashMap<Ulid, SharedCalendar>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            businesses: DashMap::new(),
            users: DashMap::new(),
            services: DashMap::new(),
            bookings: DashMap::new(),
            employees: DashMap::new(),
            business_services: DashMap::new(),
            window_index: DashMap::new(),
            calendars: DashMap::new(),
        }
    }

    pub fn calendar(&self, employee: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(employee).map(|e| e.value().clone())
    }

    pub fn employees_of(&self, business: &Ulid) -> Vec<Ulid> {
        self.employees
            .get(business)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Apply a catalog event. Booking events are not handled here — they go
    /// through `apply_booking` so the caller controls calendar locking.
    pub fn apply_catalog(&self, event: &Event) {
        match event {
            Event::BusinessCreated {
                id,
                owner_id,
                name,
                timezone,
            } => {
                self.businesses.insert(
                    *id,
                    Business {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                        timezone: *timezone,
                        windows: Vec::new(),
                    },
                );
            }
            Event::ServiceCreated {
                id,
                business_id,
                name,
                duration_min,
                price,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        business_id: *business_id,
                        name: name.clone(),
                        duration_min: *duration_min,
                        price: *price,
                    },
                );
                self.business_services.entry(*business_id).or_default().push(*id);
            }
            Event::ServiceDeleted { id, business_id } => {
                self.services.remove(id);
                if let Some(mut ids) = self.business_services.get_mut(business_id) {
                    ids.retain(|s| s != id);
                }
            }
            Event::ScheduleAdded {
                id,
                business_id,
                weekday,
                from,
                to,
            } => {
                if let Some(mut biz) = self.businesses.get_mut(business_id) {
                    biz.windows.push(ScheduleWindow {
                        id: *id,
                        weekday: *weekday,
                        from: *from,
                        to: *to,
                    });
                }
                self.window_index.insert(*id, *business_id);
            }
            Event::ScheduleUpdated {
                id,
                business_id,
                from,
                to,
            } => {
                if let Some(mut biz) = self.businesses.get_mut(business_id)
                    && let Some(w) = biz.windows.iter_mut().find(|w| w.id == *id)
                {
                    w.from = *from;
                    w.to = *to;
                }
            }
            Event::ScheduleRemoved { id, business_id } => {
                if let Some(mut biz) = self.businesses.get_mut(business_id) {
                    biz.windows.retain(|w| w.id != *id);
                }
                self.window_index.remove(id);
            }
            Event::UserRegistered {
                id,
                name,
                role,
                business_id,
            } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        role: *role,
                        business_id: *business_id,
                    },
                );
                if *role == Role::Employee
                    && let Some(biz) = business_id
                {
                    self.employees.entry(*biz).or_default().push(*id);
                    self.calendars
                        .insert(*id, Arc::new(RwLock::new(Calendar::new())));
                }
            }
            Event::BookingCreated { .. }
            | Event::BookingStatusChanged { .. }
            | Event::BookingRescheduled { .. } => {}
        }
    }

    /// Apply a booking event. No locking here — the caller holds the calendar
    /// lock(s). `old_cal` is only passed for a reschedule that moves the
    /// booking to a different employee.
    pub fn apply_booking(&self, event: &Event, cal: &mut Calendar, old_cal: Option<&mut Calendar>) {
        match event {
            Event::BookingCreated {
                id,
                client_id,
                service_id,
                business_id,
                employee_id,
                span,
                timezone,
                price,
                created_at,
            } => {
                cal.insert(Slot {
                    booking_id: *id,
                    span: *span,
                });
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        client_id: *client_id,
                        service_id: *service_id,
                        business_id: *business_id,
                        employee_id: *employee_id,
                        span: *span,
                        timezone: *timezone,
                        price: *price,
                        status: BookingStatus::Pending,
                        created_at: *created_at,
                    },
                );
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if *status == BookingStatus::Cancelled {
                    cal.remove(*id);
                }
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = *status;
                }
            }
            Event::BookingRescheduled {
                id,
                employee_id,
                span,
                ..
            } => {
                match old_cal {
                    Some(old) => {
                        old.remove(*id);
                    }
                    None => {
                        cal.remove(*id);
                    }
                }
                cal.insert(Slot {
                    booking_id: *id,
                    span: *span,
                });
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.employee_id = *employee_id;
                    b.span = *span;
                }
            }
            _ => {}
        }
    }

    /// Replay-time dispatch. We're the sole owner of the calendar Arcs during
    /// replay, so try_write always succeeds instantly (no contention).
    pub fn apply_replay(&self, event: &Event) {
        match event {
            Event::BookingCreated { employee_id, .. }
            | Event::BookingStatusChanged { employee_id, .. } => {
                if let Some(cal) = self.calendar(employee_id) {
                    let mut guard = cal.try_write().expect("replay: uncontended write");
                    self.apply_booking(event, &mut guard, None);
                }
            }
            Event::BookingRescheduled {
                old_employee_id,
                employee_id,
                ..
            } => {
                let Some(cal) = self.calendar(employee_id) else {
                    return;
                };
                let mut guard = cal.try_write().expect("replay: uncontended write");
                if old_employee_id != employee_id
                    && let Some(old) = self.calendar(old_employee_id)
                {
                    let mut old_guard = old.try_write().expect("replay: uncontended write");
                    self.apply_booking(event, &mut guard, Some(&mut old_guard));
                } else {
                    self.apply_booking(event, &mut guard, None);
                }
            }
            _ => self.apply_catalog(event),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
