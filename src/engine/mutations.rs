use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_calendar_capacity, check_no_conflict};
use super::schedule::{check_window_fits, find_open_window};
use super::time::{end_of, normalize, now_ms, parse_clock, parse_zone, validate_instant};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_business(
        &self,
        id: Ulid,
        owner_id: Option<Ulid>,
        name: String,
        timezone: &str,
    ) -> Result<(), EngineError> {
        if self.store.businesses.len() >= MAX_BUSINESSES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }
        if name.is_empty() {
            return Err(EngineError::InvalidInput("business name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("business name too long"));
        }
        let tz = parse_zone(timezone)?;
        if let Some(owner) = owner_id {
            match self.store.users.get(&owner) {
                None => return Err(EngineError::NotFound(owner)),
                Some(u) if u.role != Role::Admin => {
                    return Err(EngineError::InvalidInput(
                        "business owner must be an ADMIN user".into(),
                    ));
                }
                Some(_) => {}
            }
        }
        if self.store.businesses.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BusinessCreated { id, owner_id, name, timezone: tz };
        self.persist_catalog(&event).await
    }

    pub async fn create_service(
        &self,
        id: Ulid,
        business_id: Ulid,
        name: String,
        duration_min: i64,
        price: Cents,
    ) -> Result<(), EngineError> {
        self.business(&business_id)?;
        let count = self
            .store
            .business_services
            .get(&business_id)
            .map(|s| s.len())
            .unwrap_or(0);
        if count >= MAX_SERVICES_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many services in business"));
        }
        if name.is_empty() {
            return Err(EngineError::InvalidInput("service name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if duration_min <= 0 {
            return Err(EngineError::InvalidInput(
                "service duration must be a positive number of minutes".into(),
            ));
        }
        if duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if price < 0 {
            return Err(EngineError::InvalidInput("service price must not be negative".into()));
        }
        if price > MAX_PRICE_CENTS {
            return Err(EngineError::LimitExceeded("service price too large"));
        }
        if self.store.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated { id, business_id, name, duration_min, price };
        self.persist_catalog(&event).await
    }

    pub async fn delete_service(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let business_id = self
            .store
            .services
            .get(&id)
            .map(|s| s.business_id)
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ServiceDeleted { id, business_id };
        self.persist_catalog(&event).await?;
        Ok(business_id)
    }

    pub async fn add_schedule(
        &self,
        id: Ulid,
        business_id: Ulid,
        weekday: u8,
        from: &str,
        to: &str,
    ) -> Result<(), EngineError> {
        let business = self.business(&business_id)?;
        if weekday > 6 {
            return Err(EngineError::InvalidInput(format!(
                "invalid weekday {weekday}, expected 0 (Sunday) through 6 (Saturday)"
            )));
        }
        if business.windows.len() >= MAX_WINDOWS_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many schedule windows"));
        }
        let from = parse_clock(from)?;
        let to = parse_clock(to)?;
        check_window_fits(&business.windows, weekday, from, to, None)?;
        if self.store.window_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ScheduleAdded { id, business_id, weekday, from, to };
        self.persist_catalog(&event).await
    }

    pub async fn update_schedule(
        &self,
        id: Ulid,
        from: &str,
        to: &str,
    ) -> Result<Ulid, EngineError> {
        let business_id = self
            .store
            .window_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let business = self.business(&business_id)?;
        let window = business
            .windows
            .iter()
            .find(|w| w.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let from = parse_clock(from)?;
        let to = parse_clock(to)?;
        check_window_fits(&business.windows, window.weekday, from, to, Some(id))?;

        let event = Event::ScheduleUpdated { id, business_id, from, to };
        self.persist_catalog(&event).await?;
        Ok(business_id)
    }

    pub async fn remove_schedule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let business_id = self
            .store
            .window_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ScheduleRemoved { id, business_id };
        self.persist_catalog(&event).await?;
        Ok(business_id)
    }

    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        role: Role,
        business_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if self.store.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if name.is_empty() {
            return Err(EngineError::InvalidInput("user name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.store.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        match (role, business_id) {
            (Role::Employee, None) => {
                return Err(EngineError::InvalidInput(
                    "employees must be registered into a business".into(),
                ));
            }
            (Role::Employee, Some(biz)) => {
                self.business(&biz)?;
                if self.store.employees_of(&biz).len() >= MAX_EMPLOYEES_PER_BUSINESS {
                    return Err(EngineError::LimitExceeded("too many employees in business"));
                }
            }
            (_, Some(_)) => {
                return Err(EngineError::InvalidInput(
                    "only employees belong to a business".into(),
                ));
            }
            (_, None) => {}
        }

        let event = Event::UserRegistered { id, name, role, business_id };
        self.persist_catalog(&event).await
    }

    /// The whole booking pipeline: validate the request, check the business
    /// is open for the full service span, resolve an employee, and insert
    /// under that employee's calendar write lock.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        if self.store.bookings.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let business = self.business(&req.business_id)?;
        let service = self
            .store
            .services
            .get(&req.service_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(req.service_id))?;
        if service.business_id != req.business_id {
            return Err(EngineError::InvalidInput(format!(
                "service {} does not belong to business {}",
                req.service_id, req.business_id
            )));
        }
        // Durations are validated at service creation; a zero would make the
        // booking span empty, so reject before any schedule lookup.
        if service.duration_min <= 0 {
            return Err(EngineError::InvalidInput(
                "service duration must be a positive number of minutes".into(),
            ));
        }
        if let Some(client) = req.client_id {
            match self.store.users.get(&client) {
                None => return Err(EngineError::NotFound(client)),
                Some(u) if u.role != Role::Client => {
                    return Err(EngineError::InvalidInput(
                        "client_id must reference a CLIENT user".into(),
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(p) = req.price {
            if p < 0 {
                return Err(EngineError::InvalidInput("price must not be negative".into()));
            }
            if p > MAX_PRICE_CENTS {
                return Err(EngineError::LimitExceeded("price too large"));
            }
        }

        // The request timezone wins; otherwise the booking is interpreted in
        // the business's own timezone.
        let tz = match &req.timezone {
            Some(name) => parse_zone(name)?,
            None => business.timezone,
        };
        validate_instant(req.start)?;
        let end = end_of(req.start, service.duration_min);
        validate_instant(end)?;
        let start_local = normalize(req.start, tz)?;
        let end_local = normalize(end, tz)?;
        find_open_window(&business.windows, &start_local, &end_local)?;

        let span = Span::new(req.start, end);
        let resolution = match req.employee_id {
            Some(employee) => self
                .acquire_requested(&req.business_id, &employee, &span)
                .await
                .map(|guard| (employee, guard)),
            None => self.acquire_first_fit(&req.business_id, &span).await,
        };
        let (employee_id, mut guard) = match resolution {
            Ok(r) => r,
            Err(e) => {
                if matches!(
                    e,
                    EngineError::Conflict(_)
                        | EngineError::EmployeeUnavailable(_)
                        | EngineError::NoAvailableEmployee
                ) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };
        check_calendar_capacity(&guard)?;
        // The duplicate screen at the top ran before any lock; a same-id
        // request may have committed on another calendar while we waited
        // for this one.
        if self.store.bookings.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let price = req.price.unwrap_or(service.price);
        let created_at = now_ms();
        let event = Event::BookingCreated {
            id: req.id,
            client_id: req.client_id,
            service_id: req.service_id,
            business_id: req.business_id,
            employee_id,
            span,
            timezone: tz,
            price,
            created_at,
        };
        self.persist_booking(&event, &mut guard, None).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);

        Ok(Booking {
            id: req.id,
            client_id: req.client_id,
            service_id: req.service_id,
            business_id: req.business_id,
            employee_id,
            span,
            timezone: tz,
            price,
            status: BookingStatus::Pending,
            created_at,
        })
    }

    /// Move a booking to a new start and optionally a new employee, with the
    /// same schedule and availability validation as a fresh booking. The
    /// booking's own slot never counts as a conflict. `employee`: None keeps
    /// the current assignee, Some(None) re-runs auto-assignment, Some(Some)
    /// targets a specific employee.
    ///
    /// Status and assignee are re-read under the calendar lock(s), like
    /// `change_status`: a transition or move that commits while this call
    /// waits is observed, never overwritten.
    pub async fn reschedule_booking(
        &self,
        actor: Actor,
        id: Ulid,
        new_start: Ms,
        employee: Option<Option<Ulid>>,
    ) -> Result<Booking, EngineError> {
        let booking = self.booking(&id)?;
        let business = self.business(&booking.business_id)?;
        match actor.role {
            Role::Client => {
                if booking.client_id != Some(actor.id) {
                    return Err(EngineError::Forbidden(
                        "clients may only reschedule their own bookings",
                    ));
                }
            }
            Role::Admin => {
                if business.owner_id != Some(actor.id) {
                    return Err(EngineError::Forbidden(
                        "admins may only manage bookings in a business they own",
                    ));
                }
            }
            Role::Employee => {
                return Err(EngineError::Forbidden("employees may not reschedule bookings"));
            }
        }

        // Duration comes from the booking itself, not the service row: the
        // service may have been deleted or re-priced since. Duration and
        // timezone never change after creation, so this validation stays
        // good however long the locks below take.
        let duration = booking.span.duration_ms();
        validate_instant(new_start)?;
        let end = new_start + duration;
        validate_instant(end)?;
        let start_local = normalize(new_start, booking.timezone)?;
        let end_local = normalize(end, booking.timezone)?;
        find_open_window(&business.windows, &start_local, &end_local)?;
        let span = Span::new(new_start, end);

        loop {
            let current = self.booking(&id)?;
            if current.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: current.status,
                });
            }

            let target = match employee {
                None => current.employee_id,
                Some(Some(e)) => {
                    self.ensure_member_employee(&current.business_id, &e)?;
                    // Same read-phase screen as a fresh requested booking: an
                    // already-busy target is EmployeeUnavailable, not a race
                    // loss.
                    let cal = self
                        .store
                        .calendar(&e)
                        .ok_or(EngineError::EmployeeNotInBusiness(e))?;
                    if !cal.read().await.is_free(&span, Some(id)) {
                        return Err(EngineError::EmployeeUnavailable(e));
                    }
                    e
                }
                Some(None) => {
                    self.scan_first_free(&current.business_id, &span, Some(id))
                        .await?
                }
            };

            let event = Event::BookingRescheduled {
                id,
                business_id: current.business_id,
                old_employee_id: current.employee_id,
                employee_id: target,
                span,
            };

            if target == current.employee_id {
                let cal = self
                    .store
                    .calendar(&target)
                    .ok_or(EngineError::NotFound(target))?;
                let mut guard = cal.write_owned().await;

                // A transition or another reschedule may have landed while we
                // waited for this lock.
                let locked = self.booking(&id)?;
                if locked.employee_id != current.employee_id {
                    continue;
                }
                if locked.status.is_terminal() {
                    return Err(EngineError::InvalidTransition {
                        from: locked.status,
                        to: locked.status,
                    });
                }
                check_no_conflict(&guard, &span, Some(id))?;
                self.persist_booking(&event, &mut guard, None).await?;

                let mut updated = locked;
                updated.employee_id = target;
                updated.span = span;
                return Ok(updated);
            }

            let old_cal = self
                .store
                .calendar(&current.employee_id)
                .ok_or(EngineError::NotFound(current.employee_id))?;
            let new_cal = self
                .store
                .calendar(&target)
                .ok_or(EngineError::EmployeeNotInBusiness(target))?;
            // Lock both calendars in id order so concurrent reschedules
            // cannot deadlock.
            let (mut old_guard, mut new_guard) = if current.employee_id < target {
                let og = old_cal.write_owned().await;
                let ng = new_cal.write_owned().await;
                (og, ng)
            } else {
                let ng = new_cal.write_owned().await;
                let og = old_cal.write_owned().await;
                (og, ng)
            };

            let locked = self.booking(&id)?;
            if locked.employee_id != current.employee_id {
                continue;
            }
            if locked.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: locked.status,
                    to: locked.status,
                });
            }
            check_no_conflict(&new_guard, &span, Some(id))?;
            check_calendar_capacity(&new_guard)?;
            self.persist_booking(&event, &mut new_guard, Some(&mut old_guard))
                .await?;

            let mut updated = locked;
            updated.employee_id = target;
            updated.span = span;
            return Ok(updated);
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Emission order matters: employees are
    /// written in registration order so first-fit assignment scans the same
    /// sequence after a restart, and every booking comes after the employee
    /// whose calendar it lands in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for u in self.store.users.iter() {
            if u.role != Role::Employee {
                events.push(Event::UserRegistered {
                    id: u.id,
                    name: u.name.clone(),
                    role: u.role,
                    business_id: u.business_id,
                });
            }
        }

        let business_ids: Vec<Ulid> = self.store.businesses.iter().map(|e| *e.key()).collect();
        for bid in &business_ids {
            let Some(biz) = self.store.businesses.get(bid).map(|e| e.value().clone()) else {
                continue;
            };
            events.push(Event::BusinessCreated {
                id: biz.id,
                owner_id: biz.owner_id,
                name: biz.name.clone(),
                timezone: biz.timezone,
            });
            for w in &biz.windows {
                events.push(Event::ScheduleAdded {
                    id: w.id,
                    business_id: biz.id,
                    weekday: w.weekday,
                    from: w.from,
                    to: w.to,
                });
            }
            for eid in self.store.employees_of(bid) {
                if let Some(u) = self.store.users.get(&eid) {
                    events.push(Event::UserRegistered {
                        id: u.id,
                        name: u.name.clone(),
                        role: u.role,
                        business_id: u.business_id,
                    });
                }
            }
            if let Some(service_ids) = self.store.business_services.get(bid) {
                for sid in service_ids.iter() {
                    if let Some(s) = self.store.services.get(sid) {
                        events.push(Event::ServiceCreated {
                            id: s.id,
                            business_id: s.business_id,
                            name: s.name.clone(),
                            duration_min: s.duration_min,
                            price: s.price,
                        });
                    }
                }
            }
        }

        for b in self.store.bookings.iter() {
            events.push(Event::BookingCreated {
                id: b.id,
                client_id: b.client_id,
                service_id: b.service_id,
                business_id: b.business_id,
                employee_id: b.employee_id,
                span: b.span,
                timezone: b.timezone,
                price: b.price,
                created_at: b.created_at,
            });
            if b.status != BookingStatus::Pending {
                events.push(Event::BookingStatusChanged {
                    id: b.id,
                    business_id: b.business_id,
                    employee_id: b.employee_id,
                    status: b.status,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
