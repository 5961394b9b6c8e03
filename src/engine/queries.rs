use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The session client's own bookings, most recent start first.
    pub fn bookings_for_client(&self, actor: Actor) -> Result<Vec<Booking>, EngineError> {
        if actor.role != Role::Client {
            return Err(EngineError::Forbidden("only clients have a personal booking list"));
        }
        let mut rows: Vec<Booking> = self
            .store
            .bookings
            .iter()
            .filter(|b| b.client_id == Some(actor.id))
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// The session employee's upcoming work, earliest start first.
    pub fn assignments_for_employee(&self, actor: Actor) -> Result<Vec<Booking>, EngineError> {
        if actor.role != Role::Employee {
            return Err(EngineError::Forbidden("only employees have an assignment list"));
        }
        let mut rows: Vec<Booking> = self
            .store
            .bookings
            .iter()
            .filter(|b| b.employee_id == actor.id)
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// Admin listing over every booking in the tenant, narrowed by the
    /// filter. The start range is half-open: `from <= start < to`.
    pub fn list_bookings(
        &self,
        actor: Actor,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        if actor.role != Role::Admin {
            return Err(EngineError::Forbidden("only admins may list all bookings"));
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from >= to {
                return Err(EngineError::InvalidInput(
                    "range start must be before range end".into(),
                ));
            }
            if to - from > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }

        let mut rows: Vec<Booking> = self
            .store
            .bookings
            .iter()
            .filter(|b| {
                filter.status.is_none_or(|s| b.status == s)
                    && filter.from.is_none_or(|f| b.span.start >= f)
                    && filter.to.is_none_or(|t| b.span.start < t)
                    && filter.client_id.is_none_or(|c| b.client_id == Some(c))
                    && filter.business_id.is_none_or(|biz| b.business_id == biz)
            })
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    pub fn list_businesses(&self) -> Vec<Business> {
        let mut rows: Vec<Business> = self
            .store
            .businesses
            .iter()
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by_key(|b| b.id);
        rows
    }

    pub fn list_services(&self, business_id: Option<Ulid>) -> Vec<Service> {
        let mut rows: Vec<Service> = self
            .store
            .services
            .iter()
            .filter(|s| business_id.is_none_or(|b| s.business_id == b))
            .map(|s| s.value().clone())
            .collect();
        rows.sort_by_key(|s| s.id);
        rows
    }

    /// A business's schedule windows ordered by weekday, then opening time.
    pub fn list_schedules(&self, business_id: &Ulid) -> Vec<ScheduleWindow> {
        let mut rows = self
            .store
            .businesses
            .get(business_id)
            .map(|b| b.windows.clone())
            .unwrap_or_default();
        rows.sort_by_key(|w| (w.weekday, w.from, w.id));
        rows
    }

    /// A business's employees in registration order, which is also the
    /// order auto-assignment scans them in.
    pub fn list_employees(&self, business_id: &Ulid) -> Vec<User> {
        self.store
            .employees_of(business_id)
            .iter()
            .filter_map(|id| self.store.users.get(id).map(|u| u.value().clone()))
            .collect()
    }
}
