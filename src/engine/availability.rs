use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

// ── Employee resolution ───────────────────────────────────────────

impl Engine {
    /// Check that `employee_id` names a registered EMPLOYEE of `business_id`.
    /// A missing user, a non-employee role and a foreign business all look
    /// the same from the outside: the employee is not in this business.
    pub(super) fn ensure_member_employee(
        &self,
        business_id: &Ulid,
        employee_id: &Ulid,
    ) -> Result<(), EngineError> {
        match self.store.users.get(employee_id) {
            Some(u) if u.role == Role::Employee && u.business_id == Some(*business_id) => Ok(()),
            _ => Err(EngineError::EmployeeNotInBusiness(*employee_id)),
        }
    }

    /// Requested-employee path. A cheap read-phase check reports a busy
    /// employee as EmployeeUnavailable; the write lock is only taken once
    /// that passes, and the conflict check is repeated under it. A booking
    /// that lands between the two phases surfaces as Conflict.
    pub(super) async fn acquire_requested(
        &self,
        business_id: &Ulid,
        employee_id: &Ulid,
        span: &Span,
    ) -> Result<OwnedRwLockWriteGuard<Calendar>, EngineError> {
        self.ensure_member_employee(business_id, employee_id)?;
        let cal = self
            .store
            .calendar(employee_id)
            .ok_or(EngineError::EmployeeNotInBusiness(*employee_id))?;
        {
            let guard = cal.read().await;
            if !guard.is_free(span, None) {
                return Err(EngineError::EmployeeUnavailable(*employee_id));
            }
        }
        let guard = cal.write_owned().await;
        check_no_conflict(&guard, span, None)?;
        Ok(guard)
    }

    /// Auto-assignment path: first-fit over the business's employees in
    /// registration order. Each candidate is screened with a read lock, then
    /// confirmed under its write lock; a candidate stolen between the two
    /// phases is skipped and the scan moves on.
    pub(super) async fn acquire_first_fit(
        &self,
        business_id: &Ulid,
        span: &Span,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<Calendar>), EngineError> {
        for employee_id in self.store.employees_of(business_id) {
            let Some(cal) = self.store.calendar(&employee_id) else {
                continue;
            };
            {
                let guard = cal.read().await;
                if !guard.is_free(span, None) {
                    continue;
                }
            }
            let guard = cal.write_owned().await;
            if guard.is_free(span, None) {
                return Ok((employee_id, guard));
            }
        }
        Err(EngineError::NoAvailableEmployee)
    }

    /// Read-only first-fit scan, for reschedules: finds the first employee
    /// free over `span` without taking any write lock. `exclude` keeps the
    /// booking being moved from blocking its own employee.
    pub(super) async fn scan_first_free(
        &self,
        business_id: &Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        for employee_id in self.store.employees_of(business_id) {
            let Some(cal) = self.store.calendar(&employee_id) else {
                continue;
            };
            let guard = cal.read().await;
            if guard.is_free(span, exclude) {
                return Ok(employee_id);
            }
        }
        Err(EngineError::NoAvailableEmployee)
    }

    /// Every employee of the business free over `span`, in registration
    /// order. Read locks only; the answer is advisory and may be stale by
    /// the time a booking is attempted.
    pub async fn available_employees(
        &self,
        business_id: &Ulid,
        span: &Span,
    ) -> Result<Vec<Ulid>, EngineError> {
        self.business(business_id)?;
        super::time::validate_instant(span.start)?;
        super::time::validate_instant(span.end)?;
        if span.start >= span.end {
            return Err(EngineError::InvalidInput(
                "interval start must be before its end".into(),
            ));
        }

        let mut free = Vec::new();
        for employee_id in self.store.employees_of(business_id) {
            let Some(cal) = self.store.calendar(&employee_id) else {
                continue;
            };
            let guard = cal.read().await;
            if guard.is_free(span, None) {
                free.push(employee_id);
            }
        }
        Ok(free)
    }
}
