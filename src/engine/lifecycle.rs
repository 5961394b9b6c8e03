use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Drive a booking through PENDING → CONFIRMED → COMPLETED, or cancel it.
    /// The check and the write happen under the assigned employee's calendar
    /// lock, so two concurrent transitions on one booking serialize and the
    /// loser sees the winner's state.
    ///
    /// `expected` is an optional precondition: if the booking's status no
    /// longer matches it, the caller's view was stale and the change is
    /// refused with Conflict.
    pub async fn change_status(
        &self,
        actor: Actor,
        id: Ulid,
        new_status: BookingStatus,
        expected: Option<BookingStatus>,
    ) -> Result<Booking, EngineError> {
        loop {
            let booking = self.booking(&id)?;
            let cal = self
                .store
                .calendar(&booking.employee_id)
                .ok_or(EngineError::NotFound(booking.employee_id))?;
            let mut guard = cal.write_owned().await;

            // A reschedule may have moved the booking to another employee
            // while we were waiting for this lock; if so, lock the new
            // calendar instead.
            let current = self.booking(&id)?;
            if current.employee_id != booking.employee_id {
                continue;
            }

            match actor.role {
                Role::Client => {
                    if current.client_id != Some(actor.id) {
                        return Err(EngineError::Forbidden(
                            "clients may only cancel their own bookings",
                        ));
                    }
                    if new_status != BookingStatus::Cancelled {
                        return Err(EngineError::Forbidden(
                            "clients may only cancel bookings",
                        ));
                    }
                }
                Role::Employee => {
                    if current.employee_id != actor.id {
                        return Err(EngineError::Forbidden(
                            "employees may only update their own assignments",
                        ));
                    }
                    if new_status == BookingStatus::Pending {
                        return Err(EngineError::Forbidden(
                            "bookings cannot be moved back to PENDING",
                        ));
                    }
                }
                Role::Admin => {
                    let business = self.business(&current.business_id)?;
                    if business.owner_id != Some(actor.id) {
                        return Err(EngineError::Forbidden(
                            "admins may only manage bookings in a business they own",
                        ));
                    }
                }
            }

            if let Some(exp) = expected
                && current.status != exp
            {
                return Err(EngineError::Conflict(id));
            }
            if !current.status.can_transition_to(new_status) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: new_status,
                });
            }

            let event = Event::BookingStatusChanged {
                id,
                business_id: current.business_id,
                employee_id: current.employee_id,
                status: new_status,
            };
            self.persist_booking(&event, &mut guard, None).await?;

            let mut updated = current;
            updated.status = new_status;
            return Ok(updated);
        }
    }
}
