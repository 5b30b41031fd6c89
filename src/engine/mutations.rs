use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{authenticate, check_booking_window, check_no_overlap, now_ms, validate_range};
use super::{Engine, EngineError};

impl Engine {
    /// Book `[start, end)` for `owner_id` under a fresh id.
    pub async fn create_reservation(
        &self,
        owner_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        self.insert_reservation(Ulid::new(), owner_id, start, end)
            .await
    }

    /// Like [`Engine::create_reservation`] with a caller-chosen id.
    pub async fn insert_reservation(
        &self,
        id: Ulid,
        owner_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let owner_id = authenticate(owner_id)?;
        let span = validate_range(start, end)?;
        let now = now_ms();
        check_booking_window(&span, self.options.booking_horizon, now)?;

        let mut ledger = self.ledger.write().await;
        if ledger.len() >= MAX_RESERVATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }
        if ledger.get(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!("reservation {id}")));
        }
        check_no_overlap(&ledger, &span, None)?;

        let reservation = Reservation {
            id,
            owner_id: owner_id.to_string(),
            span,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            id,
            owner_id: reservation.owner_id.clone(),
            span,
            created_at: now,
        };
        self.persist_reservation_event(&mut ledger, &event).await?;
        debug!("reservation {id} created by {owner_id}: [{}, {})", span.start, span.end);
        Ok(reservation)
    }

    /// Move an owned reservation. The reservation itself never counts as an
    /// overlap, so re-saving an unchanged slot always succeeds.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        owner_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let owner_id = authenticate(owner_id)?;
        let mut ledger = self.ledger.write().await;
        let current = ledger
            .get(&id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        if current.owner_id != owner_id {
            return Err(EngineError::NotOwner(id));
        }

        let span = validate_range(start, end)?;
        if span == current.span {
            return Ok(current.clone());
        }
        check_booking_window(&span, self.options.booking_horizon, now_ms())?;
        check_no_overlap(&ledger, &span, Some(id))?;

        let event = Event::ReservationUpdated { id, span };
        self.persist_reservation_event(&mut ledger, &event).await?;
        debug!("reservation {id} moved by {owner_id}: [{}, {})", span.start, span.end);
        ledger
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    /// Remove an owned reservation, returning what was removed.
    pub async fn delete_reservation(
        &self,
        id: Ulid,
        owner_id: &str,
    ) -> Result<Reservation, EngineError> {
        let owner_id = authenticate(owner_id)?;
        let mut ledger = self.ledger.write().await;
        let current = ledger
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        if current.owner_id != owner_id {
            return Err(EngineError::NotOwner(id));
        }

        let event = Event::ReservationDeleted { id };
        self.persist_reservation_event(&mut ledger, &event).await?;
        debug!("reservation {id} deleted by {owner_id}");
        Ok(current)
    }
}
