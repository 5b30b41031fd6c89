use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let ledger = self.ledger.read().await;
        ledger
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    /// Reservations whose start falls in `[from, to)`, ascending by start.
    pub async fn list_in_range(&self, from: Ms, to: Ms) -> Result<Vec<Reservation>, EngineError> {
        let window = Span::try_new(from, to).ok_or(EngineError::InvalidRange {
            start: from,
            end: to,
        })?;
        if window.duration_ms() > self.options.max_query_window {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let ledger = self.ledger.read().await;
        Ok(ledger.starting_within(&window).to_vec())
    }

    /// The Monday-to-Monday (UTC) week containing `t`.
    pub async fn list_week(&self, t: Ms) -> Result<Vec<Reservation>, EngineError> {
        let week =
            week_containing(t).ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        self.list_in_range(week.start, week.end).await
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Vec<Reservation> {
        let ledger = self.ledger.read().await;
        ledger
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub async fn reservation_count(&self) -> usize {
        self.ledger.read().await.len()
    }

    pub fn get_profile(&self, id: &str) -> Option<Profile> {
        self.directory.profile(id)
    }

    pub fn list_profiles(&self) -> Vec<Profile> {
        self.directory.profiles()
    }

    /// Configured and granted administrators, sorted.
    pub fn list_admins(&self) -> Vec<String> {
        let mut admins: Vec<String> = self
            .options
            .admins
            .iter()
            .cloned()
            .chain(self.directory.granted_admins())
            .collect();
        admins.sort();
        admins.dedup();
        admins
    }
}
