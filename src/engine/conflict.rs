use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// The caller identity handed over by the session layer.
pub(crate) fn authenticate(identity: &str) -> Result<&str, EngineError> {
    if identity.trim().is_empty() {
        return Err(EngineError::NotAuthenticated);
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::LimitExceeded("user identity too long"));
    }
    Ok(identity)
}

/// `end` must be strictly after `start`, both within sane bounds.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidRange { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

/// Reservations may start no earlier than today (UTC) and end no later than
/// `now + horizon`. A `None` horizon disables the window.
pub(crate) fn check_booking_window(
    span: &Span,
    horizon: Option<Ms>,
    now: Ms,
) -> Result<(), EngineError> {
    let Some(horizon) = horizon else {
        return Ok(());
    };
    let earliest = start_of_day(now);
    let latest = now.saturating_add(horizon);
    if span.start < earliest || span.end > latest {
        return Err(EngineError::OutsideBookingWindow { earliest, latest });
    }
    Ok(())
}

/// Fail with `Overlap` if any reservation other than `exclude` intersects `span`.
pub(crate) fn check_no_overlap(
    ledger: &BookingLedger,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    match ledger
        .overlapping(span)
        .find(|r| Some(r.id) != exclude)
    {
        Some(existing) => {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Overlap(existing.id))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(spans: &[(Ms, Ms)]) -> (BookingLedger, Vec<Ulid>) {
        let mut ledger = BookingLedger::new();
        let mut ids = Vec::new();
        for &(start, end) in spans {
            let id = Ulid::new();
            ids.push(id);
            ledger.insert(Reservation {
                id,
                owner_id: "anna".into(),
                span: Span::new(start, end),
                created_at: 0,
            });
        }
        (ledger, ids)
    }

    #[test]
    fn authenticate_rejects_blank() {
        assert!(matches!(authenticate(""), Err(EngineError::NotAuthenticated)));
        assert!(matches!(authenticate("   "), Err(EngineError::NotAuthenticated)));
        assert_eq!(authenticate("anna").unwrap(), "anna");
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        assert!(matches!(authenticate(&long), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn range_must_be_forward() {
        assert!(matches!(
            validate_range(10, 10),
            Err(EngineError::InvalidRange { start: 10, end: 10 })
        ));
        assert!(matches!(validate_range(11, 10), Err(EngineError::InvalidRange { .. })));
        assert_eq!(validate_range(10, 11).unwrap(), Span::new(10, 11));
    }

    #[test]
    fn range_before_epoch_is_rejected() {
        assert!(matches!(validate_range(-10, 10), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn overlap_detected() {
        let (ledger, ids) = ledger_with(&[(10 * HOUR_MS, 11 * HOUR_MS)]);
        let err = check_no_overlap(&ledger, &Span::new(10 * HOUR_MS + 30 * MINUTE_MS, 12 * HOUR_MS), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Overlap(id) if id == ids[0]));
    }

    #[test]
    fn back_to_back_is_fine() {
        let (ledger, _) = ledger_with(&[(10 * HOUR_MS, 11 * HOUR_MS)]);
        assert!(check_no_overlap(&ledger, &Span::new(11 * HOUR_MS, 12 * HOUR_MS), None).is_ok());
        assert!(check_no_overlap(&ledger, &Span::new(9 * HOUR_MS, 10 * HOUR_MS), None).is_ok());
    }

    #[test]
    fn excluded_reservation_ignored() {
        let (ledger, ids) = ledger_with(&[(100, 200), (300, 400)]);
        assert!(check_no_overlap(&ledger, &Span::new(150, 250), Some(ids[0])).is_ok());
        // still collides with the other one
        assert!(matches!(
            check_no_overlap(&ledger, &Span::new(150, 350), Some(ids[0])),
            Err(EngineError::Overlap(id)) if id == ids[1]
        ));
    }

    #[test]
    fn overlong_reservation_rejected() {
        let ledger = BookingLedger::new();
        let span = Span::new(0, MAX_RESERVATION_DURATION_MS + 1);
        assert!(matches!(
            check_no_overlap(&ledger, &span, None),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn booking_window_bounds() {
        let now = 100 * DAY_MS + 9 * HOUR_MS;
        let horizon = Some(61 * DAY_MS);
        let today = start_of_day(now);

        // Earlier today is still allowed
        assert!(check_booking_window(&Span::new(today, today + HOUR_MS), horizon, now).is_ok());
        // Yesterday is not
        assert!(matches!(
            check_booking_window(&Span::new(today - HOUR_MS, today), horizon, now),
            Err(EngineError::OutsideBookingWindow { .. })
        ));
        // Past the horizon
        let late = now + 61 * DAY_MS;
        assert!(matches!(
            check_booking_window(&Span::new(late - HOUR_MS, late + 1), horizon, now),
            Err(EngineError::OutsideBookingWindow { earliest, latest }) if earliest == today && latest == late
        ));
        // Disabled
        assert!(check_booking_window(&Span::new(0, 1), None, now).is_ok());
    }
}
