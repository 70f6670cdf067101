use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{overloaded_spans, peak_load};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

pub(crate) fn validate_window(start: NaiveDate, end: NaiveDate) -> Result<DateWindow, EngineError> {
    validate_date(start)?;
    validate_date(end)?;
    if end < start {
        return Err(EngineError::Validation(format!(
            "end date {end} is before start date {start}"
        )));
    }
    let window = DateWindow::new(start, end);
    if window.days() > MAX_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(window)
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

/// Decide whether `window` with `load` fits on the resource.
///
/// 1. Any blackout overlapping the window rejects outright.
/// 2. Active allocations overlapping the window are swept day by day together
///    with the candidate; the peak must stay within capacity.
///
/// `exclude` skips the allocation being updated.
pub(crate) fn check_allocation(
    rs: &ResourceState,
    window: &DateWindow,
    load: f64,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let resource_id = rs.resource.id;

    let blackouts: Vec<Ulid> = rs.overlapping_blackouts(window).map(|b| b.id).collect();
    if !blackouts.is_empty() {
        return Err(EngineError::BlackoutOverlap {
            resource_id,
            blackouts,
        });
    }

    let kind = rs.resource.kind();
    let capacity = rs.resource.capacity();
    let candidate = window.to_span();

    let mut loads = vec![(candidate, load)];
    let mut existing: Vec<(Ulid, Span)> = Vec::new();
    for allocation in rs.overlapping_allocations(window) {
        if Some(allocation.id) == exclude || !allocation.is_active() {
            continue;
        }
        // Clip to the candidate: load outside it is not this request's concern.
        if let Some(clipped) = allocation.window.intersection(window) {
            let span = clipped.to_span();
            loads.push((span, allocation.load(kind)));
            existing.push((allocation.id, span));
        }
    }

    let overloaded = overloaded_spans(&loads, capacity);
    if overloaded.is_empty() {
        return Ok(());
    }

    let colliding = existing
        .iter()
        .filter(|(_, span)| overloaded.iter().any(|o| o.overlaps(span)))
        .map(|(id, _)| *id)
        .collect();
    Err(EngineError::CapacityExceeded {
        resource_id,
        capacity,
        peak: peak_load(&loads),
        colliding,
    })
}

/// Active allocations a new blackout would sit on top of. They stay valid.
pub(crate) fn grandfathered_allocations(
    rs: &ResourceState,
    window: &DateWindow,
) -> Vec<Ulid> {
    rs.overlapping_allocations(window)
        .filter(|a| a.is_active())
        .map(|a| a.id)
        .collect()
}
