//! Pre-append integrity checks for event batches.
//!
//! Both checks are pure and run before anything reaches storage, so a
//! rejected batch leaves the log untouched.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventData, NO_SEQUENCE};

/// Check the structural integrity of a batch on its own.
///
/// Rules:
/// 1. every event carries a local sequence, a global sequence and an
///    aggregate id;
/// 2. global sequences are unique;
/// 3. per aggregate, local sequences taken in global order are contiguous
///    and ascending.
///
/// The rules do not depend on the order the events are given in.
///
/// # Errors
///
/// Returns [`StoreError::InvalidBatch`] naming the first broken rule.
pub fn validate_batch(batch_id: Uuid, events: &[EventData]) -> Result<(), StoreError> {
    for event in events {
        let m = &event.meta;
        if m.local_sequence.is_none() {
            return Err(StoreError::invalid(batch_id, "event without a local sequence"));
        }
        if m.global_sequence.is_none() {
            return Err(StoreError::invalid(batch_id, "event without a global sequence"));
        }
        if m.aggregate_id.is_none() {
            return Err(StoreError::invalid(batch_id, "event without an aggregate id"));
        }
    }

    let ordered = in_global_order(events);

    for pair in ordered.windows(2) {
        let (a, b) = (pair[0].global_sequence(), pair[1].global_sequence());
        if a == b {
            return Err(StoreError::invalid(
                batch_id,
                format!("global sequence {a} appears more than once"),
            ));
        }
    }

    let mut last_local: HashMap<&str, i64> = HashMap::new();
    for event in &ordered {
        let local = event.local_sequence();
        if let Some(previous) = last_local.insert(event.aggregate_id(), local)
            && previous + 1 != local
        {
            return Err(StoreError::invalid(
                batch_id,
                format!(
                    "aggregate '{}' jumps from local sequence {previous} to {local}",
                    event.aggregate_id()
                ),
            ));
        }
    }

    Ok(())
}

/// Check that a structurally valid batch continues each aggregate's stream.
///
/// `last_known` returns the last stored local sequence for an aggregate, or
/// [`NO_SEQUENCE`] if it has none. A batch whose first event for an
/// aggregate skips ahead is malformed; one that starts at or below the last
/// stored sequence lost a race with another writer.
///
/// # Errors
///
/// - [`StoreError::InvalidBatch`] if an aggregate's first local sequence
///   leaves a gap.
/// - [`StoreError::Concurrency`] if it overlaps sequences already stored
///   and no aggregate in the batch has a gap.
pub fn validate_continuation<F>(
    batch_id: Uuid,
    events: &[EventData],
    mut last_known: F,
) -> Result<(), StoreError>
where
    F: FnMut(&str) -> i64,
{
    // Batch order keeps the reported aggregate stable across runs.
    let mut first_local: Vec<(&str, i64)> = Vec::new();
    for event in events {
        let id = event.aggregate_id();
        match first_local.iter_mut().find(|(seen, _)| *seen == id) {
            Some((_, seq)) => *seq = (*seq).min(event.local_sequence()),
            None => first_local.push((id, event.local_sequence())),
        }
    }
    let streams: Vec<(&str, i64, i64)> = first_local
        .into_iter()
        .map(|(id, first)| (id, first, last_known(id)))
        .collect();

    // A gap can never succeed, so it wins over an overlap that a retry
    // might resolve.
    for &(aggregate_id, first, last) in &streams {
        if first > last + 1 {
            let expected = if last == NO_SEQUENCE { 0 } else { last + 1 };
            return Err(StoreError::invalid(
                batch_id,
                format!(
                    "aggregate '{aggregate_id}' expected local sequence {expected}, batch starts at {first}"
                ),
            ));
        }
    }
    for &(aggregate_id, first, last) in &streams {
        if first <= last {
            return Err(StoreError::Concurrency(format!(
                "aggregate '{aggregate_id}' already has local sequence {first}"
            )));
        }
    }

    Ok(())
}

/// Borrow the events sorted by global sequence.
pub(crate) fn in_global_order(events: &[EventData]) -> Vec<&EventData> {
    let mut ordered: Vec<&EventData> = events.iter().collect();
    ordered.sort_by_key(|e| e.global_sequence());
    ordered
}
