//! Read-your-writes: waiting for views to reach a command's position.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ConsistencyTimeout, ViewError, WaitError};
use crate::event::NO_SEQUENCE;

/// Interval between uncached position reads while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of a processed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandProcessingResult {
    new_position: Option<i64>,
}

impl CommandProcessingResult {
    /// Result of a command that emitted nothing.
    pub fn no_events() -> Self {
        Self { new_position: None }
    }

    /// Result of a command whose last appended event has `position`.
    pub fn with_position(position: i64) -> Self {
        Self {
            new_position: Some(position),
        }
    }

    /// Returns `true` if the command appended events.
    pub fn events_emitted(&self) -> bool {
        self.new_position.is_some()
    }

    /// Global sequence of the last appended event.
    pub fn new_position(&self) -> Option<i64> {
        self.new_position
    }
}

/// Wait until `position` reports at least `target`.
///
/// `position` receives `true` for the first, cache-allowed read and `false`
/// for every poll after it. Polls every [`POLL_INTERVAL`].
///
/// # Errors
///
/// - [`WaitError::Timeout`] if `timeout` elapses first; it carries the
///   highest position seen.
/// - [`WaitError::View`] if a position read fails.
pub(crate) async fn wait_for_position<F>(
    target: i64,
    timeout: Duration,
    mut position: F,
) -> Result<(), WaitError>
where
    F: FnMut(bool) -> Result<i64, ViewError>,
{
    let mut reached = position(true)?;
    if reached >= target {
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ConsistencyTimeout {
                target,
                reached,
                timeout,
            }
            .into());
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;

        reached = reached.max(position(false)?);
        if reached >= target {
            return Ok(());
        }
    }
}

/// Target to wait for, or `None` when nothing was emitted.
pub(crate) fn target_of(result: &CommandProcessingResult) -> Option<i64> {
    result.new_position.filter(|&p| p > NO_SEQUENCE)
}
