//! Locators: which view instances an event belongs to.

use crate::error::ViewError;
use crate::event::EventData;
use crate::view::ViewContext;

/// Instance id used by [`GlobalInstance`].
pub const GLOBAL_INSTANCE_ID: &str = "global";

/// Maps an event to the ids of the view instances it updates.
///
/// Returning several ids fans the event out; returning none skips it.
pub trait ViewLocator: Send + Sync {
    /// Instance ids for `event`.
    ///
    /// `ctx` can load aggregates as of the event's position; its
    /// [`view_id`](ViewContext::view_id) is `None` while locating.
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the ids cannot be resolved; the batch is retried.
    fn view_ids(&self, event: &EventData, ctx: &ViewContext<'_>) -> Result<Vec<String>, ViewError>;
}

/// One view instance per aggregate, keyed by the aggregate id.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstancePerAggregate;

impl ViewLocator for InstancePerAggregate {
    fn view_ids(&self, event: &EventData, _ctx: &ViewContext<'_>) -> Result<Vec<String>, ViewError> {
        Ok(vec![event.aggregate_id().to_owned()])
    }
}

/// A single instance, [`GLOBAL_INSTANCE_ID`], for the whole view.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalInstance;

impl ViewLocator for GlobalInstance {
    fn view_ids(&self, _event: &EventData, _ctx: &ViewContext<'_>) -> Result<Vec<String>, ViewError> {
        Ok(vec![GLOBAL_INSTANCE_ID.to_owned()])
    }
}

/// Locator backed by a closure. Build with [`from_fn`].
#[derive(Clone, Copy)]
pub struct FnLocator<F>(F);

/// Wrap a closure as a [`ViewLocator`].
///
/// # Examples
///
/// ```
/// use replay_es::locator::{ViewLocator, from_fn};
///
/// // Index every event under its type tag.
/// let by_type = from_fn(|event, _ctx| Ok(vec![event.event_type().to_owned()]));
/// # fn assert_locator(_: &impl ViewLocator) {}
/// # assert_locator(&by_type);
/// ```
pub fn from_fn<F>(f: F) -> FnLocator<F>
where
    F: Fn(&EventData, &ViewContext<'_>) -> Result<Vec<String>, ViewError> + Send + Sync,
{
    FnLocator(f)
}

impl<F> ViewLocator for FnLocator<F>
where
    F: Fn(&EventData, &ViewContext<'_>) -> Result<Vec<String>, ViewError> + Send + Sync,
{
    fn view_ids(&self, event: &EventData, ctx: &ViewContext<'_>) -> Result<Vec<String>, ViewError> {
        (self.0)(event, ctx)
    }
}

impl<F> std::fmt::Debug for FnLocator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnLocator")
    }
}
