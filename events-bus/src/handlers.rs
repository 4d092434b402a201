//! Event handler abstraction

use crate::error::Result;

/// Observer of events published on an [`EventBus`](crate::EventBus).
///
/// Handlers run synchronously on the publishing task, so they should hand
/// heavy work off (for example through a channel) instead of blocking.
pub trait EventHandler<E>: Send + Sync {
    fn handle_event(&self, event: &E) -> Result<()>;
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(&E) -> Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &E) -> Result<()> {
        self(event)
    }
}

/// Adapter for closures that cannot fail
pub(crate) struct InfallibleHandler<F>(pub(crate) F);

impl<E, F> EventHandler<E> for InfallibleHandler<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn handle_event(&self, event: &E) -> Result<()> {
        (self.0)(event);
        Ok(())
    }
}
