//! In-process event bus
//!
//! Fans every published event out to the current subscribers, synchronously
//! and in subscription order. A failing or panicking handler is logged and
//! skipped; it never reaches the publisher or the remaining handlers.

pub mod bus;
pub mod error;
pub mod handlers;

pub use bus::{EventBus, Subscription, SubscriptionId};
pub use error::{EventBusError, Result};
pub use handlers::EventHandler;
