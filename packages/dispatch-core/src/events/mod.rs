//! Event system (C6): canonical dispatch events and the subscriber hub that
//! fans them out over SSE.

mod canonical;
mod hub;

pub use canonical::{DispatchEvent, EventFilter};
pub use hub::{HubMessage, SubscriberHub, SubscriptionGuard};
