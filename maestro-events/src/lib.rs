//! ABOUTME: Event bus for maestro progress streaming
//! ABOUTME: Typed envelopes, glob patterns, execution-ID filtered delivery

pub mod bus;
pub mod event;
pub mod stream;

pub use bus::EventBus;
pub use event::BusEvent;
pub use stream::{AllEventsStream, SubscriptionStream};
