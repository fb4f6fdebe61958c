//! Typed events and the priority event bus.

mod bus;
mod types;

pub use bus::{
    BusStats, EventBus, EventBusError, EventHandler, EventRecord, HandlerStats, SubscribeOptions,
    SubscriptionId,
};
pub use types::{
    AccountData, Event, EventPayload, EventPriority, EventType, MarketData, SignalData,
    next_event_id,
};
