//! Subscription status tracking
//!
//! [`state`] holds the pure reducer and derived queries; [`store`] wires sync
//! triggers, the TTL-cached fetch and the per-user realtime channel onto it.

pub mod state;
pub mod store;

pub use state::{
    reduce, SubscriptionAction, SubscriptionRecord, SubscriptionState, SubscriptionStatus,
};
pub use store::SubscriptionStore;
