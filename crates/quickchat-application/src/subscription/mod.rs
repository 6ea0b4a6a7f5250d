//! Live subscription lifecycle.

mod manager;
mod stream_key;

pub use manager::{SubscriptionHandle, SubscriptionManager};
pub use stream_key::StreamKey;
