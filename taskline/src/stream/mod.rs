//! Long-lived producer/consumer channels.
//!
//! A channel freezes one stage chain and runs it once per produced item,
//! under a [`DeliveryPolicy`].

mod channel;
mod policy;

pub use channel::{StreamChannel, Streaming};
pub use policy::DeliveryPolicy;
