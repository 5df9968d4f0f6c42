//! Event system for the chat client
//!
//! [`EventBus`] carries [`Event`]s from the network core to front-ends
//! (replies, sign-in outcomes, captcha prompts); each listener reads them
//! through its own [`Subscription`].

mod bus;
mod types;

pub use bus::{EventBus, Subscription};
pub use types::*;
