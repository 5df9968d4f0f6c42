//! Domain model shared by the network client and its front-ends.
//!
//! Everything here is plain data: messages, conversations, the outgoing
//! action envelope, the signed-in user and the persisted authentication
//! session.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
