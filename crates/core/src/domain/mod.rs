mod action;
mod conversation;
mod message;
mod session;
pub mod timestamp;
mod user;

pub use action::{Action, ActionKind};
pub use conversation::Conversation;
pub use message::{Message, Role};
pub use session::{CloudflareCookies, Session};
pub use user::User;
