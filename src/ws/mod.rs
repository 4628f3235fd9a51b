pub mod dispatch;
pub mod handler;
pub mod hub;
pub mod protocol;
pub mod session;

pub use hub::{ConnectionSender, Hub, Registration};
