pub mod message;
pub mod room;

pub use message::{ChangeNotification, Message};
pub use room::{Identity, Room, User};
