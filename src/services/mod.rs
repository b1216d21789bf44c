pub mod notification_listener;
pub mod persistence;

pub use notification_listener::{ListenerError, NotificationListener};
pub use persistence::{PersistError, PersistenceBridge};
