//! Storage seams used by the relay core
//!
//! The connection tasks, persistence bridge and notification listener only
//! see these traits. `postgres` backs them with a deadpool pool plus a
//! dedicated LISTEN connection; `memory` keeps everything in-process.

pub mod memory;
pub mod postgres;

use crate::models::{Message, Room, User};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::{PgNotificationSource, PgStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("notification channel error: {0}")]
    Notification(String),

    #[error("notification payload of {0} bytes exceeds the channel limit")]
    PayloadTooLarge(usize),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Durable message storage with an atomic insert + change notification
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert the message and emit its `{room, id}` notification in one
    /// transaction. On error nothing is stored and nothing is announced.
    async fn store_and_notify(&self, message: &Message) -> Result<(), StoreError>;

    /// Re-hydrate a committed message, `None` if no such row exists.
    async fn fetch_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;
}

/// Room and user lookups needed to admit a connection
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_room(&self, id: Uuid) -> Result<Option<Room>, StoreError>;

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
}

/// Raw notification payloads, or the error that ended the subscription
pub type NotificationStream = BoxStream<'static, Result<String, StoreError>>;

/// Subscription to the change-notification channel.
///
/// Delivery is best-effort: notifications fired while nobody is subscribed
/// are gone for good.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self) -> Result<NotificationStream, StoreError>;
}
