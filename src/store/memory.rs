use super::{Directory, MessageStore, NotificationSource, NotificationStream, StoreError};
use crate::models::{Message, Room, User};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

const NOTIFY_BUFFER: usize = 1024;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    rooms: HashMap<Uuid, Room>,
    messages: HashMap<Uuid, Message>,
}

/// In-process store implementing every storage seam.
///
/// Mirrors PostgreSQL semantics the relay depends on: a notification is
/// published only when its insert commits, and a notification published
/// while nobody is subscribed is lost.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    notify: broadcast::Sender<String>,
    fail_next_notify: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_BUFFER);
        Self {
            tables: Mutex::new(Tables::default()),
            notify,
            fail_next_notify: AtomicBool::new(false),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves the maps consistent; keep going.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, username: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
        };
        self.tables().users.insert(user.id, user.clone());
        user
    }

    pub fn add_room(&self, name: &str) -> Room {
        self.add_room_with_id(Uuid::new_v4(), name)
    }

    pub fn add_room_with_id(&self, id: Uuid, name: &str) -> Room {
        let room = Room {
            id,
            name: name.to_string(),
        };
        self.tables().rooms.insert(room.id, room.clone());
        room
    }

    /// Make the next `store_and_notify` fail at the notify step.
    pub fn fail_next_notify(&self) {
        self.fail_next_notify.store(true, Ordering::SeqCst);
    }

    /// Publish a raw payload on the notification channel, bypassing storage.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish_raw(&self, payload: impl Into<String>) -> usize {
        self.notify.send(payload.into()).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.notify.receiver_count()
    }

    pub fn message_count(&self) -> usize {
        self.tables().messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_and_notify(&self, message: &Message) -> Result<(), StoreError> {
        let payload = message.notification().to_json()?;

        let mut tables = self.tables();
        if tables.messages.contains_key(&message.id) {
            return Err(StoreError::Query(format!(
                "duplicate key value violates unique constraint: {}",
                message.id
            )));
        }
        if self.fail_next_notify.swap(false, Ordering::SeqCst) {
            // rollback: the insert never becomes visible
            return Err(StoreError::Notification("injected notify failure".into()));
        }

        tables.messages.insert(message.id, message.clone());
        // commit, then deliver; with no subscriber the notification is dropped
        let _ = self.notify.send(payload);
        Ok(())
    }

    async fn fetch_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let tables = self.tables();
        Ok(tables.messages.get(&id).map(|m| {
            let mut m = m.clone();
            if let Some(user) = tables.users.get(&m.sender_id) {
                m.username = user.username.clone();
            }
            m
        }))
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn find_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        Ok(self.tables().rooms.get(&id).cloned())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables().users.get(&id).cloned())
    }
}

#[async_trait]
impl NotificationSource for MemoryStore {
    async fn subscribe(&self) -> Result<NotificationStream, StoreError> {
        let stream = BroadcastStream::new(self.notify.subscribe()).map(|item| {
            item.map_err(|e: BroadcastStreamRecvError| {
                StoreError::Notification(format!("listener fell behind: {e}"))
            })
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeNotification;

    fn sample(store: &MemoryStore) -> Message {
        let user = store.add_user("ada");
        let room = store.add_room("general");
        Message::compose(room.id, user.id, &user.username, "hello".into())
    }

    #[tokio::test]
    async fn stored_message_fetches_identical_record() {
        let store = MemoryStore::new();
        let msg = sample(&store);

        store.store_and_notify(&msg).await.unwrap();

        let fetched = store.fetch_message(msg.id).await.unwrap();
        assert_eq!(fetched, Some(msg));
    }

    #[tokio::test]
    async fn failed_notify_rolls_back_insert() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe().await.unwrap();
        let msg = sample(&store);

        store.fail_next_notify();
        assert!(store.store_and_notify(&msg).await.is_err());

        assert_eq!(store.fetch_message(msg.id).await.unwrap(), None);
        assert_eq!(store.message_count(), 0);
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(pending.is_err(), "no notification for a rolled back insert");
    }

    #[tokio::test]
    async fn commit_publishes_room_and_id() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe().await.unwrap();
        let msg = sample(&store);

        store.store_and_notify(&msg).await.unwrap();

        let payload = sub.next().await.unwrap().unwrap();
        let envelope = ChangeNotification::from_json(&payload).unwrap();
        assert_eq!(envelope, msg.notification());
    }

    #[tokio::test]
    async fn notification_without_subscriber_is_lost() {
        let store = MemoryStore::new();
        let msg = sample(&store);

        // nobody listening: the write still commits but the event is dropped
        store.store_and_notify(&msg).await.unwrap();
        assert!(store.fetch_message(msg.id).await.unwrap().is_some());

        let mut sub = store.subscribe().await.unwrap();
        let late = tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(late.is_err(), "missed notifications are not redelivered");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = MemoryStore::new();
        let msg = sample(&store);

        store.store_and_notify(&msg).await.unwrap();
        assert!(store.store_and_notify(&msg).await.is_err());
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn fetch_resolves_current_username() {
        let store = MemoryStore::new();
        let user = store.add_user("ada");
        let room = store.add_room("general");
        let msg = Message::compose(room.id, user.id, "stale-name", "hi".into());

        store.store_and_notify(&msg).await.unwrap();

        let fetched = store.fetch_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.username, "ada");
    }
}
