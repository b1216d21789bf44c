use super::{Directory, MessageStore, NotificationSource, NotificationStream, StoreError};
use crate::models::{ChangeNotification, Message, Room, User};
use async_trait::async_trait;
use db_pool::acquire_with_metrics;
use deadpool_postgres::Pool;
use futures_util::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls, Row};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const SERVICE: &str = "chat-relay";

/// Notifications buffered ahead of the listener. When full, the LISTEN
/// connection stops being polled and PostgreSQL queues the rest.
const NOTIFY_BUFFER: usize = 256;

/// Pool-backed message store and directory
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    channel: String,
}

impl PgStore {
    pub fn new(pool: Pool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        room: row.get("room"),
        sender_id: row.get("sender_id"),
        username: row.get("username"),
        body: row.get("body"),
        sent_at: row.get("sent_at"),
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn store_and_notify(&self, message: &Message) -> Result<(), StoreError> {
        let payload = message.notification().to_json()?;
        if payload.len() >= ChangeNotification::MAX_PAYLOAD_BYTES {
            return Err(StoreError::PayloadTooLarge(payload.len()));
        }

        let mut client = acquire_with_metrics(&self.pool, SERVICE).await?;
        // Dropping the transaction without commit rolls it back.
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO messages (id, room, sender_id, body, sent_at) VALUES ($1, $2, $3, $4, $5)",
            &[
                &message.id,
                &message.room,
                &message.sender_id,
                &message.body,
                &message.sent_at,
            ],
        )
        .await?;

        tx.execute("SELECT pg_notify($1, $2)", &[&self.channel, &payload])
            .await?;

        tx.commit().await?;

        tracing::debug!(
            message_id = %message.id,
            room_id = %message.room,
            "message stored and announced"
        );
        Ok(())
    }

    async fn fetch_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let client = acquire_with_metrics(&self.pool, SERVICE).await?;
        let row = client
            .query_opt(
                r#"
                SELECT m.id, m.room, m.sender_id, COALESCE(u.username, '') AS username,
                       m.body, m.sent_at
                FROM messages m
                LEFT JOIN users u ON u.id = m.sender_id
                WHERE m.id = $1
                "#,
                &[&id],
            )
            .await?;

        Ok(row.as_ref().map(message_from_row))
    }
}

#[async_trait]
impl Directory for PgStore {
    async fn find_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        let client = acquire_with_metrics(&self.pool, SERVICE).await?;
        let row = client
            .query_opt("SELECT id, name FROM rooms WHERE id = $1", &[&id])
            .await?;

        Ok(row.map(|row| Room {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let client = acquire_with_metrics(&self.pool, SERVICE).await?;
        let row = client
            .query_opt("SELECT id, username FROM users WHERE id = $1", &[&id])
            .await?;

        Ok(row.map(|row| User {
            id: row.get("id"),
            username: row.get("username"),
        }))
    }
}

/// LISTEN subscription on a dedicated (non-pooled) connection
///
/// A pooled connection would be recycled out from under the listener, so each
/// subscription opens its own and drops it when the stream is dropped.
#[derive(Clone)]
pub struct PgNotificationSource {
    database_url: String,
    channel: String,
}

impl PgNotificationSource {
    pub fn new(database_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&self) -> Result<NotificationStream, StoreError> {
        let (client, mut connection) = tokio_postgres::connect(&self.database_url, NoTls).await?;

        // The connection only makes progress while polled, LISTEN included.
        let messages = stream::poll_fn(move |cx| connection.poll_message(cx)).filter_map(
            |msg| async move {
                match msg {
                    Ok(AsyncMessage::Notification(n)) => Some(Ok(n.payload().to_string())),
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!(notice = %notice, "postgres notice on listen connection");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(StoreError::Notification(e.to_string()))),
                }
            },
        );
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        tokio::spawn(forward_notifications(Box::pin(messages), tx));

        // Channel names are validated as plain identifiers in Config.
        client
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await?;
        tracing::info!(channel = %self.channel, "LISTEN established");

        // Keeping the client alive keeps the connection (and subscription) open.
        let stream = ReceiverStream::new(rx).map(move |item| {
            let _client = &client;
            item
        });
        Ok(stream.boxed())
    }
}

/// Pump payloads into `tx` until the subscriber goes away or the source fails.
///
/// The last item is always an error, either the source's own or a
/// "closed" error when the source simply ends.
async fn forward_notifications<St>(mut items: St, tx: mpsc::Sender<Result<String, StoreError>>)
where
    St: Stream<Item = Result<String, StoreError>> + Unpin,
{
    while let Some(item) = items.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
    let _ = tx
        .send(Err(StoreError::Notification("listen connection closed".into())))
        .await;
}
