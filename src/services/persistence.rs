use crate::config::PersistConfig;
use crate::metrics;
use crate::models::Message;
use crate::store::{MessageStore, StoreError};
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{ConnectionId, ConnectionRegistry, Frame};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("too many messages are already being persisted")]
    Saturated,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PersistError {
    /// Short label used for metrics and the `message.failed` reason.
    pub fn reason(&self) -> &'static str {
        match self {
            PersistError::Saturated => "saturated",
            PersistError::Store(_) => "store",
        }
    }
}

/// Hands inbound messages to the store without making the reader wait.
///
/// At most `max_in_flight` store-and-notify attempts run at once. Past that
/// bound a message is dropped immediately instead of queueing behind a slow
/// database. The message only reaches room members through the change
/// notification, so success is observed as the echo.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn MessageStore>,
    permits: Arc<Semaphore>,
    registry: ConnectionRegistry,
    report_failures: bool,
}

impl PersistenceBridge {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: ConnectionRegistry,
        config: &PersistConfig,
    ) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            registry,
            report_failures: config.report_failures,
        }
    }

    pub fn in_flight_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start persisting `message` on behalf of connection `origin`.
    ///
    /// Returns as soon as the attempt is scheduled. The returned handle only
    /// matters to callers that want to wait for the outcome; dropping it
    /// detaches the task.
    pub async fn submit(
        &self,
        message: Message,
        origin: ConnectionId,
    ) -> Result<JoinHandle<()>, PersistError> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let err = PersistError::Saturated;
                tracing::warn!(
                    message_id = %message.id,
                    room_id = %message.room,
                    connection_id = %origin,
                    "persistence saturated; dropping message"
                );
                self.report_failure(&message, origin, &err).await;
                return Err(err);
            }
        };

        let bridge = self.clone();
        Ok(tokio::spawn(async move {
            let result = bridge.store.store_and_notify(&message).await;
            drop(permit);

            if let Err(e) = result {
                let err = PersistError::from(e);
                tracing::error!(
                    error = %err,
                    message_id = %message.id,
                    room_id = %message.room,
                    "failed to persist message"
                );
                bridge.report_failure(&message, origin, &err).await;
            }
        }))
    }

    async fn report_failure(&self, message: &Message, origin: ConnectionId, err: &PersistError) {
        metrics::record_persist_failure(err.reason());
        if !self.report_failures {
            return;
        }

        let event = WsOutboundEvent::MessageFailed {
            id: message.id,
            reason: err.reason().to_string(),
        };
        match event.to_json() {
            Ok(json) => {
                self.registry
                    .send_to(message.room, origin, Frame::from(json))
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "failed to encode message.failed frame"),
        }
    }
}
