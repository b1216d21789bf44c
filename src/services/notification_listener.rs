//! Change-notification fan-out
//!
//! Bridges `{room, id}` envelopes from the notification channel to the room
//! registry. The listener runs for the life of the process: a broken
//! subscription is retried after a fixed delay, and a single bad envelope is
//! dropped without affecting the ones after it.

use crate::config::ListenerConfig;
use crate::metrics;
use crate::models::ChangeNotification;
use crate::store::{MessageStore, NotificationSource, StoreError};
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{BroadcastReport, ConnectionRegistry, Frame};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("malformed notification payload: {0}")]
    Malformed(serde_json::Error),

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("failed to encode message frame: {0}")]
    Encode(serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ListenerError {
    fn outcome(&self) -> &'static str {
        match self {
            ListenerError::Malformed(_) => "malformed",
            ListenerError::NotFound(_) => "not_found",
            ListenerError::Encode(_) | ListenerError::Store(_) => "error",
        }
    }
}

pub struct NotificationListener {
    source: Arc<dyn NotificationSource>,
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    retry_delay: Duration,
}

impl NotificationListener {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        store: Arc<dyn MessageStore>,
        registry: ConnectionRegistry,
        config: &ListenerConfig,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            retry_delay: config.retry_delay,
        }
    }

    /// Subscribe and fan out forever.
    pub async fn run(self) {
        loop {
            match self.source.subscribe().await {
                Ok(mut notifications) => {
                    tracing::info!("listening for change notifications");
                    while let Some(item) = notifications.next().await {
                        match item {
                            Ok(payload) => self.dispatch(&payload).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "notification subscription failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to subscribe to change notifications");
                }
            }

            metrics::record_notification("resubscribe");
            time::sleep(self.retry_delay).await;
        }
    }

    async fn dispatch(&self, payload: &str) {
        match self.handle_notification(payload).await {
            Ok(report) => {
                metrics::record_notification("broadcast");
                tracing::debug!(
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "fanned out message"
                );
            }
            Err(e) => {
                metrics::record_notification(e.outcome());
                tracing::warn!(error = %e, payload, "dropping notification");
            }
        }
    }

    /// Re-fetch the announced message and broadcast it to its room.
    pub async fn handle_notification(
        &self,
        payload: &str,
    ) -> Result<BroadcastReport, ListenerError> {
        let envelope = ChangeNotification::from_json(payload).map_err(ListenerError::Malformed)?;

        let message = self
            .store
            .fetch_message(envelope.id)
            .await?
            .ok_or(ListenerError::NotFound(envelope.id))?;

        let room = message.room;
        let frame = WsOutboundEvent::MessageNew(message)
            .to_json()
            .map_err(ListenerError::Encode)?;

        Ok(self.registry.broadcast(room, Frame::from(frame)).await)
    }
}
