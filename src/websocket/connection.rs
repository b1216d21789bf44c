//! Per-connection reader and writer tasks
//!
//! An admitted connection is split into two tasks. The reader is the only
//! code that reads the socket and the writer is the only code that writes
//! it. Either may notice the connection is dead first; both go through
//! `Connection::close`, which deregisters exactly once.

use super::message_types::{WsInboundEvent, WsOutboundEvent};
use super::{ConnectionId, ConnectionRegistry, Frame, Member, Teardown};
use crate::config::WsConfig;
use crate::metrics;
use crate::models::{Identity, Message, Room};
use crate::services::PersistenceBridge;
use crate::state::AppState;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("websocket write failed: {0}")]
    Transport(#[from] WsError),
}

/// An admitted member of one room
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub room: Room,
    teardown: Arc<Teardown>,
    registry: ConnectionRegistry,
}

impl Connection {
    /// Deregister from the room and wake both tasks.
    ///
    /// Only the first caller (reader, writer, or a registry eviction) does
    /// any work; later calls return immediately.
    pub async fn close(&self) {
        if self.teardown.claim() {
            self.registry.leave(self.room.id, self.id).await;
            self.teardown.notify_closed();
        }
    }

    async fn handle_text(&self, text: &str, max_bytes: usize, persistence: &PersistenceBridge) {
        if text.len() > max_bytes {
            tracing::warn!(
                connection_id = %self.id,
                size = text.len(),
                limit = max_bytes,
                "dropping oversized frame"
            );
            return;
        }

        match serde_json::from_str::<WsInboundEvent>(text) {
            Ok(WsInboundEvent::MessageSend { text }) => {
                let message = Message::compose(
                    self.room.id,
                    self.identity.user_id,
                    &self.identity.username,
                    text,
                );
                // Failures are logged and reported by the bridge itself.
                let _ = persistence.submit(message, self.id).await;
            }
            Ok(WsInboundEvent::Unknown) => {
                tracing::debug!(connection_id = %self.id, "ignoring unknown event type");
            }
            Err(e) => {
                tracing::debug!(connection_id = %self.id, error = %e, "ignoring malformed frame");
            }
        }
    }
}

/// Drive an admitted connection until it closes.
///
/// Queues the `room.joined` welcome frame, joins the room, then runs the
/// reader and writer to completion.
pub async fn run<S>(ws: WebSocketStream<S>, identity: Identity, room: Room, state: AppState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = state.config.ws.clone();

    let welcome = match WsOutboundEvent::RoomJoined(room.clone()).to_json() {
        Ok(json) => Frame::from(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode room.joined frame");
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
    // The queue is empty and has room for at least one frame.
    let _ = outbound_tx.try_send(welcome);

    let conn = Arc::new(Connection {
        id: ConnectionId::new(),
        identity,
        room,
        teardown: Arc::new(Teardown::new()),
        registry: state.registry.clone(),
    });

    state
        .registry
        .join(
            conn.room.id,
            conn.id,
            Member::new(outbound_tx, conn.teardown.clone()),
        )
        .await;
    metrics::connection_opened();
    tracing::info!(
        connection_id = %conn.id,
        room_id = %conn.room.id,
        user_id = %conn.identity.user_id,
        "connection admitted"
    );

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, conn.clone(), config.clone()));
    let reader = tokio::spawn(read_loop(
        stream,
        conn.clone(),
        state.persistence.clone(),
        config,
    ));

    let (writer, reader) = tokio::join!(writer, reader);
    if let Err(e) = writer {
        tracing::error!(connection_id = %conn.id, error = %e, "writer task panicked");
    }
    if let Err(e) = reader {
        tracing::error!(connection_id = %conn.id, error = %e, "reader task panicked");
    }
    // Covers a panicked task that never reached its own close.
    conn.close().await;

    metrics::connection_closed();
    tracing::info!(connection_id = %conn.id, room_id = %conn.room.id, "connection closed");
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    conn: Arc<Connection>,
    persistence: PersistenceBridge,
    config: WsConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = conn.teardown.closed() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                tracing::debug!(connection_id = %conn.id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %conn.id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            WsMessage::Text(text) => {
                conn.handle_text(text.as_str(), config.max_message_bytes, &persistence)
                    .await;
            }
            WsMessage::Pong(_) => deadline = Instant::now() + config.pong_wait,
            WsMessage::Close(_) => break,
            WsMessage::Binary(data) => {
                tracing::debug!(connection_id = %conn.id, size = data.len(), "ignoring binary frame");
            }
            // pings are answered by the transport
            WsMessage::Ping(_) | WsMessage::Frame(_) => {}
        }
    }

    conn.close().await;
}

/// Ping schedule; ticks missed during a slow write are not replayed.
fn heartbeat(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

enum WriterStep {
    Frame(Option<Frame>),
    Heartbeat,
    Closed,
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Frame>,
    conn: Arc<Connection>,
    config: WsConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = heartbeat(config.ping_period);

    let result: Result<(), WriteError> = loop {
        let step = tokio::select! {
            frame = outbound.recv() => WriterStep::Frame(frame),
            _ = heartbeat.tick() => WriterStep::Heartbeat,
            _ = conn.teardown.closed() => WriterStep::Closed,
        };

        match step {
            WriterStep::Frame(Some(frame)) => {
                if let Err(e) = write_batch(&mut sink, &mut outbound, frame, &config).await {
                    break Err(e);
                }
            }
            WriterStep::Heartbeat => {
                let ping = sink.send(WsMessage::Ping(Bytes::new()));
                match timeout(config.write_wait, ping).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e.into()),
                    Err(_) => break Err(WriteError::Timeout(config.write_wait)),
                }
            }
            WriterStep::Frame(None) | WriterStep::Closed => {
                let _ = timeout(config.write_wait, sink.send(WsMessage::Close(None))).await;
                break Ok(());
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %conn.id, error = %e, "writer stopped");
    }
    conn.close().await;
}

/// Write `first` and whatever else is already queued, flushing once.
async fn write_batch<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    outbound: &mut mpsc::Receiver<Frame>,
    first: Frame,
    config: &WsConfig,
) -> Result<(), WriteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let batch = async {
        sink.feed(WsMessage::Text(first)).await?;
        while let Ok(next) = outbound.try_recv() {
            sink.feed(WsMessage::Text(next)).await?;
        }
        sink.flush().await
    };

    match timeout(config.write_wait, batch).await {
        Ok(result) => result.map_err(WriteError::from),
        Err(_) => Err(WriteError::Timeout(config.write_wait)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacTokenVerifier;
    use crate::config::{Config, ListenerConfig, PersistConfig};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn test_config(ws: WsConfig) -> Arc<Config> {
        Arc::new(Config {
            database_url: String::new(),
            ws_port: 0,
            http_port: 0,
            token_secret: "secret".into(),
            token_ttl: Duration::from_secs(3600),
            ws,
            listener: ListenerConfig::default(),
            persist: PersistConfig::default(),
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        state: AppState,
        room: Room,
        identity: Identity,
    }

    fn harness(ws: WsConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let room = store.add_room("general");
        let identity = Identity::from(store.add_user("ada"));
        let state = AppState::new(
            test_config(ws),
            store.clone(),
            store.clone(),
            Arc::new(HmacTokenVerifier::new("secret", Duration::from_secs(3600))),
        );
        Harness {
            store,
            state,
            room,
            identity,
        }
    }

    async fn connect(
        h: &Harness,
    ) -> (WebSocketStream<DuplexStream>, tokio::task::JoinHandle<()>) {
        connect_with_buffer(h, 64 * 1024).await
    }

    async fn connect_with_buffer(
        h: &Harness,
        pipe_bytes: usize,
    ) -> (WebSocketStream<DuplexStream>, tokio::task::JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(pipe_bytes);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let task = tokio::spawn(run(
            server,
            h.identity.clone(),
            h.room.clone(),
            h.state.clone(),
        ));
        (client, task)
    }

    async fn next_text(client: &mut WebSocketStream<DuplexStream>) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn first_frame_is_room_joined() {
        let h = harness(WsConfig::default());
        let (mut client, task) = connect(&h).await;

        let value = next_text(&mut client).await;
        assert_eq!(value["type"], "room.joined");
        assert_eq!(value["data"]["name"], "general");
        assert_eq!(h.state.registry.member_count(h.room.id).await, 1);

        client.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn message_send_is_persisted_with_server_identity() {
        let h = harness(WsConfig::default());
        let (mut client, task) = connect(&h).await;
        next_text(&mut client).await;

        client
            .send(WsMessage::text(
                r#"{"type":"message.send","text":"hi","sender_id":"spoofed"}"#,
            ))
            .await
            .unwrap();

        let store = h.store.clone();
        wait_until(|| store.message_count() == 1).await;

        client.close(None).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_and_reading_continues() {
        let h = harness(WsConfig {
            max_message_bytes: 64,
            ..WsConfig::default()
        });
        let (mut client, task) = connect(&h).await;
        next_text(&mut client).await;

        let oversized = format!(r#"{{"type":"message.send","text":"{}"}}"#, "x".repeat(200));
        for frame in [
            oversized.as_str(),
            "not json",
            r#"{"type":"typing"}"#,
            r#"{"type":"message.send","text":"ok"}"#,
        ] {
            client.send(WsMessage::text(frame)).await.unwrap();
        }

        let store = h.store.clone();
        wait_until(|| store.message_count() == 1).await;
        assert_eq!(h.state.registry.member_count(h.room.id).await, 1);

        client.close(None).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn registry_eviction_closes_the_stream() {
        let h = harness(WsConfig {
            outbound_capacity: 1,
            ..WsConfig::default()
        });
        let (mut client, task) = connect(&h).await;
        next_text(&mut client).await;

        // nothing yields between these, so the writer cannot drain the queue
        let mut evicted = 0;
        for _ in 0..3 {
            evicted += h.state.registry.broadcast(h.room.id, Frame::from("{}")).await.evicted;
        }
        assert_eq!(evicted, 1);
        assert_eq!(h.state.registry.room_count().await, 0);

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(msg) = client.next().await {
                if matches!(msg, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "evicted client should see its stream close");

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let h = harness(WsConfig {
            pong_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(4),
            ..WsConfig::default()
        });
        // the client never polls, so pings are never answered
        let (_client, task) = connect(&h).await;

        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("connection should close after the read deadline")
            .unwrap();
        assert_eq!(h.state.registry.room_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answering_pings_keeps_the_connection_alive() {
        let h = harness(WsConfig {
            pong_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(4),
            ..WsConfig::default()
        });
        let (client, task) = connect(&h).await;

        // reading is what answers pings on the client side
        let pings = Arc::new(AtomicUsize::new(0));
        let seen = pings.clone();
        let reader = tokio::spawn(async move {
            let mut client = client;
            while let Some(Ok(msg)) = client.next().await {
                if msg.is_ping() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!task.is_finished(), "a responsive peer must outlive pong_wait");
        assert_eq!(h.state.registry.member_count(h.room.id).await, 1);
        assert!(pings.load(Ordering::SeqCst) >= 5);

        // dropping the client ends the session
        reader.abort();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("connection should close once the client is gone")
            .unwrap();
        assert_eq!(h.state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn queued_frames_arrive_separately_in_order() {
        let h = harness(WsConfig::default());
        let (mut client, task) = connect(&h).await;
        next_text(&mut client).await;

        for n in 0..5 {
            let report = h
                .state
                .registry
                .broadcast(h.room.id, Frame::from(format!(r#"{{"n":{n}}}"#)))
                .await;
            assert_eq!(report.delivered, 1);
        }

        for n in 0..5 {
            assert_eq!(next_text(&mut client).await["n"], n);
        }

        client.close(None).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_hits_write_deadline() {
        let h = harness(WsConfig {
            write_wait: Duration::from_secs(2),
            ..WsConfig::default()
        });
        // the client never reads, so the small pipe fills up
        let (_client, task) = connect_with_buffer(&h, 1024).await;
        while h.state.registry.member_count(h.room.id).await == 0 {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        h.state
            .registry
            .broadcast(h.room.id, Frame::from("x".repeat(8 * 1024)))
            .await;

        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("writer should give up after write_wait")
            .unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2), "closed after {waited:?}");
        assert!(waited < Duration::from_secs(60), "closed by the read deadline instead");
        assert_eq!(h.state.registry.room_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_does_not_burst_after_a_stall() {
        let mut ticker = heartbeat(Duration::from_secs(4));
        tokio::time::advance(Duration::from_secs(13)).await;

        ticker.tick().await;
        let resumed = Instant::now();
        ticker.tick().await;
        assert!(resumed.elapsed() >= Duration::from_secs(4));
    }
}
