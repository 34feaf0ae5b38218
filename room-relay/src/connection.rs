//! Websocket connection adapter.
//!
//! Each connection runs two pumps: the read pump forwards decoded chat to the
//! hub, the write pump drains the member's private queue to the socket and
//! keeps the peer alive with pings. Whichever pump stops first tears the
//! connection down, and the member is unregistered exactly once from the
//! hub's point of view.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    task::JoinError,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::{
    config::RelayConfig,
    hub::Hub,
    member::{DeliveryError, Member},
    message::RoomMessage,
};

pub type Outbox = mpsc::Receiver<Arc<RoomMessage>>;

/// Why a pump stopped.
#[derive(Debug, Error)]
pub enum PumpExit {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("nothing received from peer within {0:?}")]
    IdleTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("member queue closed by the hub")]
    SinkClosed,
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The hub's view of one websocket connection.
pub struct ConnectionHandle {
    username: String,
    room: String,
    sink: Mutex<Option<mpsc::Sender<Arc<RoomMessage>>>>,
}

impl ConnectionHandle {
    pub fn new(
        username: impl Into<String>,
        room: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, Outbox) {
        let (sender, outbox) = mpsc::channel(capacity);
        let handle = Arc::new(Self {
            username: username.into(),
            room: room.into(),
            sink: Mutex::new(Some(sender)),
        });
        (handle, outbox)
    }
}

impl Member for ConnectionHandle {
    fn username(&self) -> &str {
        &self.username
    }

    fn current_room(&self) -> &str {
        &self.room
    }

    fn try_deliver(&self, message: Arc<RoomMessage>) -> Result<(), DeliveryError> {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sink.as_ref() else {
            return Err(DeliveryError::Closed);
        };
        sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close_sink(&self) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Registers a freshly upgraded socket with the hub and runs both pumps
/// until the connection is finished.
pub async fn serve_connection(
    socket: WebSocket,
    hub: Arc<Hub>,
    config: Arc<RelayConfig>,
    username: String,
    room: String,
) {
    let (handle, outbox) = ConnectionHandle::new(username, room, config.send_queue_capacity);
    let member: Arc<dyn Member> = handle.clone();

    if let Err(err) = hub.register_member(Arc::clone(&member)).await {
        debug!(
            room = %handle.room,
            username = %handle.username,
            error = %err,
            "connection rejected"
        );
        return;
    }

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, outbox, Arc::clone(&config)));
    let mut reader = tokio::spawn(read_pump(
        stream,
        Arc::clone(&hub),
        Arc::clone(&handle),
        config,
    ));

    select! {
        exit = &mut reader => {
            log_exit(&handle, "read", exit);
            // Closing the sink makes the writer send a close frame and stop.
            hub.unregister_member(&member).await;
            log_exit(&handle, "write", writer.await);
        }
        exit = &mut writer => {
            log_exit(&handle, "write", exit);
            reader.abort();
            hub.unregister_member(&member).await;
        }
    }
}

fn log_exit(handle: &ConnectionHandle, pump: &'static str, exit: Result<PumpExit, JoinError>) {
    match exit {
        Ok(reason) => debug!(
            room = %handle.room,
            username = %handle.username,
            pump,
            %reason,
            "pump stopped"
        ),
        Err(err) => debug!(
            room = %handle.room,
            username = %handle.username,
            pump,
            error = ?err,
            "pump task ended abnormally"
        ),
    }
}

/// Reads frames from the peer and forwards chat to the hub.
pub async fn read_pump<S>(
    mut stream: S,
    hub: Arc<Hub>,
    handle: Arc<ConnectionHandle>,
    config: Arc<RelayConfig>,
) -> PumpExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = match time::timeout(config.idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => return PumpExit::IdleTimeout(config.idle_timeout),
        };

        let payload = match next {
            None | Some(Ok(Message::Close(_))) => return PumpExit::PeerClosed,
            Some(Err(err)) => return PumpExit::Transport(err),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(username = %handle.username, "dropping non-utf8 binary frame");
                    continue;
                }
            },
        };

        match config.wire_format.decode_inbound(&payload) {
            Some(content) => {
                hub.broadcast_message(RoomMessage::chat(&handle.room, &handle.username, content))
            }
            None => debug!(username = %handle.username, "dropping malformed or empty payload"),
        }
    }
}

/// Drains the member's queue to the peer, pinging it on every heartbeat.
pub async fn write_pump<S>(mut sink: S, mut outbox: Outbox, config: Arc<RelayConfig>) -> PumpExit
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut heartbeat = time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            next = outbox.recv() => {
                let Some(first) = next else {
                    let close = sink.send(Message::Close(None));
                    if let Err(exit) = with_deadline(config.write_timeout, close).await {
                        trace!(%exit, "close frame not delivered");
                    }
                    return PumpExit::SinkClosed;
                };

                let mut batch = vec![first];
                while batch.len() < config.send_queue_capacity {
                    match outbox.try_recv() {
                        Ok(message) => batch.push(message),
                        Err(_) => break,
                    }
                }

                if let Err(exit) = write_batch(&mut sink, &batch, &config).await {
                    return exit;
                }
            }
            _ = heartbeat.tick() => {
                let ping = sink.send(Message::Ping(Vec::new()));
                if let Err(exit) = with_deadline(config.write_timeout, ping).await {
                    return exit;
                }
            }
        }
    }
}

async fn write_batch<S>(
    sink: &mut S,
    batch: &[Arc<RoomMessage>],
    config: &RelayConfig,
) -> Result<(), PumpExit>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let frames = config.wire_format.encode_batch(batch)?;
    let write = async move {
        for frame in frames {
            sink.feed(Message::Text(frame)).await?;
        }
        sink.flush().await
    };
    with_deadline(config.write_timeout, write).await
}

async fn with_deadline<F>(deadline: Duration, write: F) -> Result<(), PumpExit>
where
    F: Future<Output = Result<(), axum::Error>>,
{
    match time::timeout(deadline, write).await {
        Ok(result) => result.map_err(PumpExit::from),
        Err(_) => Err(PumpExit::WriteTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use futures_util::stream;

    use super::*;
    use crate::wire::WireFormat;

    #[derive(Debug, Clone, PartialEq)]
    enum Written {
        Frame(Message),
        Flush,
    }

    /// Sink that accepts everything and records frames and flushes in order.
    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<Written>>>,
    }

    impl RecordingSink {
        fn written(&self) -> Vec<Written> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Sink<Message> for RecordingSink {
        type Error = axum::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), axum::Error> {
            self.log.lock().unwrap().push(Written::Frame(item));
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            self.log.lock().unwrap().push(Written::Flush);
            Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Peer that never drains: the sink is never ready.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), axum::Error> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), axum::Error>> {
            Poll::Pending
        }
    }

    fn text_of(written: &Written) -> &str {
        match written {
            Written::Frame(Message::Text(text)) => text.as_str(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[test]
    fn full_queue_reports_full() {
        let (handle, _outbox) = ConnectionHandle::new("alice", "general", 1);

        handle
            .try_deliver(Arc::new(RoomMessage::join("general", "alice")))
            .expect("first message fits");
        let second = handle.try_deliver(Arc::new(RoomMessage::join("general", "bob")));

        assert_eq!(second, Err(DeliveryError::Full));
    }

    #[tokio::test]
    async fn close_sink_ends_the_outbox() {
        let (handle, mut outbox) = ConnectionHandle::new("alice", "general", 4);
        handle
            .try_deliver(Arc::new(RoomMessage::chat("general", "bob", "hi")))
            .expect("deliver");

        handle.close_sink();
        handle.close_sink();

        assert_eq!(outbox.recv().await.map(|m| m.content.clone()), Some("hi".to_string()));
        assert!(outbox.recv().await.is_none());
        assert_eq!(
            handle.try_deliver(Arc::new(RoomMessage::leave("general", "bob"))),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn queued_messages_are_written_with_one_flush() {
        let config = Arc::new(RelayConfig::default());
        let (handle, outbox) = ConnectionHandle::new("alice", "general", 8);
        for content in ["one", "two", "three"] {
            handle
                .try_deliver(Arc::new(RoomMessage::chat("general", "bob", content)))
                .expect("deliver");
        }
        handle.close_sink();
        let sink = RecordingSink::default();

        let exit = write_pump(sink.clone(), outbox, config).await;

        assert!(matches!(exit, PumpExit::SinkClosed), "unexpected exit {exit:?}");
        let written = sink.written();
        assert_eq!(written.len(), 6, "unexpected writes {written:?}");
        let contents: Vec<String> = written[..3]
            .iter()
            .map(|frame| {
                serde_json::from_str::<RoomMessage>(text_of(frame))
                    .expect("json frame")
                    .content
            })
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(written[3], Written::Flush);
    }

    #[tokio::test]
    async fn text_batch_becomes_a_single_frame() {
        let config = Arc::new(RelayConfig {
            wire_format: WireFormat::Text,
            ..RelayConfig::default()
        });
        let (handle, outbox) = ConnectionHandle::new("alice", "general", 8);
        handle
            .try_deliver(Arc::new(RoomMessage::join("general", "bob")))
            .expect("deliver");
        handle
            .try_deliver(Arc::new(RoomMessage::chat("general", "bob", "hi")))
            .expect("deliver");
        handle.close_sink();
        let sink = RecordingSink::default();

        write_pump(sink.clone(), outbox, config).await;

        let written = sink.written();
        assert_eq!(text_of(&written[0]), "*** bob joined general\nbob: hi");
        assert_eq!(written[1], Written::Flush);
    }

    #[tokio::test]
    async fn closed_queue_sends_a_close_frame() {
        let config = Arc::new(RelayConfig::default());
        let (handle, outbox) = ConnectionHandle::new("alice", "general", 8);
        handle.close_sink();
        let sink = RecordingSink::default();

        let exit = write_pump(sink.clone(), outbox, config).await;

        assert!(matches!(exit, PumpExit::SinkClosed), "unexpected exit {exit:?}");
        assert_eq!(
            sink.written(),
            vec![Written::Frame(Message::Close(None)), Written::Flush]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_the_peer() {
        let config = Arc::new(RelayConfig::default());
        let (handle, outbox) = ConnectionHandle::new("alice", "general", 8);
        let sink = RecordingSink::default();
        let pump = tokio::spawn(write_pump(sink.clone(), outbox, Arc::clone(&config)));

        time::sleep(config.heartbeat_interval - Duration::from_secs(1)).await;
        assert!(sink.written().is_empty(), "no ping before the first interval");

        time::sleep(config.heartbeat_interval * 2).await;
        let pings = sink
            .written()
            .iter()
            .filter(|written| matches!(written, Written::Frame(Message::Ping(_))))
            .count();
        assert_eq!(pings, 2);

        handle.close_sink();
        let exit = pump.await.expect("pump task");
        assert!(matches!(exit, PumpExit::SinkClosed), "unexpected exit {exit:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_hits_the_write_deadline() {
        let config = Arc::new(RelayConfig::default());
        let (handle, outbox) = ConnectionHandle::new("alice", "general", 8);
        handle
            .try_deliver(Arc::new(RoomMessage::chat("general", "bob", "hi")))
            .expect("deliver");

        let started = Instant::now();
        let exit = write_pump(StalledSink, outbox, Arc::clone(&config)).await;

        match exit {
            PumpExit::WriteTimeout(deadline) => assert_eq!(deadline, config.write_timeout),
            other => panic!("expected a write timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= config.write_timeout);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_a_quiet_peer_alive() {
        let config = Arc::new(RelayConfig::default());
        let hub = Arc::new(Hub::new());
        let (handle, _outbox) = ConnectionHandle::new("alice", "general", 8);

        // Five pongs, 20 s apart, then a clean close: well past the idle timeout.
        let pongs = Box::pin(stream::unfold(0u32, |sent| async move {
            if sent == 5 {
                return None;
            }
            time::sleep(Duration::from_secs(20)).await;
            Some((Ok::<_, axum::Error>(Message::Pong(Vec::new())), sent + 1))
        }));

        let started = Instant::now();
        let exit = read_pump(pongs, hub, handle, Arc::clone(&config)).await;

        assert!(matches!(exit, PumpExit::PeerClosed), "unexpected exit {exit:?}");
        assert!(started.elapsed() > config.idle_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_the_idle_timeout() {
        let config = Arc::new(RelayConfig::default());
        let hub = Arc::new(Hub::new());
        let (handle, _outbox) = ConnectionHandle::new("alice", "general", 8);
        let silence = stream::pending::<Result<Message, axum::Error>>();

        let exit = read_pump(silence, hub, handle, Arc::clone(&config)).await;

        match exit {
            PumpExit::IdleTimeout(window) => assert_eq!(window, config.idle_timeout),
            other => panic!("expected an idle timeout, got {other:?}"),
        }
    }
}
