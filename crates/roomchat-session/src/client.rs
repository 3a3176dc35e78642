//! Chat client driving a session over a transport.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use roomchat_core::{
    ChannelCallbacks, ConfigError, Connection, ConnectionState, MessageId, OutboundFrame,
    Session, SessionAction, SessionCallbacks, SessionConfig, SessionEvent, Transport,
    TransportError, TransportEvent, TransportEvents,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Session events as a stream.
pub type EventStream = UnboundedReceiverStream<SessionEvent>;

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Session closed")]
    SessionClosed,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Observable client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Messages awaiting acknowledgment.
    pub pending: usize,
    /// Reconnect attempts since the last successful handshake.
    pub attempts: u32,
}

enum Command {
    Send {
        message: String,
        recipient_id: String,
        reply: oneshot::Sender<MessageId>,
    },
    Typing(bool),
    Open,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a chat session running on its own task.
///
/// All session state lives on that task; the handle only queues commands.
/// Dropping every handle tears the session down.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Start a session and begin connecting.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn spawn<T, C>(config: SessionConfig, transport: T, callbacks: C) -> Result<Self, ClientError>
    where
        T: Transport,
        C: SessionCallbacks,
    {
        config.validate()?;
        let session = Session::new(config);
        let (status_tx, status) = watch::channel(ClientStatus {
            state: session.state(),
            pending: 0,
            attempts: 0,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            session,
            transport: Arc::new(transport),
            callbacks,
            connection: None,
            events: None,
            connecting: None,
            reconnect_at: None,
            status: status_tx,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Ok(Self {
            commands,
            status,
            task,
        })
    }

    /// Start a session whose events are delivered as a stream.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn spawn_with_events<T>(
        config: SessionConfig,
        transport: T,
    ) -> Result<(Self, EventStream), ClientError>
    where
        T: Transport,
    {
        let (callbacks, rx) = ChannelCallbacks::new();
        let client = Self::spawn(config, transport, callbacks)?;
        Ok((client, UnboundedReceiverStream::new(rx)))
    }

    /// Queue a chat message for at-least-once delivery.
    ///
    /// Returns as soon as the message is pending; it is transmitted now if
    /// connected, otherwise on the next successful connection.
    ///
    /// # Errors
    /// Returns [`ClientError::SessionClosed`] after shutdown.
    pub async fn send(
        &self,
        message: impl Into<String>,
        recipient_id: impl Into<String>,
    ) -> Result<MessageId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                message: message.into(),
                recipient_id: recipient_id.into(),
                reply,
            })
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    /// Publish the local typing state. Dropped unless connected.
    pub fn set_typing(&self, is_typing: bool) {
        if self.commands.send(Command::Typing(is_typing)).is_err() {
            tracing::debug!("Typing state after shutdown ignored");
        }
    }

    /// Connect now, or re-flush pending messages if already connected.
    pub fn open(&self) {
        if self.commands.send(Command::Open).is_err() {
            tracing::debug!("Open after shutdown ignored");
        }
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.status().pending
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Tear the session down: cancel any reconnect, close the transport and
    /// discard pending messages. No callbacks fire afterwards.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the session task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

type ConnectFuture<C> = BoxFuture<'static, Result<(C, TransportEvents), TransportError>>;

struct Driver<T: Transport, C> {
    session: Session,
    transport: Arc<T>,
    callbacks: C,
    connection: Option<T::Connection>,
    events: Option<TransportEvents>,
    connecting: Option<ConnectFuture<T::Connection>>,
    reconnect_at: Option<Instant>,
    status: watch::Sender<ClientStatus>,
}

impl<T, C> Driver<T, C>
where
    T: Transport,
    C: SessionCallbacks,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let actions = self.session.open();
        self.execute(actions);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if let Err(done) = self.handle_command(command) {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                }
                result = next_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.handle_connect(result);
                }
                event = next_event(&mut self.events) => self.handle_event(event),
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let actions = self.session.reconnect_due();
                    self.execute(actions);
                }
            }
        }
        tracing::debug!(room = %self.session.config().room, "Session task exiting");
    }

    /// Apply a command, or hand back the reply channel of a shutdown request.
    fn handle_command(&mut self, command: Command) -> Result<(), oneshot::Sender<()>> {
        let actions = match command {
            Command::Send {
                message,
                recipient_id,
                reply,
            } => {
                let (id, actions) = self.session.send(message, recipient_id);
                let _ = reply.send(id);
                actions
            }
            Command::Typing(is_typing) => self.session.set_typing(is_typing),
            Command::Open => self.session.open(),
            Command::Shutdown(done) => return Err(done),
        };
        self.execute(actions);
        Ok(())
    }

    fn handle_connect(&mut self, result: Result<(T::Connection, TransportEvents), TransportError>) {
        match result {
            Ok((mut connection, events)) => {
                if self.session.state() != ConnectionState::Connecting {
                    connection.close();
                    return;
                }
                self.connection = Some(connection);
                self.events = Some(events);
                let actions = self.session.handle_open();
                self.execute(actions);
            }
            Err(e) => {
                let actions = self.session.handle_transport_failure(&e);
                self.execute(actions);
            }
        }
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        let actions = match event {
            Some(TransportEvent::Message(raw)) => {
                tracing::debug!(bytes = raw.len(), "Frame received");
                self.session.handle_frame(&raw)
            }
            Some(TransportEvent::Error(reason)) => {
                self.drop_connection();
                self.session
                    .handle_transport_failure(&TransportError::Failed(reason))
            }
            Some(TransportEvent::Closed { code }) => {
                self.drop_connection();
                self.session.handle_close(code)
            }
            None => {
                self.drop_connection();
                self.session.handle_close(None)
            }
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Connect { url } => self.start_connect(url),
                SessionAction::Transmit(frame) => {
                    if let Err(e) = self.transmit(&frame) {
                        // Frames queued behind the failed one belong to the dead connection.
                        queue.retain(|a| !matches!(a, SessionAction::Transmit(_)));
                        self.drop_connection();
                        queue.extend(self.session.handle_transport_failure(&e));
                    }
                }
                SessionAction::ScheduleReconnect { delay } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                SessionAction::CancelReconnect => self.reconnect_at = None,
                SessionAction::CloseTransport => {
                    self.connecting = None;
                    self.drop_connection();
                }
                SessionAction::Notify(event) => self.callbacks.dispatch(event),
            }
        }
        self.publish_status();
    }

    fn transmit(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize frame: {e}");
                return Ok(());
            }
        };
        let connection = self
            .connection
            .as_mut()
            .filter(|c| c.is_open())
            .ok_or(TransportError::Closed)?;
        tracing::debug!(frame = %text, "Sending frame");
        connection.send(text)
    }

    fn start_connect(&mut self, url: String) {
        self.drop_connection();
        tracing::info!(%url, "Connecting");
        let transport = Arc::clone(&self.transport);
        self.connecting = Some(Box::pin(async move { transport.open(&url).await }));
    }

    fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.events = None;
    }

    fn shutdown(&mut self) {
        let actions = self.session.teardown();
        self.execute(actions);
        self.connecting = None;
    }

    fn publish_status(&self) {
        let status = ClientStatus {
            state: self.session.state(),
            pending: self.session.pending().len(),
            attempts: self.session.attempts(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn next_connect<C>(
    connecting: &mut Option<ConnectFuture<C>>,
) -> Result<(C, TransportEvents), TransportError> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Upper bound on how long a host should wait for a reconnect cycle.
#[must_use]
pub fn reconnect_horizon(config: &SessionConfig) -> Duration {
    (1..=config.reconnect.max_attempts)
        .map(|attempt| config.reconnect.delay_for(attempt))
        .sum()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;
    use roomchat_core::{ChatEvent, ReconnectPolicy};
    use roomchat_transport::{MemoryServer, MemoryTransport};
    use serde_json::{Value, json};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<SessionEvent>>>,
        acked_before_render: Arc<Mutex<Vec<bool>>>,
        server: Option<MemoryServer>,
    }

    impl Recorder {
        fn watching(server: &MemoryServer) -> Self {
            Self {
                server: Some(server.clone()),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| !matches!(e, SessionEvent::StateChanged(_)))
                .cloned()
                .collect()
        }

        fn count(&self, wanted: &SessionEvent) -> usize {
            self.events().iter().filter(|e| *e == wanted).count()
        }
    }

    impl SessionCallbacks for Recorder {
        fn on_message(&mut self, event: &ChatEvent) {
            if let Some(server) = &self.server {
                let acked = server.sent_json().iter().any(|f| {
                    f["type"] == "message_delivered" && f["message_id"] == event.message_id.as_str()
                });
                self.acked_before_render.lock().unwrap().push(acked);
            }
        }

        fn dispatch(&mut self, event: SessionEvent) {
            self.events.lock().unwrap().push(event.clone());
            if let SessionEvent::Message(chat) = &event {
                self.on_message(chat);
            }
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new("ws://chat.test", "lobby").with_current_user("1")
    }

    /// Let the session task run until idle without reaching any reconnect deadline.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn past_reconnect_delay() {
        tokio::time::sleep(Duration::from_millis(2_100)).await;
    }

    fn chats(server: &MemoryServer) -> Vec<Value> {
        server
            .sent_json()
            .into_iter()
            .filter(|f| f["type"] == "chat_message")
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_then_flush_on_open() {
        let (transport, server) = MemoryTransport::new();
        server.refuse_next(1);
        let recorder = Recorder::default();
        let client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting(1));

        let id = tokio_test::assert_ok!(client.send("hi", "42").await);
        settle().await;
        assert!(server.sent().is_empty());
        assert_eq!(recorder.events(), vec![SessionEvent::Sent(id.clone())]);
        assert_eq!(client.pending_count(), 1);

        past_reconnect_delay().await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(
            server.sent_json(),
            vec![json!({
                "type": "chat_message",
                "message_id": id.as_str(),
                "message": "hi",
                "recipient_id": "42",
            })]
        );
        assert_eq!(server.urls()[0], "ws://chat.test/ws/chat/lobby/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_queue_retransmitted_in_order() {
        let (transport, server) = MemoryTransport::new();
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;

        server.disconnect(Some(1006));
        settle().await;
        let mut ids = Vec::new();
        for text in ["first", "second", "third"] {
            ids.push(client.send(text, "42").await.unwrap());
        }
        settle().await;
        assert!(server.sent().is_empty());

        past_reconnect_delay().await;
        let order: Vec<_> = server
            .sent_on(1)
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["message_id"].clone())
            .collect();
        let expected: Vec<Value> = ids.iter().map(|id| json!(id.as_str())).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silently_dropped_connection_detected_on_send() {
        let (transport, server) = MemoryTransport::new();
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Open);

        assert!(server.sever());
        let id = client.send("hi", "42").await.unwrap();
        settle().await;
        assert!(server.sent_on(0).is_empty());
        assert_eq!(client.state(), ConnectionState::Reconnecting(1));
        assert_eq!(client.pending_count(), 1);

        past_reconnect_delay().await;
        assert_eq!(client.state(), ConnectionState::Open);
        let resent: Vec<Value> = server
            .sent_on(1)
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(resent[0]["message_id"], id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_ack_fires_once() {
        let (transport, server) = MemoryTransport::new();
        let recorder = Recorder::default();
        let client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;

        let id = client.send("hi", "42").await.unwrap();
        let ack = json!({"type": "message_delivered", "message_id": id.as_str()});
        server.push_json(&ack);
        server.push_json(&ack);
        settle().await;

        assert_eq!(recorder.count(&SessionEvent::Delivered(id)), 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ack_changes_nothing() {
        let (transport, server) = MemoryTransport::new();
        let recorder = Recorder::default();
        let client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;
        client.send("hi", "42").await.unwrap();
        settle().await;
        let before = recorder.events();

        server.push(r#"{"type":"message_delivered","message_id":"X"}"#);
        settle().await;
        assert_eq!(recorder.events(), before);
        assert_eq!(client.pending_count(), 1);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_chat_acked_before_render() {
        let (transport, server) = MemoryTransport::new();
        let recorder = Recorder::watching(&server);
        let _client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;

        server.push_json(&json!({
            "type": "chat_message",
            "message_id": 77,
            "message": "hello",
            "sender_id": 1,
            "timestamp": "2024-05-01T10:00:00Z",
        }));
        settle().await;

        assert_eq!(*recorder.acked_before_render.lock().unwrap(), vec![true]);
        let SessionEvent::Message(chat) = &recorder.events()[0] else {
            panic!("expected chat message");
        };
        assert_eq!(chat.direction, roomchat_core::Direction::Sent);
        assert_eq!(
            server.sent_json(),
            vec![json!({"type": "message_delivered", "message_id": "77"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_bounded() {
        let (transport, server) = MemoryTransport::new();
        let recorder = Recorder::default();
        let client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;
        assert_eq!(server.open_attempts(), 1);

        server.refuse_all(true);
        server.disconnect(None);
        for attempt in 1..=5 {
            settle().await;
            assert_eq!(recorder.count(&SessionEvent::ConnectionLost), 0);
            past_reconnect_delay().await;
            assert_eq!(server.open_attempts(), 1 + attempt);
        }
        settle().await;
        assert_eq!(recorder.count(&SessionEvent::ConnectionLost), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        client.open();
        settle().await;
        assert_eq!(server.open_attempts(), 6);
        assert_eq!(recorder.count(&SessionEvent::ConnectionLost), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_drives_reconnect() {
        let (transport, server) = MemoryTransport::new();
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;

        server.fail_sends(true);
        let id = client.send("retry me", "42").await.unwrap();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting(1));
        assert!(!server.is_connected());

        server.fail_sends(false);
        past_reconnect_delay().await;
        let chats = chats(&server);
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["message_id"], id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_treated_as_close() {
        let (transport, server) = MemoryTransport::new();
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;

        server.fail("reset by peer");
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting(1));
        past_reconnect_delay().await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.status().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_when_open_reflushes_unacked_only() {
        let (transport, server) = MemoryTransport::new();
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;

        let acked = client.send("a", "42").await.unwrap();
        let kept = client.send("b", "42").await.unwrap();
        server.push_json(&json!({"type": "message_delivered", "message_id": acked.as_str()}));
        settle().await;
        server.clear_sent();

        client.open();
        settle().await;
        let chats = chats(&server);
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["message_id"], kept.as_str());
        assert_eq!(server.open_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_only_when_open() {
        let (transport, server) = MemoryTransport::new();
        server.refuse_next(1);
        let client = ChatClient::spawn(config(), transport, Recorder::default()).unwrap();
        settle().await;

        client.set_typing(true);
        settle().await;
        assert!(server.sent().is_empty());

        past_reconnect_delay().await;
        client.set_typing(false);
        settle().await;
        assert_eq!(
            server.sent_json(),
            vec![json!({"type": "typing", "is_typing": false})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_reconnect_and_silences_callbacks() {
        let (transport, server) = MemoryTransport::new();
        let recorder = Recorder::default();
        let client = ChatClient::spawn(config(), transport, recorder.clone()).unwrap();
        settle().await;
        client.send("unacked", "42").await.unwrap();
        server.disconnect(None);
        settle().await;
        let before = recorder.events().len();

        client.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.open_attempts(), 1);
        assert!(!server.push("{}"));
        assert_eq!(recorder.events().len(), before);
        assert!(client.is_finished());
        assert!(matches!(
            client.send("late", "42").await,
            Err(ClientError::SessionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream() {
        let (transport, server) = MemoryTransport::new();
        let (client, mut events) = ChatClient::spawn_with_events(config(), transport).unwrap();

        assert_eq!(
            events.next().await,
            Some(SessionEvent::StateChanged(ConnectionState::Connecting))
        );
        assert_eq!(
            events.next().await,
            Some(SessionEvent::StateChanged(ConnectionState::Open))
        );

        server.push(r#"{"type":"typing","user":"ada","is_typing":true}"#);
        let Some(SessionEvent::Typing(typing)) = events.next().await else {
            panic!("expected typing event");
        };
        assert!(typing.is_typing);

        drop(client);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (transport, _server) = MemoryTransport::new();
        let result = ChatClient::spawn(
            SessionConfig::new("ws://chat.test", ""),
            transport,
            Recorder::default(),
        );
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_reconnect_horizon() {
        let cfg = config().with_reconnect(ReconnectPolicy::fixed(Duration::from_secs(2), 5));
        assert_eq!(reconnect_horizon(&cfg), Duration::from_secs(10));
    }
}
