//! Broker session lifecycle.
//!
//! One session exists per logged in identity. It owns the broker connection
//! and the [`SyncEngine`] holding that identity's state, and runs in its own
//! tokio task so every inbound message and every outbound command is handled
//! to completion before the next one.
//!
//! # Lifecycle (compile-time, via statum)
//!
//! ```text
//! Created ──► Running ──► TornDown
//! ```
//!
//! # Connection state (runtime, published through a watch channel)
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Reconnecting ──► Connected
//!                      │              │              │
//!                      └──────────────┴──────────────┴──► ConnectionError
//! ```
//!
//! On every `Connected` transition the fixed subscription set is issued again
//! and a deferred self-registration, if any, is published. `ConnectionError`
//! ends the session task; retrying is left to the caller.

use super::config::MqttConfig;
use super::engine::{SessionSnapshot, SyncEngine};
use super::SessionError;
use crate::command::{CommandBuilder, Identity, OutboundMessage, RegisterRequest};
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    StateError, SubscribeFilter, SubscribeReasonCode,
};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for flushing the DISCONNECT packet during teardown.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ConnectionError,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::ConnectionError => write!(f, "Connection Error"),
        }
    }
}

/// Transport observations that drive [`ConnectionState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    ConnAck,
    /// Broker sent DISCONNECT
    Disconnect,
    /// Network level failure the transport can recover from by reconnecting
    Transient,
    /// Refused connection or protocol violation
    Fatal,
}

impl ConnectionState {
    pub fn on(self, event: TransportEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::ConnectionError, _) => ConnectionState::ConnectionError,
            (_, TransportEvent::ConnAck) => ConnectionState::Connected,
            (_, TransportEvent::Disconnect) => ConnectionState::Disconnected,
            (_, TransportEvent::Fatal) => ConnectionState::ConnectionError,
            // never reached the broker in the first place
            (ConnectionState::Connecting, TransportEvent::Transient) => {
                ConnectionState::ConnectionError
            }
            (_, TransportEvent::Transient) => ConnectionState::Reconnecting,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::ConnectionError
    }
}

fn classify(error: &ConnectionError) -> TransportEvent {
    match error {
        ConnectionError::Io(_)
        | ConnectionError::NetworkTimeout
        | ConnectionError::FlushTimeout
        | ConnectionError::MqttState(StateError::Io(_))
        | ConnectionError::MqttState(StateError::AwaitPingResp) => TransportEvent::Transient,
        _ => TransportEvent::Fatal,
    }
}

/// Requests handled inside the session task.
#[derive(Debug)]
pub enum SessionCommand {
    RegisterDevice {
        request: RegisterRequest,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    UnregisterDevice {
        device_id: String,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    ToggleStatus {
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<SessionSnapshot>,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Created,
    Running,
    TornDown,
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    identity: Identity,
    engine: SyncEngine,
    client: AsyncClient,
    eventloop: EventLoop,
    commands: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    connection_state: ConnectionState,
    pending_self_registration: bool,
    reconnect_delay: Duration,
}

impl<S: SessionState> BrokerSession<S> {
    pub fn user_id(&self) -> &str {
        self.identity.user_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    fn set_connection_state(&mut self, next: ConnectionState) {
        if next != self.connection_state {
            info!(
                "MQTT connection status for user {}: {}",
                self.identity.user_id(),
                next
            );
            self.connection_state = next;
            self.state_tx.send_replace(next);
        }
    }
}

impl BrokerSession<Created> {
    pub fn create(
        identity: Identity,
        config: &MqttConfig,
        register_self: bool,
        commands: mpsc::Receiver<SessionCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Result<Self, SessionError> {
        let engine = SyncEngine::new(identity.user_id(), &config.topics)?;

        let mut mqtt_options =
            MqttOptions::new(identity.user_id().to_string(), config.host.clone(), config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true);
        let (client, eventloop) = AsyncClient::new(mqtt_options, config.request_capacity);

        debug!(
            "Created session for user {} against {}:{}",
            identity.user_id(),
            config.host,
            config.port
        );

        Ok(Self::new(
            identity,
            engine,
            client,
            eventloop,
            commands,
            state_tx,
            ConnectionState::Disconnected,
            register_self,
            config.reconnect_delay(),
        ))
    }

    /// The connection is established lazily by the first poll in `run`.
    pub fn connect(mut self) -> BrokerSession<Running> {
        self.set_connection_state(ConnectionState::Connecting);
        self.transition()
    }
}

impl BrokerSession<Running> {
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> BrokerSession<TornDown> {
        info!("Starting broker session for user {}", self.user_id());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested for user {}", self.user_id());
                    break;
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }

                event = self.eventloop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(e) => {
                            let transport_event = classify(&e);
                            let next = self.connection_state.on(transport_event);
                            if next.is_terminal() {
                                error!("MQTT connection error: {}", e);
                            } else {
                                warn!("MQTT connection lost: {}", e);
                            }
                            self.set_connection_state(next);
                            if next.is_terminal() {
                                break;
                            }

                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                }
            }
        }

        self.close().await;
        self.transition()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.set_connection_state(self.connection_state.on(TransportEvent::ConnAck));
                self.subscribe();
                self.flush_self_registration();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let update = self
                    .engine
                    .handle_message(&publish.topic, &publish.payload, Utc::now());
                if let Some(update) = update {
                    debug!("Applied {:?}", update);
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Broker rejected a subscription (packet {})", ack.pkid);
                } else {
                    debug!("Subscriptions acknowledged (packet {})", ack.pkid);
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                debug!("Delivery confirmed for packet {}", comp.pkid);
            }
            Event::Incoming(Packet::Disconnect) => {
                self.set_connection_state(self.connection_state.on(TransportEvent::Disconnect));
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                debug!("Publish sent as packet {}", pkid);
            }
            _ => {}
        }
    }

    fn subscribe(&mut self) {
        let filters: Vec<SubscribeFilter> = self
            .engine
            .subscription_filters()
            .map(|filter| SubscribeFilter::new(filter.to_string(), QoS::ExactlyOnce))
            .collect();

        let count = filters.len();
        match self.client.try_subscribe_many(filters) {
            Ok(()) => debug!("Requested {} subscriptions", count),
            Err(e) => error!("Failed to subscribe: {}", e),
        }
    }

    /// Publishes the deferred self-registration. It stays pending when the
    /// request queue is full and is tried again on the next connect.
    fn flush_self_registration(&mut self) {
        if !self.pending_self_registration {
            return;
        }

        let command = match CommandBuilder::new(&self.identity).register_self(Utc::now()) {
            Ok(command) => command,
            Err(e) => {
                error!("Cannot register dummy device: {}", e);
                self.pending_self_registration = false;
                return;
            }
        };

        let outbound = match command.into_outbound() {
            Ok(outbound) => outbound,
            Err(e) => {
                error!("Cannot register dummy device: {}", e);
                self.pending_self_registration = false;
                return;
            }
        };

        match self.publish(outbound) {
            Ok(()) => {
                info!("Registered dummy device for user {}", self.user_id());
                self.pending_self_registration = false;
            }
            Err(e) => warn!("Dummy device registration deferred: {}", e),
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::RegisterDevice {
                request,
                response_tx,
            } => {
                let result = self.register_device(&request);
                respond(response_tx, result);
            }
            SessionCommand::UnregisterDevice {
                device_id,
                response_tx,
            } => {
                let result = self.unregister_device(&device_id);
                respond(response_tx, result);
            }
            SessionCommand::ToggleStatus { response_tx } => {
                let result = match self.engine.status_toggle() {
                    Ok(outbound) => self.publish(outbound),
                    Err(e) => Err(e),
                };
                respond(response_tx, result);
            }
            SessionCommand::Snapshot { response_tx } => {
                respond(response_tx, self.engine.snapshot());
            }
        }
    }

    fn register_device(&mut self, request: &RegisterRequest) -> Result<(), SessionError> {
        let outbound = CommandBuilder::new(&self.identity)
            .register_device(request, Utc::now())?
            .into_outbound()?;
        self.publish(outbound)
    }

    fn unregister_device(&mut self, device_id: &str) -> Result<(), SessionError> {
        let outbound = self
            .engine
            .unregister_command(&self.identity, device_id, Utc::now())?
            .into_outbound()?;
        self.publish(outbound)
    }

    /// Queues the message for the transport at QoS 2. Completion is reported
    /// asynchronously as PUBCOMP; there is no retry here.
    ///
    /// Never waits for queue space: the queue only drains while this task
    /// polls the event loop, so a full queue is reported as an error.
    fn publish(&mut self, message: OutboundMessage) -> Result<(), SessionError> {
        let topic = message.topic.clone();
        self.client
            .try_publish(message.topic, QoS::ExactlyOnce, false, message.payload)
            .map_err(|e| {
                error!("Failed to publish to topic {}: {}", topic, e);
                SessionError::Publish(e)
            })
    }

    async fn close(&mut self) {
        if self.connection_state.is_terminal() {
            return;
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }

        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Timed out flushing disconnect for user {}", self.user_id());
        }

        self.set_connection_state(ConnectionState::Disconnected);
    }
}

impl BrokerSession<TornDown> {
    /// Final state of the connection when the session ended.
    pub fn final_state(&self) -> ConnectionState {
        self.connection_state
    }
}

fn respond<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        warn!("Session command caller went away before the response");
    }
}

/// Handle for a session running in a tokio task.
///
/// Dropping the handle cancels the session; [`SessionHandle::shutdown`]
/// additionally waits until the connection has been released.
#[derive(Debug)]
pub struct SessionHandle {
    user_id: String,
    commands: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task_handle: Option<JoinHandle<ConnectionState>>,
}

impl SessionHandle {
    /// Creates the session for `identity` and starts it in a background task.
    ///
    /// With `register_self` the dummy device is registered as soon as the
    /// first connection is up.
    pub fn spawn(
        identity: Identity,
        config: &MqttConfig,
        register_self: bool,
    ) -> Result<Self, SessionError> {
        let user_id = identity.user_id().to_string();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let session =
            BrokerSession::create(identity, config, register_self, commands_rx, state_tx)?.connect();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task_handle = tokio::spawn(async move {
            let torn_down = session.run_until_shutdown(token).await;
            torn_down.final_state()
        });

        info!("Session started for user {}", user_id);
        Ok(Self {
            user_id,
            commands: commands_tx,
            state_rx,
            shutdown,
            task_handle: Some(task_handle),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn register_device(&self, request: RegisterRequest) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::RegisterDevice {
            request,
            response_tx,
        })
        .await?
    }

    pub async fn unregister_device(&self, device_id: &str) -> Result<(), SessionError> {
        let device_id = device_id.to_string();
        self.request(|response_tx| SessionCommand::UnregisterDevice {
            device_id,
            response_tx,
        })
        .await?
    }

    pub async fn toggle_status(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::ToggleStatus { response_tx })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|response_tx| SessionCommand::Snapshot { response_tx })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(build(response_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        response_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Cancels the session and waits until its connection is released.
    /// Calling it again is a no-op.
    pub async fn shutdown(&mut self) -> Result<ConnectionState, SessionError> {
        debug!("Sending shutdown signal to session: {}", self.user_id);
        self.shutdown.cancel();

        match self.task_handle.take() {
            Some(handle) => match handle.await {
                Ok(final_state) => {
                    info!("Session ended for user {} ({})", self.user_id, final_state);
                    Ok(final_state)
                }
                Err(e) => {
                    error!("Session task panicked: {} - {}", self.user_id, e);
                    Err(SessionError::Task(e.to_string()))
                }
            },
            None => {
                debug!("Session already shut down: {}", self.user_id);
                Ok(self.connection_state())
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
