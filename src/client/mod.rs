//! Broker Connection Manager
//!
//! Maintains one MQTT v3.1.1 connection to the broker. All socket I/O is
//! owned by a single connection task; the [`BrokerClient`] handle talks to
//! it over a channel and can be shared freely between tasks.
//!
//! The task connects, resubscribes every live filter after each CONNACK,
//! keeps the connection alive with PINGREQ, and reconnects with
//! exponential backoff when the connection is lost.

mod error;
mod hooks;
mod state;
mod subscription;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe,
    SubscribeReturnCode, SubscribeTopic, Unsubscribe,
};
use crate::topic::{validate_topic_filter, validate_topic_name};

pub use error::ClientError;
pub use hooks::{
    ConnectHook, ConnectionHooks, ConnectionLostHook, ReconnectingHook, UnhandledHook,
};
pub use state::ConnectionState;
pub use subscription::{InboundMessage, Subscription};

use subscription::SubscriptionTable;

/// Capacity of the command channel feeding the connection task
const COMMAND_QUEUE: usize = 1000;

/// Publish/subscribe operations the bridges depend on
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` on `topic`
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ClientError>;

    /// Subscribe to `filter`, returning the stream of matching messages
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, ClientError>;
}

/// Operation sent to the connection task
#[derive(Debug)]
enum Command {
    Publish {
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

impl Command {
    /// Answer a command that arrived while no connection is up
    fn reject(self) {
        match self {
            Command::Publish { done, .. } => {
                let _ = done.send(Err(ClientError::NotConnected));
            }
            Command::Disconnect { done } => {
                let _ = done.send(());
            }
            // Picked up from the subscription table on the next CONNACK
            Command::Subscribe { .. } | Command::Unsubscribe { .. } => {}
        }
    }
}

/// State shared between the handle and the connection task
struct Shared {
    config: BrokerConfig,
    hooks: ConnectionHooks,
    state: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionTable,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Broker connection: {} -> {}", previous, state);
        }
    }
}

/// Handle to the broker connection
pub struct BrokerClient {
    shared: Arc<Shared>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig, hooks: ConnectionHooks) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                hooks,
                state,
                subscriptions: SubscriptionTable::default(),
            }),
            command_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start the connection task and wait for the first attempt to resolve.
    ///
    /// With `connect_retry` enabled a failed first attempt is logged and the
    /// task keeps trying in the background; otherwise the error is returned
    /// and the task stops. Does nothing if the task is already running.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let first_attempt = {
            let mut task = self.task.lock();
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return Ok(());
            }

            let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
            let (first_tx, first_rx) = oneshot::channel();
            *self.command_tx.lock() = Some(command_tx);
            *task = Some(tokio::spawn(connection_loop(
                self.shared.clone(),
                command_rx,
                first_tx,
            )));
            first_rx
        };

        first_attempt.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Gracefully close the connection.
    ///
    /// Commands already queued are written, in-flight QoS 1/2 publishes get
    /// a chance to be acknowledged and DISCONNECT is sent, all within
    /// `timeout`. The connection task is torn down afterwards regardless.
    pub async fn disconnect(&self, timeout_after: Duration) {
        let command_tx = self.command_tx.lock().take();
        let task = self.task.lock().take();

        let Some(task) = task else {
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        };

        if let Some(command_tx) = command_tx {
            if self.state().is_connected() {
                let (done, finished) = oneshot::channel();
                let graceful = async {
                    if command_tx.send(Command::Disconnect { done }).await.is_ok() {
                        let _ = finished.await;
                    }
                };
                if timeout(timeout_after, graceful).await.is_err() {
                    warn!(
                        "Graceful disconnect did not finish within {:?}",
                        timeout_after
                    );
                }
            }
        }

        task.abort();
        let _ = task.await;
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected from broker");
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        validate_topic_name(topic)
            .map_err(|e| ClientError::InvalidTopic(format!("'{}': {}", topic, e)))?;

        let size = publish_remaining_length(topic, qos, payload.len());
        let max = self.shared.config.max_packet_size;
        if size > max {
            return Err(ClientError::PacketTooLarge { size, max });
        }

        if !self.state().is_connected() {
            return Err(ClientError::NotConnected);
        }
        let command_tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let (done, result) = oneshot::channel();
        command_tx
            .send(Command::Publish {
                topic: Arc::from(topic),
                payload,
                qos,
                retain,
                done,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;

        result.await.unwrap_or(Err(ClientError::NotConnected))
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, ClientError> {
        validate_topic_filter(filter)
            .map_err(|e| ClientError::InvalidTopic(format!("'{}': {}", filter, e)))?;

        let subscription = self.shared.subscriptions.insert(filter, qos);
        self.send_if_running(Command::Subscribe {
            filter: filter.to_string(),
            qos,
        })
        .await;
        Ok(subscription)
    }

    /// Stop delivery for `filter` and unsubscribe at the broker
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), ClientError> {
        validate_topic_filter(filter)
            .map_err(|e| ClientError::InvalidTopic(format!("'{}': {}", filter, e)))?;

        if self.shared.subscriptions.remove(filter) {
            self.send_if_running(Command::Unsubscribe {
                filter: filter.to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn send_if_running(&self, command: Command) {
        if !self.state().is_connected() {
            return;
        }
        let command_tx = self.command_tx.lock().clone();
        if let Some(command_tx) = command_tx {
            let _ = command_tx.send(command).await;
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl PubSub for BrokerClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        BrokerClient::publish(self, topic, qos, retain, payload).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, ClientError> {
        BrokerClient::subscribe(self, filter, qos).await
    }
}

/// Remaining length of a PUBLISH: topic string, packet id for QoS > 0, payload
fn publish_remaining_length(topic: &str, qos: QoS, payload_len: usize) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    2 + topic.len() + packet_id + payload_len
}

/// Decoder bounded by the same limit outgoing publishes are held to
fn decoder_for(config: &BrokerConfig) -> Decoder {
    Decoder::new().with_max_packet_size(config.max_packet_size)
}

/// Why a connected session ended
enum SessionEnd {
    /// Disconnect requested or the handle went away
    Closed,
    /// Connection dropped
    Lost(ClientError),
}

/// Run the connection loop until disconnect or a terminal failure
async fn connection_loop(
    shared: Arc<Shared>,
    mut command_rx: mpsc::Receiver<Command>,
    first_attempt: oneshot::Sender<Result<(), ClientError>>,
) {
    let config = &shared.config;
    let mut first_attempt = Some(first_attempt);
    let mut reconnecting = false;
    let mut retry_interval = config.reconnect_interval;

    loop {
        if reconnecting {
            (shared.hooks.on_reconnecting)();
        }
        shared.set_state(ConnectionState::Connecting);
        debug!("Connecting to broker at {}", config.address);

        let delay = match establish(config).await {
            Ok(connection) => {
                retry_interval = config.reconnect_interval;
                shared.set_state(ConnectionState::Connected);
                (shared.hooks.on_connect)();
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(Ok(()));
                }

                match run_session(&shared, connection, &mut command_rx).await {
                    SessionEnd::Closed => {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Lost(err) => {
                        error!("Broker connection lost: {}", err);
                        (shared.hooks.on_connection_lost)(&err);
                        if !config.auto_reconnect {
                            shared.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        reconnecting = true;
                        config.reconnect_interval
                    }
                }
            }
            Err(err) if reconnecting => {
                warn!("Reconnect to {} failed: {}", config.address, err);
                retry_interval = std::cmp::min(retry_interval * 2, config.max_reconnect_interval);
                retry_interval
            }
            Err(err) => {
                if let Some(tx) = first_attempt.take() {
                    if !config.connect_retry {
                        shared.set_state(ConnectionState::Disconnected);
                        let _ = tx.send(Err(err));
                        return;
                    }
                    let _ = tx.send(Ok(()));
                }
                warn!(
                    "Connection to {} failed: {}, retrying in {:?}",
                    config.address, err, config.connect_retry_interval
                );
                config.connect_retry_interval
            }
        };

        shared.set_state(ConnectionState::ReconnectPending);
        debug!("Next connection attempt in {:?}", delay);
        if wait_for_retry(&mut command_rx, delay).await {
            shared.set_state(ConnectionState::Disconnected);
            return;
        }
    }
}

/// Sleep until the next attempt, answering commands meanwhile.
/// Returns true if the client asked to shut down.
async fn wait_for_retry(command_rx: &mut mpsc::Receiver<Command>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            command = command_rx.recv() => match command {
                None => return true,
                Some(command @ Command::Disconnect { .. }) => {
                    command.reject();
                    return true;
                }
                Some(command) => command.reject(),
            }
        }
    }
}

/// An accepted broker connection
struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    /// Bytes read past the CONNACK
    read_buf: BytesMut,
}

/// Open the TCP connection, send CONNECT and wait for an accepted CONNACK
async fn establish(config: &BrokerConfig) -> Result<Connection, ClientError> {
    let (host, port) = config.parse_address();

    let stream = timeout(
        config.connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;
    stream.set_nodelay(true)?;

    let (mut reader, mut writer) = stream.into_split();

    let connect = Packet::Connect(Box::new(Connect {
        client_id: config.client_id.clone(),
        clean_session: config.clean_session,
        keep_alive: config.keep_alive,
        username: config.username.clone(),
        password: config.password.as_ref().map(|p| Bytes::from(p.clone())),
        will: None,
    }));

    let mut buf = BytesMut::new();
    Encoder::new()
        .encode(&connect, &mut buf)
        .map_err(|e| ClientError::Protocol(format!("encode CONNECT: {}", e)))?;
    writer.write_all(&buf).await?;

    let decoder = decoder_for(config);
    let mut read_buf = BytesMut::with_capacity(4096);
    let packet = timeout(
        config.connect_timeout,
        read_packet(&decoder, &mut reader, &mut read_buf),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;

    match packet {
        Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
            info!(
                "Connected to broker at {} (session_present={})",
                config.address, connack.session_present
            );
        }
        Packet::ConnAck(connack) => return Err(ClientError::Rejected(connack.return_code)),
        other => {
            return Err(ClientError::Protocol(format!(
                "expected CONNACK, got {:?}",
                other.packet_type()
            )))
        }
    }

    Ok(Connection {
        reader,
        writer,
        read_buf,
    })
}

/// Read until one full packet is buffered
async fn read_packet(
    decoder: &Decoder,
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Packet, ClientError> {
    loop {
        if let Some((packet, consumed)) = decoder
            .decode(buf)
            .map_err(|e| ClientError::Protocol(e.to_string()))?
        {
            buf.advance(consumed);
            return Ok(packet);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ClientError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }
    }
}

/// Per-connection protocol state
struct Session<'a> {
    shared: &'a Shared,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    write_buf: BytesMut,
    next_packet_id: u16,
    /// Outgoing QoS 1/2 publishes awaiting PUBACK or PUBCOMP
    inflight: HashSet<u16>,
    ping_outstanding: bool,
}

impl Session<'_> {
    async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ClientError::Protocol(format!("encode: {}", e)))?;
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Next non-zero packet id not currently in flight
    fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight.contains(&id) {
                return id;
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<(), ClientError> {
        let topics: Vec<SubscribeTopic> = self
            .shared
            .subscriptions
            .filters()
            .into_iter()
            .map(|(filter, qos)| SubscribeTopic { filter, qos })
            .collect();
        if topics.is_empty() {
            return Ok(());
        }

        let count = topics.len();
        let packet_id = self.next_packet_id();
        self.send(&Packet::Subscribe(Subscribe { packet_id, topics }))
            .await?;
        debug!("Subscribed to {} topic filters", count);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        }))
        .await?;
        if let Some(id) = packet_id {
            self.inflight.insert(id);
        }
        Ok(())
    }

    /// Handle one command. Returns the completion channel of a disconnect request.
    async fn handle_command(
        &mut self,
        command: Command,
    ) -> Result<Option<oneshot::Sender<()>>, ClientError> {
        match command {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                done,
            } => {
                let result = self.publish(topic, payload, qos, retain).await;
                let _ = done.send(result.clone());
                result?;
            }
            Command::Subscribe { filter, qos } => {
                let packet_id = self.next_packet_id();
                self.send(&Packet::Subscribe(Subscribe {
                    packet_id,
                    topics: vec![SubscribeTopic { filter, qos }],
                }))
                .await?;
            }
            Command::Unsubscribe { filter } => {
                let packet_id = self.next_packet_id();
                self.send(&Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters: vec![filter],
                }))
                .await?;
            }
            Command::Disconnect { done } => return Ok(Some(done)),
        }
        Ok(None)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                };
                if !self.shared.subscriptions.dispatch(&message) {
                    (self.shared.hooks.on_unhandled)(&message);
                }

                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.send(&Packet::PubAck(PubAck { packet_id })).await?;
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        self.send(&Packet::PubRec(PubRec { packet_id })).await?;
                    }
                    _ => {}
                }
            }
            Packet::PubAck(ack) => {
                self.inflight.remove(&ack.packet_id);
            }
            Packet::PubRec(rec) => {
                self.send(&Packet::PubRel(PubRel {
                    packet_id: rec.packet_id,
                }))
                .await?;
            }
            Packet::PubRel(rel) => {
                self.send(&Packet::PubComp(PubComp {
                    packet_id: rel.packet_id,
                }))
                .await?;
            }
            Packet::PubComp(comp) => {
                self.inflight.remove(&comp.packet_id);
            }
            Packet::SubAck(suback) => {
                let rejected = suback
                    .return_codes
                    .iter()
                    .filter(|code| **code == SubscribeReturnCode::Failure)
                    .count();
                if rejected > 0 {
                    warn!(
                        "Broker rejected {} of {} subscriptions (packet {})",
                        rejected,
                        suback.return_codes.len(),
                        suback.packet_id
                    );
                } else {
                    debug!("SUBACK received for packet {}", suback.packet_id);
                }
            }
            Packet::UnsubAck(ack) => {
                debug!("UNSUBACK received for packet {}", ack.packet_id);
            }
            Packet::PingResp => {
                self.ping_outstanding = false;
            }
            Packet::Disconnect => {
                return Err(ClientError::ConnectionLost(
                    "broker sent DISCONNECT".to_string(),
                ));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected {:?} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }

    /// Send DISCONNECT and close the write side
    async fn close(&mut self) {
        if let Err(e) = self.send(&Packet::Disconnect).await {
            debug!("Failed to send DISCONNECT: {}", e);
        }
        let _ = self.writer.shutdown().await;
    }
}

/// Drive one accepted connection until it is closed or lost
async fn run_session(
    shared: &Shared,
    connection: Connection,
    command_rx: &mut mpsc::Receiver<Command>,
) -> SessionEnd {
    let Connection {
        mut reader,
        writer,
        mut read_buf,
    } = connection;

    let mut session = Session {
        shared,
        writer,
        encoder: Encoder::new(),
        write_buf: BytesMut::new(),
        next_packet_id: 1,
        inflight: HashSet::new(),
        ping_outstanding: false,
    };
    let decoder = decoder_for(&shared.config);

    if let Err(e) = session.resubscribe().await {
        return SessionEnd::Lost(e);
    }

    let keep_alive = Duration::from_secs(u64::from(shared.config.keep_alive));
    let pinging = !keep_alive.is_zero();
    let period = if pinging { keep_alive } else { Duration::from_secs(3600) };
    let mut keepalive_timer = tokio::time::interval_at(Instant::now() + period, period);

    // Set once a disconnect is requested; the session ends when nothing is in flight
    let mut closing: Option<oneshot::Sender<()>> = None;

    loop {
        // Packets may already be buffered, including ones read with the CONNACK
        loop {
            match decoder.decode(&read_buf) {
                Ok(Some((packet, consumed))) => {
                    read_buf.advance(consumed);
                    if let Err(e) = session.handle_packet(packet).await {
                        return SessionEnd::Lost(e);
                    }
                }
                Ok(None) => break,
                Err(e) => return SessionEnd::Lost(ClientError::Protocol(e.to_string())),
            }
        }

        if closing.is_some() && session.inflight.is_empty() {
            session.close().await;
            if let Some(done) = closing.take() {
                let _ = done.send(());
            }
            return SessionEnd::Closed;
        }

        tokio::select! {
            command = command_rx.recv(), if closing.is_none() => match command {
                Some(command) => match session.handle_command(command).await {
                    Ok(Some(done)) => {
                        if !session.inflight.is_empty() {
                            debug!(
                                "Waiting for {} in-flight acknowledgements before disconnect",
                                session.inflight.len()
                            );
                        }
                        closing = Some(done);
                    }
                    Ok(None) => {}
                    Err(e) => return SessionEnd::Lost(e),
                },
                None => {
                    session.close().await;
                    return SessionEnd::Closed;
                }
            },

            result = reader.read_buf(&mut read_buf) => match result {
                Ok(0) => {
                    return SessionEnd::Lost(ClientError::ConnectionLost(
                        "connection closed by broker".to_string(),
                    ))
                }
                Ok(_) => {}
                Err(e) => return SessionEnd::Lost(e.into()),
            },

            _ = keepalive_timer.tick(), if pinging => {
                if session.ping_outstanding {
                    return SessionEnd::Lost(ClientError::ConnectionLost(
                        "keep-alive timed out".to_string(),
                    ));
                }
                if let Err(e) = session.send(&Packet::PingReq).await {
                    return SessionEnd::Lost(e);
                }
                session.ping_outstanding = true;
            }
        }
    }
}
