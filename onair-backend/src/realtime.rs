//! Phoenix-protocol push channel over a websocket.
//!
//! Every [`PushChannel::subscribe`] opens its own socket, joins the
//! `realtime:<channel>` topic and forwards lifecycle changes and broadcasts
//! as [`ChannelSignal`]s. A lost or refused connection is rejoined with
//! exponential backoff until the subscription is released, so a later
//! `Subscribed` can follow any failure.
//!
//! | Inbound                          | Signal                   |
//! |----------------------------------|--------------------------|
//! | `phx_reply` to join, `ok`        | `Subscribed`             |
//! | `phx_reply` to join, otherwise   | `ChannelError`           |
//! | no join reply in time            | `TimedOut`               |
//! | `phx_error`                      | `ChannelError`           |
//! | `phx_close`, socket closed       | `Closed`                 |
//! | `broadcast` / other events       | `Notification`           |

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use onair_core::backend::SIGNAL_BUFFER;
use onair_core::config::parse_url;
use onair_core::{ChannelSignal, CoreError, PushChannel, PushSubscription, RealtimeConfig, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "onair::backend::realtime";

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const TOPIC_PREFIX: &str = "realtime:";

const HEARTBEAT_TOPIC: &str = "phoenix";
const PHX_JOIN: &str = "phx_join";
const PHX_LEAVE: &str = "phx_leave";
const PHX_REPLY: &str = "phx_reply";
const PHX_ERROR: &str = "phx_error";
const PHX_CLOSE: &str = "phx_close";
const HEARTBEAT: &str = "heartbeat";
const BROADCAST: &str = "broadcast";

/// Wire frame of the Phoenix channel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    fn join(topic: &str, reference: String) -> Self {
        let payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
            }
        });
        let mut message = Self::new(topic, PHX_JOIN, payload, reference.clone());
        message.join_ref = Some(reference);
        message
    }

    fn leave(topic: &str, reference: String, join_ref: &str) -> Self {
        let mut message = Self::new(topic, PHX_LEAVE, json!({}), reference);
        message.join_ref = Some(join_ref.to_string());
        message
    }

    fn heartbeat(reference: String) -> Self {
        Self::new(HEARTBEAT_TOPIC, HEARTBEAT, json!({}), reference)
    }
}

/// What an inbound frame means for the subscription
#[derive(Debug, Clone, PartialEq)]
enum Inbound {
    Ignore,
    Joined,
    Rejected(String),
    Errored,
    Closed,
    Notify { event: String, payload: Value },
}

fn classify(message: PhoenixMessage, topic: &str, join_ref: &str) -> Inbound {
    if message.topic != topic {
        return Inbound::Ignore;
    }

    match message.event.as_str() {
        PHX_REPLY => {
            if message.reference.as_deref() != Some(join_ref) {
                return Inbound::Ignore;
            }
            match message.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Inbound::Joined,
                other => Inbound::Rejected(
                    message
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .or(other)
                        .unwrap_or("unknown")
                        .to_string(),
                ),
            }
        }
        PHX_ERROR => Inbound::Errored,
        PHX_CLOSE => Inbound::Closed,
        BROADCAST => {
            let event = message
                .payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or(BROADCAST)
                .to_string();
            let payload = message.payload.get("payload").cloned().unwrap_or(Value::Null);
            Inbound::Notify { event, payload }
        }
        event if event.starts_with("phx_") || event == HEARTBEAT => Inbound::Ignore,
        event => Inbound::Notify {
            event: event.to_string(),
            payload: message.payload,
        },
    }
}

/// Push channel backed by a Phoenix realtime server.
#[derive(Debug, Clone)]
pub struct PhoenixChannel {
    channel: String,
    endpoint: Url,
    join_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    reconnect_max_delay: Duration,
}

impl PhoenixChannel {
    /// Create a channel from the realtime config.
    ///
    /// # Errors
    ///
    /// Returns an error if the realtime URL is invalid.
    pub fn new(config: &RealtimeConfig, api_key: &str) -> Result<Self, CoreError> {
        let mut endpoint = parse_url("realtime.url", &config.url)?;
        {
            let mut query = endpoint.query_pairs_mut();
            if !api_key.is_empty() {
                query.append_pair("apikey", api_key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }

        let (reconnect_delay, reconnect_max_delay) = config.reconnect_backoff();
        Ok(Self {
            channel: config.channel.clone(),
            endpoint,
            join_timeout: config.join_timeout().max(Duration::from_millis(1)),
            heartbeat_interval: config.heartbeat_interval().max(Duration::from_millis(1)),
            reconnect_delay,
            reconnect_max_delay,
        })
    }

    /// Wire topic of this channel
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}", self.channel)
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PushChannel for PhoenixChannel {
    fn name(&self) -> &str {
        &self.channel
    }

    async fn subscribe(&self) -> onair_core::Result<PushSubscription> {
        let (signals, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();

        let connection = Connection {
            endpoint: self.endpoint.clone(),
            topic: self.topic(),
            join_timeout: self.join_timeout,
            heartbeat_interval: self.heartbeat_interval,
            reconnect_delay: self.reconnect_delay,
            reconnect_max_delay: self.reconnect_max_delay,
            signals,
            cancel: cancel.clone(),
            next_ref: 0,
        };
        tokio::spawn(connection.run());

        Ok(PushSubscription::new(rx, move || cancel.cancel()))
    }
}

struct Connection {
    endpoint: Url,
    topic: String,
    join_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    reconnect_max_delay: Duration,
    signals: mpsc::Sender<ChannelSignal>,
    cancel: CancellationToken,
    next_ref: u64,
}

/// How one socket session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Unsubscribed, never reconnect
    Released,
    /// The join had been confirmed before the connection went away
    Lost,
    /// The join was never confirmed
    Failed,
}

impl SessionEnd {
    const fn after(joined: bool) -> Self {
        if joined { Self::Lost } else { Self::Failed }
    }
}

impl Connection {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn emit(&self, signal: ChannelSignal) {
        // The subscriber may already be gone
        let _ = self.signals.send(signal).await;
    }

    async fn emit_status(&self, status: SubscriptionStatus) {
        self.emit(ChannelSignal::Status(status)).await;
    }

    /// Keep the topic joined until released, rejoining with exponential backoff
    async fn run(mut self) {
        let mut delay = self.reconnect_delay;
        loop {
            match self.session().await {
                SessionEnd::Released => return,
                SessionEnd::Lost => delay = self.reconnect_delay,
                SessionEnd::Failed => {}
            }
            if self.signals.is_closed() {
                return;
            }

            debug!(target: LOG_TARGET, "Rejoining {} in {:?}", self.topic, delay);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2).min(self.reconnect_max_delay);
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let connected = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return SessionEnd::Released,
            connected = tokio_tungstenite::connect_async(self.endpoint.as_str()) => connected,
        };
        let ws = match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(target: LOG_TARGET, "Realtime connection failed: {}", e);
                self.emit_status(SubscriptionStatus::ChannelError).await;
                return SessionEnd::Failed;
            }
        };
        debug!(target: LOG_TARGET, "Connected to realtime server, joining {}", self.topic);

        let (mut sink, mut stream) = ws.split();

        let join_ref = self.next_ref();
        if let Err(e) = send(&mut sink, &PhoenixMessage::join(&self.topic, join_ref.clone())).await {
            warn!(target: LOG_TARGET, "Failed to join {}: {}", self.topic, e);
            self.emit_status(SubscriptionStatus::ChannelError).await;
            return SessionEnd::Failed;
        }

        let join_deadline = tokio::time::sleep(self.join_timeout);
        tokio::pin!(join_deadline);
        let mut joined = false;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let reference = self.next_ref();
                    let leave = PhoenixMessage::leave(&self.topic, reference, &join_ref);
                    if let Err(e) = send(&mut sink, &leave).await {
                        debug!(target: LOG_TARGET, "Failed to leave {}: {}", self.topic, e);
                    }
                    let _ = sink.close().await;
                    debug!(target: LOG_TARGET, "Left {}", self.topic);
                    return SessionEnd::Released;
                }
                () = &mut join_deadline, if !joined => {
                    warn!(target: LOG_TARGET, "No join reply for {} within {:?}", self.topic, self.join_timeout);
                    self.emit_status(SubscriptionStatus::TimedOut).await;
                    let _ = sink.close().await;
                    return SessionEnd::Failed;
                }
                _ = heartbeat.tick() => {
                    let beat = PhoenixMessage::heartbeat(self.next_ref());
                    if let Err(e) = send(&mut sink, &beat).await {
                        warn!(target: LOG_TARGET, "Heartbeat failed: {}", e);
                        self.emit_status(SubscriptionStatus::Closed).await;
                        return SessionEnd::after(joined);
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            info!(target: LOG_TARGET, "Realtime server closed the connection: {:?}", frame);
                            self.emit_status(SubscriptionStatus::Closed).await;
                            return SessionEnd::after(joined);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(target: LOG_TARGET, "Realtime connection error: {}", e);
                            self.emit_status(SubscriptionStatus::ChannelError).await;
                            return SessionEnd::after(joined);
                        }
                        None => {
                            self.emit_status(SubscriptionStatus::Closed).await;
                            return SessionEnd::after(joined);
                        }
                    };

                    let message = match serde_json::from_str::<PhoenixMessage>(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!(target: LOG_TARGET, "Ignoring malformed frame: {}", e);
                            continue;
                        }
                    };

                    match classify(message, &self.topic, &join_ref) {
                        Inbound::Ignore => {}
                        Inbound::Joined => {
                            info!(target: LOG_TARGET, "Joined {}", self.topic);
                            joined = true;
                            self.emit_status(SubscriptionStatus::Subscribed).await;
                        }
                        Inbound::Rejected(reason) => {
                            warn!(target: LOG_TARGET, "Join of {} rejected: {}", self.topic, reason);
                            self.emit_status(SubscriptionStatus::ChannelError).await;
                            let _ = sink.close().await;
                            return SessionEnd::Failed;
                        }
                        Inbound::Errored => {
                            warn!(target: LOG_TARGET, "Channel {} errored", self.topic);
                            self.emit_status(SubscriptionStatus::ChannelError).await;
                            let _ = sink.close().await;
                            return SessionEnd::after(joined);
                        }
                        Inbound::Closed => {
                            info!(target: LOG_TARGET, "Channel {} closed by server", self.topic);
                            self.emit_status(SubscriptionStatus::Closed).await;
                            let _ = sink.close().await;
                            return SessionEnd::after(joined);
                        }
                        Inbound::Notify { event, payload } => {
                            debug!(target: LOG_TARGET, "{} on {}", event, self.topic);
                            self.emit(ChannelSignal::Notification { event, payload }).await;
                        }
                    }
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &PhoenixMessage) -> crate::error::Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
