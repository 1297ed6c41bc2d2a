//! NATS transport client
//!
//! Maps the signaling transport contract onto a NATS connection:
//! - login connects with the token as credential
//! - publish sends to `<prefix>.<app_id>.user.<target>`
//! - renew reconnects with the new token and swaps the connection
//! - connection events and authorization violations reach the listener
//!
//! Listener callbacks run inside the client's event task. A blocking
//! handler (token renewal) needs a multi-threaded runtime so the reconnect
//! it waits on can make progress.

use async_nats::{Client, ConnectOptions, Event, ServerError};
use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{
    ready_ack, spawn_ack, Ack, ChannelType, ConnectionChangeReason, ConnectionState, PublishOptions,
    SignalTransport, TransportEventListener, TransportFactory,
};
use crate::error::{Result, SignalError, TransportError};

/// Default subject prefix for signaling traffic
pub const DEFAULT_SUBJECT_PREFIX: &str = "signal";

/// Connection attempt timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection failures
pub const ERR_CONNECT: i32 = -20001;
/// Publish issued without a live connection
pub const ERR_NOT_CONNECTED: i32 = -20002;
/// Publish rejected by the client
pub const ERR_PUBLISH: i32 = -20003;

/// Creates NATS-backed transport clients.
pub struct NatsTransportFactory {
    url: String,
    subject_prefix: String,
    runtime: Handle,
}

impl NatsTransportFactory {
    /// Must be called from within a tokio runtime.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            runtime: Handle::current(),
        }
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }
}

impl TransportFactory for NatsTransportFactory {
    fn create(
        &self,
        app_id: &str,
        user_id: &str,
        listener: Arc<dyn TransportEventListener>,
    ) -> Result<Arc<dyn SignalTransport>> {
        for (name, value) in [("app_id", app_id), ("user_id", user_id)] {
            if value.is_empty() || value.contains(['.', '*', '>', ' ']) {
                return Err(SignalError::ClientCreation(format!(
                    "{} {:?} is not a valid subject token",
                    name, value
                )));
            }
        }

        Ok(Arc::new(self.build(app_id, user_id, listener)))
    }
}

impl NatsTransportFactory {
    fn build(
        &self,
        app_id: &str,
        user_id: &str,
        listener: Arc<dyn TransportEventListener>,
    ) -> NatsTransport {
        NatsTransport {
            url: self.url.clone(),
            subject_prefix: self.subject_prefix.clone(),
            app_id: app_id.to_string(),
            user_id: user_id.to_string(),
            listener,
            runtime: self.runtime.clone(),
            client: Arc::new(RwLock::new(None)),
        }
    }
}

/// Transport client over a NATS connection
///
/// NATS has no advance expiry warning. `on_token_will_expire` fires after
/// the server reports an authorization violation, so renewal here is
/// reactive.
pub struct NatsTransport {
    url: String,
    subject_prefix: String,
    app_id: String,
    user_id: String,
    listener: Arc<dyn TransportEventListener>,
    runtime: Handle,
    client: Arc<RwLock<Option<Client>>>,
}

impl NatsTransport {
    /// Subject a publish to `target` is sent on
    pub fn subject(&self, target: &str, channel_type: ChannelType) -> String {
        let scope = match channel_type {
            ChannelType::User => "user",
            ChannelType::Message => "message",
        };
        format!("{}.{}.{}.{}", self.subject_prefix, self.app_id, scope, target)
    }

    fn current(&self) -> Option<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connect with `token` and install the connection, replacing any
    /// previous one.
    fn connect(&self, token: &str) -> Ack {
        let url = self.url.clone();
        let name = format!("{}-{}", self.app_id, self.user_id);
        let token = token.to_string();
        let slot = Arc::clone(&self.client);
        let listener = Arc::clone(&self.listener);
        let channel = self.user_id.clone();

        spawn_ack(&self.runtime, async move {
            listener.on_connection_state_changed(
                &channel,
                ConnectionState::Connecting,
                ConnectionChangeReason::Connecting,
            );

            let events = Arc::clone(&listener);
            let event_channel = channel.clone();
            let connected = ConnectOptions::with_token(token)
                .name(&name)
                .connection_timeout(CONNECT_TIMEOUT)
                .event_callback(move |event| {
                    let listener = Arc::clone(&events);
                    let channel = event_channel.clone();
                    async move { forward_event(listener.as_ref(), &channel, event) }
                })
                .connect(url.as_str())
                .await;

            match connected {
                Ok(client) => {
                    info!(url = %url, name = %name, "Connected to NATS");
                    let previous = slot
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .replace(client);
                    drop(previous);
                    listener.on_connection_state_changed(
                        &channel,
                        ConnectionState::Connected,
                        ConnectionChangeReason::LoginSuccess,
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "NATS connect failed");
                    listener.on_connection_state_changed(
                        &channel,
                        ConnectionState::Failed,
                        ConnectionChangeReason::LoginFailure,
                    );
                    Err(TransportError::new(ERR_CONNECT, format!("Failed to connect: {}", e)))
                }
            }
        })
    }
}

impl SignalTransport for NatsTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn login(&self, token: &str) -> Ack {
        self.connect(token)
    }

    fn logout(&self) -> Ack {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(client) = client else {
            return ready_ack(Ok(()));
        };

        let listener = Arc::clone(&self.listener);
        let channel = self.user_id.clone();
        spawn_ack(&self.runtime, async move {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "Flush before logout failed");
            }
            drop(client);
            listener.on_connection_state_changed(
                &channel,
                ConnectionState::Disconnected,
                ConnectionChangeReason::Logout,
            );
            Ok(())
        })
    }

    fn publish(&self, target_user_id: &str, payload: Bytes, options: PublishOptions) -> Ack {
        let Some(client) = self.current() else {
            return ready_ack(Err(TransportError::new(ERR_NOT_CONNECTED, "not connected")));
        };

        let subject = self.subject(target_user_id, options.channel_type);
        spawn_ack(&self.runtime, async move {
            client
                .publish(subject, payload)
                .await
                .map_err(|e| TransportError::new(ERR_PUBLISH, format!("Publish failed: {}", e)))
        })
    }

    fn renew_token(&self, token: &str) -> Ack {
        self.connect(token)
    }
}

fn forward_event(listener: &dyn TransportEventListener, channel: &str, event: Event) {
    match event {
        Event::Connected => listener.on_connection_state_changed(
            channel,
            ConnectionState::Connected,
            ConnectionChangeReason::LoginSuccess,
        ),
        Event::Disconnected => listener.on_connection_state_changed(
            channel,
            ConnectionState::Reconnecting,
            ConnectionChangeReason::Interrupted,
        ),
        Event::ServerError(ServerError::AuthorizationViolation) => {
            listener.on_token_will_expire(channel)
        }
        Event::ServerError(other) => {
            warn!(channel, error = %other, "NATS server error");
            listener.on_connection_state_changed(
                channel,
                ConnectionState::Failed,
                ConnectionChangeReason::ServerError,
            )
        }
        other => debug!(channel, event = %other, "NATS event"),
    }
}
