//! Transport client abstraction layer.
//!
//! The signaling layer never talks to a message bus directly. It drives a
//! [`SignalTransport`] through this trait seam:
//! - In-memory bus for tests and local runs
//! - NATS (optional `nats` feature)
//!
//! Every operation *issues* its work when called and hands back an [`Ack`]
//! that resolves once the transport reports the outcome. Two publishes
//! called back-to-back are therefore in flight together, in program order.

pub mod memory;

#[cfg(feature = "nats")]
pub mod nats;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::error::{Result, TransportError};

pub use memory::{Delivery, MemoryBus, MemoryTransport, MemoryTransportFactory};

/// Completion of a single transport operation.
pub type Ack = BoxFuture<'static, std::result::Result<(), TransportError>>;

/// An ack that has already resolved with `result`.
pub fn ready_ack(result: std::result::Result<(), TransportError>) -> Ack {
    futures::future::ready(result).boxed()
}

/// A background task driving an ack panicked or was cancelled
pub const ERR_TASK: i32 = -20004;

/// Run `work` on `runtime` now and return its outcome as an ack.
pub(crate) fn spawn_ack<F>(runtime: &Handle, work: F) -> Ack
where
    F: Future<Output = std::result::Result<(), TransportError>> + Send + 'static,
{
    runtime
        .spawn(work)
        .map(|joined| joined.unwrap_or_else(|e| Err(TransportError::new(ERR_TASK, e.to_string()))))
        .boxed()
}

/// Drive `ack` to completion whether or not the returned ack is polled.
///
/// An ack that is already complete resolves here; otherwise it is spawned
/// on the current tokio runtime. Outside a runtime `ack` is returned as is
/// and only completes when polled.
pub(crate) fn detach(mut ack: Ack) -> Ack {
    if let Some(result) = (&mut ack).now_or_never() {
        return ready_ack(result);
    }
    match Handle::try_current() {
        Ok(runtime) => spawn_ack(&runtime, ack),
        Err(_) => ack,
    }
}

/// Delivery scope of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// Shared message channel
    Message,
    /// Per-user private channel, addressed by user id
    User,
}

/// Options attached to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    pub channel_type: ChannelType,
}

impl PublishOptions {
    /// User-addressed delivery, used for every signaling envelope
    pub fn user() -> Self {
        Self {
            channel_type: ChannelType::User,
        }
    }
}

/// Connection state reported by a transport client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Why the connection state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionChangeReason {
    Connecting,
    LoginSuccess,
    Interrupted,
    LoginFailure,
    Logout,
    InvalidToken,
    TokenExpired,
    ServerError,
}

/// Notifications a transport client delivers to the application.
///
/// Handlers run on the transport's event context. A handler may block
/// (token renewal does), so transports must not starve other event delivery
/// while one handler is running.
pub trait TransportEventListener: Send + Sync {
    /// Connection state changed
    fn on_connection_state_changed(
        &self,
        _channel_name: &str,
        _state: ConnectionState,
        _reason: ConnectionChangeReason,
    ) {
    }

    /// The current credential will expire soon
    fn on_token_will_expire(&self, _channel_name: &str) {}
}

/// Listener that only logs notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl TransportEventListener for LoggingListener {
    fn on_connection_state_changed(
        &self,
        channel_name: &str,
        state: ConnectionState,
        reason: ConnectionChangeReason,
    ) {
        info!(channel = channel_name, ?state, ?reason, "Connection state changed");
    }

    fn on_token_will_expire(&self, channel_name: &str) {
        warn!(channel = channel_name, "Token will expire");
    }
}

/// A connected publish/subscribe client.
pub trait SignalTransport: Send + Sync {
    /// The identity this client was created for
    fn user_id(&self) -> &str;

    /// Log in with `token`
    fn login(&self, token: &str) -> Ack;

    /// Log out
    fn logout(&self) -> Ack;

    /// Publish `payload` to `target_user_id`
    fn publish(&self, target_user_id: &str, payload: Bytes, options: PublishOptions) -> Ack;

    /// Replace the credential on the live connection
    fn renew_token(&self, token: &str) -> Ack;
}

/// Constructs transport clients for sessions that do not bring their own.
pub trait TransportFactory: Send + Sync {
    /// Create a client scoped to `(app_id, user_id)`.
    ///
    /// Must fail immediately, without network activity, when the identity
    /// is unusable.
    fn create(
        &self,
        app_id: &str,
        user_id: &str,
        listener: Arc<dyn TransportEventListener>,
    ) -> Result<Arc<dyn SignalTransport>>;
}
