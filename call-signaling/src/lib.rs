//! Call Signaling - one-to-one call signaling over publish/subscribe
//!
//! Participants are never connected directly. Each signaling action is a
//! small JSON envelope published to the *other* participant's private
//! channel on a shared message bus.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           SignalingClient               │
//! │  initialize / call / hangup / renew     │
//! └───────┬───────────────────────┬─────────┘
//!         ▼                       ▼
//! ┌────────────────┐      ┌────────────────┐
//! │ SessionManager │      │ EnvelopeBuilder│
//! │ (login/logout) │      │ (wire format)  │
//! └───────┬────────┘      └────────────────┘
//!         ▼
//! ┌─────────────────────────────────────────┐
//! │ SignalTransport (memory / NATS)         │
//! │   events ──▶ RenewingListener           │
//! │              (TokenRenewal loop)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use call_signaling::*;
//!
//! let factory = Arc::new(MemoryTransportFactory::new(MemoryBus::new()));
//! let client = Arc::new(SignalingClient::new(factory));
//!
//! let renewal = Arc::new(TokenRenewal::new(&client, move || current_token()));
//! let listener = Arc::new(RenewingListener::new(renewal, Arc::new(LoggingListener)));
//!
//! client
//!     .initialize(SessionConfig::new(app_id, "test_user_id", token).with_listener(listener))?
//!     .await?;
//!
//! let call_id = new_call_id();
//! let legs = client.call(UserId(4111), UserId(4222), "room_id_test", &call_id)?;
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod renewal;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use client::{LegAcks, SignalingClient};
pub use config::{SessionArgs, SessionConfig};
pub use envelope::{
    new_call_id, EnvelopeBuilder, SignalAction, SignalEnvelope, UserId, MESSAGE_VERSION,
};
pub use error::{Result, SignalError, TransportError};
pub use logging::init_tracing;
pub use renewal::{RenewOutcome, RenewingListener, TokenRenewal};
pub use session::{SessionManager, SessionState};
pub use transport::{
    Ack, ChannelType, ConnectionChangeReason, ConnectionState, LoggingListener, MemoryBus,
    MemoryTransport, MemoryTransportFactory, PublishOptions, SignalTransport,
    TransportEventListener, TransportFactory,
};

#[cfg(feature = "nats")]
pub use transport::nats::{NatsTransport, NatsTransportFactory};
