//! SignalingClient - public operation surface.
//!
//! Every call action is two independent publishes ("legs"), one to each
//! participant's private channel:
//!
//! ```text
//!   call(A, B)                       hangup(A, rA, B, rB)
//!   leg a: {from A, remote B} -> B   leg a: {from A, reason rB} -> B
//!   leg b: {from B, remote A} -> A   leg b: {from B, reason rA} -> A
//! ```
//!
//! Leg `a` is issued before leg `b`. Their outcomes are reported separately
//! and a failed leg never affects the other.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::envelope::{EnvelopeBuilder, SignalAction, SignalEnvelope, UserId};
use crate::error::{Result, SignalError, TransportError};
use crate::session::{ActiveSession, SessionManager, SessionState};
use crate::transport::{Ack, PublishOptions, TransportFactory};

/// Outcomes of the two legs of a call action.
pub struct LegAcks {
    /// Envelope from A published to B's channel
    pub a: Ack,
    /// Envelope from B published to A's channel
    pub b: Ack,
}

impl LegAcks {
    /// Split into the two independent acks
    pub fn into_parts(self) -> (Ack, Ack) {
        (self.a, self.b)
    }

    /// Deliver each leg's outcome to its own callback.
    ///
    /// Spawns one task per leg on the current tokio runtime; callbacks may
    /// fire in either order.
    pub fn on_complete<FA, FB>(self, callback_a: FA, callback_b: FB)
    where
        FA: FnOnce(std::result::Result<(), TransportError>) + Send + 'static,
        FB: FnOnce(std::result::Result<(), TransportError>) + Send + 'static,
    {
        let LegAcks { a, b } = self;
        tokio::spawn(async move { callback_a(a.await) });
        tokio::spawn(async move { callback_b(b.await) });
    }
}

/// Peer-to-peer call signaling over a publish/subscribe transport.
///
/// # Example
///
/// ```rust,ignore
/// use call_signaling::{SignalingClient, SessionConfig, MemoryBus, MemoryTransportFactory};
///
/// let client = SignalingClient::new(Arc::new(MemoryTransportFactory::new(MemoryBus::new())));
/// client.initialize(SessionConfig::new(app_id, "test_user_id", token))?.await?;
///
/// let legs = client.call(4111.into(), 4222.into(), "room_id_test", &new_call_id())?;
/// legs.on_complete(
///     |res| tracing::info!(?res, "call, userIdA"),
///     |res| tracing::info!(?res, "call, userIdB"),
/// );
/// ```
pub struct SignalingClient {
    session: SessionManager,
}

impl SignalingClient {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            session: SessionManager::new(factory),
        }
    }

    /// Start the session. See [`SessionManager::initialize`].
    pub fn initialize(&self, config: SessionConfig) -> Result<Ack> {
        self.session.initialize(config)
    }

    /// End the session. See [`SessionManager::deinitialize`].
    pub fn deinitialize(&self) -> Ack {
        self.session.deinitialize()
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_initialized()
    }

    /// Flags of the current session
    pub fn session_state(&self) -> Arc<SessionState> {
        self.session.state()
    }

    /// Invite both participants to the same call.
    pub fn call(
        &self,
        user_a: UserId,
        user_b: UserId,
        room_id: &str,
        call_id: &str,
    ) -> Result<LegAcks> {
        info!(user_a = %user_a, user_b = %user_b, room_id, call_id, "call, start");

        let session = self.publishing_session()?;
        let builder = EnvelopeBuilder::new(room_id, call_id)
            .with_extension(session.config.extension.as_ref());

        let to_b = builder.invite(user_a, user_b);
        let to_a = builder.invite(user_b, user_a);
        let legs = Self::publish_legs(&session, user_a, to_b, user_b, to_a)?;

        info!(user_a = %user_a, user_b = %user_b, room_id, call_id, "call, end");
        Ok(legs)
    }

    /// Tell both participants the call ended.
    ///
    /// Each participant receives the *other* side's reason: the envelope to
    /// B carries `reason_b`, the envelope to A carries `reason_a`.
    pub fn hangup(
        &self,
        user_a: UserId,
        reason_a: &str,
        user_b: UserId,
        reason_b: &str,
        room_id: &str,
        call_id: &str,
    ) -> Result<LegAcks> {
        info!(user_a = %user_a, user_b = %user_b, room_id, call_id, "hangup, start");

        let session = self.publishing_session()?;
        let builder = EnvelopeBuilder::new(room_id, call_id)
            .with_extension(session.config.extension.as_ref());

        let to_b = builder.hangup(user_a, reason_b);
        let to_a = builder.hangup(user_b, reason_a);
        let legs = Self::publish_legs(&session, user_a, to_b, user_b, to_a)?;

        info!(user_a = %user_a, user_b = %user_b, room_id, call_id, "hangup, end");
        Ok(legs)
    }

    /// Hand a new credential to the transport.
    ///
    /// The token recorded at `initialize` is left untouched; callers supply
    /// the current token on every renewal.
    pub fn renew_token(&self, token: &str) -> Result<Ack> {
        let transport = self.session.transport()?;
        debug!(user_id = transport.user_id(), "Renewing token");
        Ok(transport.renew_token(token))
    }

    /// Active session, provided publishing is allowed.
    ///
    /// An owned transport must have completed login; a caller-supplied one
    /// is the caller's to log in.
    fn publishing_session(&self) -> Result<ActiveSession> {
        let session = self.session.active().ok_or(SignalError::NotInitialized)?;
        if !session.state.is_using_external_client() && !session.state.is_logged_in() {
            return Err(SignalError::NotLoggedIn);
        }
        Ok(session)
    }

    /// Serialize both envelopes, then issue leg a (to B) and leg b (to A).
    fn publish_legs(
        session: &ActiveSession,
        user_a: UserId,
        to_b: SignalEnvelope,
        user_b: UserId,
        to_a: SignalEnvelope,
    ) -> Result<LegAcks> {
        let payload_b = to_b.to_bytes()?;
        let payload_a = to_a.to_bytes()?;

        let a = session
            .transport
            .publish(&user_b.channel(), payload_b, PublishOptions::user());
        let b = session
            .transport
            .publish(&user_a.channel(), payload_a, PublishOptions::user());

        Ok(LegAcks {
            a: log_leg(a, "a", to_b.action, user_b),
            b: log_leg(b, "b", to_a.action, user_a),
        })
    }
}

fn log_leg(
    ack: Ack,
    leg: &'static str,
    action: SignalAction,
    target: UserId,
) -> Ack {
    Box::pin(async move {
        let result = ack.await;
        match &result {
            Ok(()) => debug!(leg, ?action, target = %target, "Publish acknowledged"),
            Err(e) => error!(leg, ?action, target = %target, error = %e, "Publish failed"),
        }
        result
    })
}
