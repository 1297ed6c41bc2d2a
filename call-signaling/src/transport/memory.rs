//! In-memory transport for testing and local runs.
//!
//! `MemoryBus` plays the message bus: every publish lands in the target
//! user's inbox and in a global, ordered delivery log. Clients created by
//! `MemoryTransportFactory` share one bus.

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use super::{
    ready_ack, Ack, ConnectionChangeReason, ConnectionState, PublishOptions, SignalTransport,
    TransportEventListener, TransportFactory,
};
use crate::error::{Result, SignalError, TransportError};

/// Publish issued by a client that is not logged in
pub const ERR_NOT_LOGGED_IN: i32 = -10001;
/// Login rejected
pub const ERR_LOGIN_REJECTED: i32 = -10002;
/// Delivery to the target user failed
pub const ERR_DELIVERY_FAILED: i32 = -10003;
/// Token renewal rejected
pub const ERR_RENEW_REJECTED: i32 = -10004;

/// One payload routed through the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Publishing client's user id
    pub from: String,
    /// Target user id (the channel address)
    pub to: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

/// Shared in-process message bus
#[derive(Default)]
pub struct MemoryBus {
    inboxes: DashMap<String, Vec<Delivery>>,
    log: Mutex<Vec<Delivery>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every publish addressed to `user_id` fail
    pub fn fail_deliveries_to(&self, user_id: impl Into<String>) {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.into());
    }

    /// Payloads delivered to `user_id`, oldest first
    pub fn inbox(&self, user_id: &str) -> Vec<Delivery> {
        self.inboxes
            .get(user_id)
            .map(|inbox| inbox.clone())
            .unwrap_or_default()
    }

    /// Every successful delivery, in publish order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn deliver(&self, delivery: Delivery) -> std::result::Result<(), TransportError> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&delivery.to);
        if unreachable {
            return Err(TransportError::new(
                ERR_DELIVERY_FAILED,
                format!("user {} unreachable", delivery.to),
            ));
        }

        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery.clone());
        self.inboxes
            .entry(delivery.to.clone())
            .or_default()
            .push(delivery);
        Ok(())
    }
}

/// Transport client bound to a `MemoryBus`.
///
/// Counts lifecycle calls and supports failure injection so tests can
/// observe exactly what the signaling layer asked of its transport.
pub struct MemoryTransport {
    app_id: String,
    user_id: String,
    bus: Arc<MemoryBus>,
    listener: Option<Arc<dyn TransportEventListener>>,
    logged_in: AtomicBool,
    token: Mutex<Option<String>>,
    reject_login: AtomicBool,
    defer_login_acks: AtomicBool,
    held_login_acks: Mutex<Vec<oneshot::Sender<()>>>,
    renew_failures_remaining: AtomicU32,
    login_calls: AtomicU32,
    logout_calls: AtomicU32,
    renew_calls: AtomicU32,
}

impl MemoryTransport {
    /// Create a client without a listener (the caller-owned case).
    pub fn new(
        bus: Arc<MemoryBus>,
        app_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            user_id: user_id.into(),
            bus,
            listener: None,
            logged_in: AtomicBool::new(false),
            token: Mutex::new(None),
            reject_login: AtomicBool::new(false),
            defer_login_acks: AtomicBool::new(false),
            held_login_acks: Mutex::new(Vec::new()),
            renew_failures_remaining: AtomicU32::new(0),
            login_calls: AtomicU32::new(0),
            logout_calls: AtomicU32::new(0),
            renew_calls: AtomicU32::new(0),
        }
    }

    /// Attach an event listener.
    pub fn with_listener(mut self, listener: Arc<dyn TransportEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Reject every login attempt.
    pub fn with_login_rejected(self, rejected: bool) -> Self {
        self.reject_login.store(rejected, Ordering::SeqCst);
        self
    }

    /// Hold login acks until [`release_login_acks`](Self::release_login_acks).
    ///
    /// The login itself takes effect immediately; only its completion is
    /// delayed, like a slow server round trip.
    pub fn with_login_acks_deferred(self, deferred: bool) -> Self {
        self.defer_login_acks.store(deferred, Ordering::SeqCst);
        self
    }

    /// Complete every held login ack.
    pub fn release_login_acks(&self) {
        let held = std::mem::take(
            &mut *self
                .held_login_acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for ack in held {
            let _ = ack.send(());
        }
    }

    /// Reject the next `count` token renewals.
    pub fn fail_next_renewals(&self, count: u32) {
        self.renew_failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// The token the client is currently authenticated with
    pub fn current_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn login_calls(&self) -> u32 {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> u32 {
        self.renew_calls.load(Ordering::SeqCst)
    }

    /// Fire the credential-expiry notification on the calling thread.
    pub fn simulate_token_expiry(&self) {
        if let Some(listener) = &self.listener {
            listener.on_token_will_expire(&self.user_id);
        }
    }

    /// Fire a connection-state notification on the calling thread.
    pub fn simulate_connection_state(
        &self,
        state: ConnectionState,
        reason: ConnectionChangeReason,
    ) {
        if let Some(listener) = &self.listener {
            listener.on_connection_state_changed(&self.user_id, state, reason);
        }
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
    }
}

impl SignalTransport for MemoryTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn login(&self, token: &str) -> Ack {
        self.login_calls.fetch_add(1, Ordering::SeqCst);

        if self.reject_login.load(Ordering::SeqCst) {
            return ready_ack(Err(TransportError::new(
                ERR_LOGIN_REJECTED,
                "login rejected",
            )));
        }

        self.set_token(token);
        self.logged_in.store(true, Ordering::SeqCst);
        self.simulate_connection_state(
            ConnectionState::Connected,
            ConnectionChangeReason::LoginSuccess,
        );

        if !self.defer_login_acks.load(Ordering::SeqCst) {
            return ready_ack(Ok(()));
        }

        let (release, released) = oneshot::channel();
        self.held_login_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(release);
        released
            .map(|outcome| {
                outcome.map_err(|_| TransportError::new(ERR_NOT_LOGGED_IN, "login ack abandoned"))
            })
            .boxed()
    }

    fn logout(&self) -> Ack {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        ready_ack(Ok(()))
    }

    fn publish(&self, target_user_id: &str, payload: Bytes, options: PublishOptions) -> Ack {
        if !self.is_logged_in() {
            return ready_ack(Err(TransportError::new(
                ERR_NOT_LOGGED_IN,
                "publish before login",
            )));
        }

        debug!(from = %self.user_id, to = target_user_id, bytes = payload.len(), "Memory publish");

        ready_ack(self.bus.deliver(Delivery {
            from: self.user_id.clone(),
            to: target_user_id.to_string(),
            payload,
            options,
        }))
    }

    fn renew_token(&self, token: &str) -> Ack {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .renew_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return ready_ack(Err(TransportError::new(
                ERR_RENEW_REJECTED,
                "renewal rejected",
            )));
        }

        self.set_token(token);
        ready_ack(Ok(()))
    }
}

/// Creates `MemoryTransport` clients on a shared bus.
pub struct MemoryTransportFactory {
    bus: Arc<MemoryBus>,
    reject_login: bool,
    defer_login_acks: bool,
    created: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus,
            reject_login: false,
            defer_login_acks: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Clients created from now on reject login.
    pub fn with_login_rejected(mut self, rejected: bool) -> Self {
        self.reject_login = rejected;
        self
    }

    /// Clients created from now on hold their login acks.
    pub fn with_login_acks_deferred(mut self, deferred: bool) -> Self {
        self.defer_login_acks = deferred;
        self
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    /// Number of clients created so far
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The most recently created client
    pub fn last_created(&self) -> Option<Arc<MemoryTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        app_id: &str,
        user_id: &str,
        listener: Arc<dyn TransportEventListener>,
    ) -> Result<Arc<dyn SignalTransport>> {
        if app_id.trim().is_empty() {
            return Err(SignalError::ClientCreation("app_id must not be empty".into()));
        }
        if user_id.trim().is_empty() {
            return Err(SignalError::ClientCreation("user_id must not be empty".into()));
        }

        let transport = Arc::new(
            MemoryTransport::new(Arc::clone(&self.bus), app_id, user_id)
                .with_listener(listener)
                .with_login_rejected(self.reject_login)
                .with_login_acks_deferred(self.defer_login_acks),
        );
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));

        Ok(transport)
    }
}
