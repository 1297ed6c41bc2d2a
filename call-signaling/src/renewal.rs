//! Token renewal on credential expiry.
//!
//! When the transport warns that the credential will expire, renewal is
//! retried until it succeeds: immediately, with no backoff and no attempt
//! cap. A session must never lose the ability to publish because its token
//! lapsed. The loop blocks the notification handler for its duration, so
//! the transport has to keep dispatching other events meanwhile.
//!
//! Only one loop runs per `TokenRenewal` at a time. The loop gives up
//! without success only when the session it renews is gone. A run that is
//! cancelled mid-flight releases the slot for the next trigger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

use crate::client::SignalingClient;
use crate::error::SignalError;
use crate::transport::{ConnectionChangeReason, ConnectionState, TransportEventListener};

/// Supplies the token to renew with, read fresh on every attempt
pub type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// How a renewal run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Transport accepted the token after `attempts` tries
    Renewed { attempts: u64 },
    /// Another run was already in progress
    AlreadyRunning,
    /// The client was dropped or deinitialized
    SessionClosed,
}

/// Unbounded renewal loop for one signaling client.
pub struct TokenRenewal {
    client: Weak<SignalingClient>,
    token_source: TokenSource,
    running: AtomicBool,
    total_attempts: AtomicU64,
}

impl TokenRenewal {
    pub fn new<F>(client: &Arc<SignalingClient>, token_source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            client: Arc::downgrade(client),
            token_source: Arc::new(token_source),
            running: AtomicBool::new(false),
            total_attempts: AtomicU64::new(0),
        }
    }

    /// Attempts made across all runs
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Renew until the transport accepts the token.
    pub async fn renew_until_success(&self) -> RenewOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Token renewal already in progress");
            return RenewOutcome::AlreadyRunning;
        }

        let _slot = RunningSlot(&self.running);
        self.run().await
    }

    /// Blocking form for synchronous notification handlers.
    pub fn renew_blocking(&self) -> RenewOutcome {
        futures::executor::block_on(self.renew_until_success())
    }

    async fn run(&self) -> RenewOutcome {
        let mut attempts = 0u64;
        loop {
            let Some(client) = self.client.upgrade() else {
                warn!(attempts, "Client dropped, stopping token renewal");
                return RenewOutcome::SessionClosed;
            };

            attempts += 1;
            self.total_attempts.fetch_add(1, Ordering::SeqCst);
            info!(attempts, "Renewing token");

            let token = (self.token_source)();
            let ack = match client.renew_token(&token) {
                Ok(ack) => ack,
                Err(SignalError::NotInitialized) => {
                    warn!(attempts, "Session closed, stopping token renewal");
                    return RenewOutcome::SessionClosed;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "Token renewal could not be issued, retrying");
                    continue;
                }
            };
            drop(client);

            match ack.await {
                Ok(()) => {
                    info!(attempts, "Token renewed");
                    return RenewOutcome::Renewed { attempts };
                }
                Err(e) => warn!(attempts, error = %e, "Token renewal failed, retrying"),
            }
        }
    }
}

/// Clears the running flag when a run ends, including by cancellation.
struct RunningSlot<'a>(&'a AtomicBool);

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Listener that renews the token whenever expiry is announced.
///
/// Other notifications, and the expiry notice itself, are forwarded to
/// `inner` first.
pub struct RenewingListener {
    renewal: Arc<TokenRenewal>,
    inner: Arc<dyn TransportEventListener>,
}

impl RenewingListener {
    pub fn new(renewal: Arc<TokenRenewal>, inner: Arc<dyn TransportEventListener>) -> Self {
        Self { renewal, inner }
    }
}

impl TransportEventListener for RenewingListener {
    fn on_connection_state_changed(
        &self,
        channel_name: &str,
        state: ConnectionState,
        reason: ConnectionChangeReason,
    ) {
        self.inner
            .on_connection_state_changed(channel_name, state, reason);
    }

    fn on_token_will_expire(&self, channel_name: &str) {
        self.inner.on_token_will_expire(channel_name);
        let outcome = self.renewal.renew_blocking();
        info!(channel = channel_name, ?outcome, "Token expiry handled");
    }
}
