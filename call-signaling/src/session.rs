//! Session lifecycle: transport ownership and login/logout.
//!
//! A session runs from `initialize` to `deinitialize`. Within it the
//! transport handle is installed exactly once. When the session created the
//! transport it also owns login and logout; a caller-supplied transport is
//! never logged in or out by us.
//!
//! Flags live with the session they describe. A login ack that completes
//! after its session ended updates that session's state only.

use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SignalError};
use crate::transport::{detach, ready_ack, Ack, SignalTransport, TransportFactory};

/// Flags of one session, shared with its in-flight login.
#[derive(Debug, Default)]
pub struct SessionState {
    using_external_client: AtomicBool,
    logged_in: AtomicBool,
}

impl SessionState {
    fn new(external: bool) -> Self {
        Self {
            using_external_client: AtomicBool::new(external),
            logged_in: AtomicBool::new(false),
        }
    }

    pub fn is_using_external_client(&self) -> bool {
        self.using_external_client.load(Ordering::SeqCst)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn mark_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }
}

/// An initialized session.
///
/// `config.transport` is always `Some` here; `transport` is the same
/// handle, kept unwrapped for publishes.
#[derive(Clone)]
pub struct ActiveSession {
    pub config: Arc<SessionConfig>,
    pub transport: Arc<dyn SignalTransport>,
    pub state: Arc<SessionState>,
}

/// Owns the login/logout lifecycle of one signaling session at a time.
pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    active: RwLock<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            active: RwLock::new(None),
        }
    }

    /// Flags of the current session; all clear when none is active.
    pub fn state(&self) -> Arc<SessionState> {
        self.active()
            .map(|session| session.state)
            .unwrap_or_default()
    }

    /// The current session, if initialized
    pub fn active(&self) -> Option<ActiveSession> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.active().is_some()
    }

    /// Start a session.
    ///
    /// Without a transport in `config`, one is created for
    /// `(app_id, user_id, event_listener)` and logged in with `token`; the
    /// returned ack carries the login outcome. The outcome is recorded
    /// even if the ack is dropped. Creation failures return `Err` before
    /// any login is attempted. With a caller-supplied transport no login
    /// happens and the ack is already resolved.
    ///
    /// Calling again while a session is active keeps the existing session;
    /// login is only re-issued if it has not succeeded yet.
    pub fn initialize(&self, mut config: SessionConfig) -> Result<Ack> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = active.as_ref() {
            warn!(
                user_id = %existing.config.user_id,
                "Session already initialized, keeping existing transport"
            );
            if existing.state.is_using_external_client() {
                return Ok(ready_ack(Ok(())));
            }
            return Ok(Self::login(existing));
        }

        if let Some(transport) = config.transport.clone() {
            info!(app_id = %config.app_id, user_id = %config.user_id, "Initializing with external transport");
            *active = Some(ActiveSession {
                config: Arc::new(config),
                transport,
                state: Arc::new(SessionState::new(true)),
            });
            return Ok(ready_ack(Ok(())));
        }

        let transport = self.factory.create(
            &config.app_id,
            &config.user_id,
            Arc::clone(&config.event_listener),
        )?;
        config.transport = Some(Arc::clone(&transport));

        info!(app_id = %config.app_id, user_id = %config.user_id, "Initializing with owned transport");

        let session = ActiveSession {
            config: Arc::new(config),
            transport,
            state: Arc::new(SessionState::new(false)),
        };
        let ack = Self::login(&session);
        *active = Some(session);
        Ok(ack)
    }

    /// End the session.
    ///
    /// Logs out only when the session owns its transport. The session is
    /// dropped regardless of the logout outcome so the manager can be
    /// initialized again. Safe to call without a session.
    pub fn deinitialize(&self) -> Ack {
        let session = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match session {
            Some(session) if !session.state.is_using_external_client() => {
                info!(user_id = %session.config.user_id, "Logging out owned transport");
                session.transport.logout()
            }
            Some(session) => {
                debug!(user_id = %session.config.user_id, "External transport, skipping logout");
                ready_ack(Ok(()))
            }
            None => {
                debug!("Deinitialize without active session");
                ready_ack(Ok(()))
            }
        }
    }

    /// The transport of the current session
    pub fn transport(&self) -> Result<Arc<dyn SignalTransport>> {
        self.active()
            .map(|session| session.transport)
            .ok_or(SignalError::NotInitialized)
    }

    fn login(session: &ActiveSession) -> Ack {
        if session.state.is_logged_in() {
            debug!(user_id = %session.config.user_id, "Already logged in");
            return ready_ack(Ok(()));
        }

        let state = Arc::clone(&session.state);
        let user_id = session.config.user_id.clone();
        let login = session
            .transport
            .login(&session.config.token)
            .map(move |result| {
                match &result {
                    Ok(()) => {
                        state.mark_logged_in();
                        info!(user_id = %user_id, "Login succeeded");
                    }
                    Err(e) => warn!(user_id = %user_id, error = %e, "Login failed"),
                }
                result
            })
            .boxed();
        detach(login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBus, MemoryTransport, MemoryTransportFactory};

    fn manager() -> (SessionManager, Arc<MemoryTransportFactory>) {
        let factory = Arc::new(MemoryTransportFactory::new(MemoryBus::new()));
        (SessionManager::new(factory.clone()), factory)
    }

    #[tokio::test]
    async fn test_owned_transport_logs_in() {
        let (manager, factory) = manager();

        manager
            .initialize(SessionConfig::new("app", "test_user_id", "tok"))
            .unwrap()
            .await
            .unwrap();

        let transport = factory.last_created().unwrap();
        assert_eq!(transport.login_calls(), 1);
        assert_eq!(transport.current_token().as_deref(), Some("tok"));
        assert!(manager.state().is_logged_in());
        assert!(!manager.state().is_using_external_client());
    }

    #[tokio::test]
    async fn test_second_initialize_does_not_login_again() {
        let (manager, factory) = manager();

        manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap();
        manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(factory.created_count(), 1);
        assert_eq!(factory.last_created().unwrap().login_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_login_is_retried_on_reinitialize() {
        let factory = Arc::new(
            MemoryTransportFactory::new(MemoryBus::new()).with_login_rejected(true),
        );
        let manager = SessionManager::new(factory.clone());

        let err = manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::transport::memory::ERR_LOGIN_REJECTED);
        assert!(!manager.state().is_logged_in());
        assert!(manager.is_initialized());

        let _ = manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await;
        assert_eq!(factory.last_created().unwrap().login_calls(), 2);
    }

    #[test]
    fn test_creation_failure_is_immediate() {
        let (manager, factory) = manager();

        let result = manager.initialize(SessionConfig::new("", "u", "tok"));

        assert!(matches!(result, Err(SignalError::ClientCreation(_))));
        assert_eq!(factory.created_count(), 0);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_external_transport_is_not_managed() {
        let (manager, factory) = manager();
        let external = Arc::new(MemoryTransport::new(MemoryBus::new(), "app", "u"));

        manager
            .initialize(SessionConfig::new("app", "u", "tok").with_transport(external.clone()))
            .unwrap()
            .await
            .unwrap();

        assert!(manager.state().is_using_external_client());
        assert_eq!(external.login_calls(), 0);
        assert_eq!(factory.created_count(), 0);

        manager.deinitialize().await.unwrap();
        assert_eq!(external.logout_calls(), 0);
        assert!(!manager.state().is_using_external_client());
    }

    #[tokio::test]
    async fn test_owned_transport_logs_out_once() {
        let (manager, factory) = manager();

        manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap();
        manager.deinitialize().await.unwrap();
        manager.deinitialize().await.unwrap();

        assert_eq!(factory.last_created().unwrap().logout_calls(), 1);
        assert!(!manager.state().is_logged_in());
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_deinitialize_without_session() {
        let (manager, _) = manager();
        assert!(manager.deinitialize().await.is_ok());
        assert!(matches!(manager.transport(), Err(SignalError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_late_login_ack_does_not_leak_into_next_session() {
        let factory = Arc::new(
            MemoryTransportFactory::new(MemoryBus::new()).with_login_acks_deferred(true),
        );
        let manager = SessionManager::new(factory.clone());

        let first_login = manager
            .initialize(SessionConfig::new("app", "u", "tok1"))
            .unwrap();
        let first = factory.last_created().unwrap();
        manager.deinitialize().await.unwrap();

        first.release_login_acks();
        first_login.await.unwrap();
        assert!(!manager.state().is_logged_in());

        let second_login = manager
            .initialize(SessionConfig::new("app", "u", "tok2"))
            .unwrap();
        let second = factory.last_created().unwrap();
        assert_eq!(second.login_calls(), 1);
        assert!(!manager.state().is_logged_in());

        second.release_login_acks();
        second_login.await.unwrap();
        assert!(manager.state().is_logged_in());
    }

    #[tokio::test]
    async fn test_deinitialize_with_login_pending() {
        let factory = Arc::new(
            MemoryTransportFactory::new(MemoryBus::new()).with_login_acks_deferred(true),
        );
        let manager = SessionManager::new(factory.clone());

        let login = manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap();
        let transport = factory.last_created().unwrap();

        manager.deinitialize().await.unwrap();
        assert_eq!(transport.logout_calls(), 1);
        assert!(!manager.is_initialized());

        transport.release_login_acks();
        assert!(login.await.is_ok());
        assert!(!manager.is_initialized());
        assert!(!manager.state().is_logged_in());
    }

    #[tokio::test]
    async fn test_dropped_login_ack_is_still_recorded() {
        let (manager, _) = manager();

        drop(manager.initialize(SessionConfig::new("app", "u", "tok")).unwrap());

        assert!(manager.state().is_logged_in());
    }

    #[tokio::test]
    async fn test_dropped_pending_login_ack_is_recorded_on_completion() {
        let factory = Arc::new(
            MemoryTransportFactory::new(MemoryBus::new()).with_login_acks_deferred(true),
        );
        let manager = SessionManager::new(factory.clone());

        drop(manager.initialize(SessionConfig::new("app", "u", "tok")).unwrap());
        assert!(!manager.state().is_logged_in());

        factory.last_created().unwrap().release_login_acks();
        for _ in 0..100 {
            if manager.state().is_logged_in() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(manager.state().is_logged_in());
    }

    #[tokio::test]
    async fn test_external_session_survives_previous_deinitialize() {
        let (manager, factory) = manager();

        manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap();
        let logout = manager.deinitialize();

        let external = Arc::new(MemoryTransport::new(MemoryBus::new(), "app", "u"));
        manager
            .initialize(SessionConfig::new("app", "u", "tok").with_transport(external.clone()))
            .unwrap()
            .await
            .unwrap();
        logout.await.unwrap();

        assert!(manager.state().is_using_external_client());
        manager.deinitialize().await.unwrap();
        assert_eq!(external.logout_calls(), 0);
        assert_eq!(factory.last_created().unwrap().logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_reinitialize_after_deinitialize() {
        let (manager, factory) = manager();

        manager
            .initialize(SessionConfig::new("app", "u", "tok"))
            .unwrap()
            .await
            .unwrap();
        manager.deinitialize().await.unwrap();
        manager
            .initialize(SessionConfig::new("app", "u", "tok2"))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(factory.created_count(), 2);
        let transport = factory.last_created().unwrap();
        assert_eq!(transport.login_calls(), 1);
        assert_eq!(transport.current_token().as_deref(), Some("tok2"));
    }
}
